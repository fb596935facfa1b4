use crate::common::{InternalKeyComparator, KeyComparator, Result, WritableFileWriter};
use crate::table::{BlockBuilder, BlockHandle, FOOTER_SIZE, TABLE_MAGIC};
use crate::util::{crc_mask, put_fixed_uint32};
use crc32c::crc32c;

/// Streams internal-key-ordered entries into a table file:
/// data blocks, then an index block mapping shortened separator keys to
/// block handles, then a fixed footer.
pub struct TableBuilder {
    writer: Box<WritableFileWriter>,
    comparator: InternalKeyComparator,
    block_size: usize,
    data_block: BlockBuilder,
    index_block: BlockBuilder,
    last_key: Vec<u8>,
    num_entries: u64,
    offset: u64,
    pending_handle: BlockHandle,
    pending_index_entry: bool,
}

impl TableBuilder {
    pub fn new(
        writer: Box<WritableFileWriter>,
        comparator: InternalKeyComparator,
        block_size: usize,
    ) -> Self {
        Self {
            writer,
            comparator,
            block_size,
            data_block: BlockBuilder::default(),
            index_block: BlockBuilder::default(),
            last_key: vec![],
            num_entries: 0,
            offset: 0,
            pending_handle: BlockHandle::default(),
            pending_index_entry: false,
        }
    }

    /// Keys must arrive in strict internal-key order.
    pub async fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        debug_assert!(
            self.last_key.is_empty()
                || self.comparator.less_than(&self.last_key, key)
        );
        if self.pending_index_entry {
            // The separator only has to sit between the last key of the
            // finished block and the first key of this one.
            let mut sep = std::mem::take(&mut self.last_key);
            self.comparator.find_shortest_separator(&mut sep, key);
            let mut handle = vec![];
            self.pending_handle.encode_to(&mut handle);
            self.index_block.add(&sep, &handle);
            self.pending_index_entry = false;
        }
        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;
        self.data_block.add(key, value);
        if self.data_block.size_estimate() >= self.block_size {
            self.flush_data_block().await?;
        }
        Ok(())
    }

    async fn flush_data_block(&mut self) -> Result<()> {
        if self.data_block.is_empty() {
            return Ok(());
        }
        let handle = Self::write_block(&mut self.writer, &mut self.data_block, self.offset).await?;
        self.offset = handle.offset + handle.size + super::BLOCK_TRAILER_SIZE as u64;
        self.pending_handle = handle;
        self.pending_index_entry = true;
        Ok(())
    }

    async fn write_block(
        writer: &mut WritableFileWriter,
        block: &mut BlockBuilder,
        offset: u64,
    ) -> Result<BlockHandle> {
        let contents = block.finish();
        let handle = BlockHandle::new(offset, contents.len() as u64);
        let mut trailer = vec![];
        put_fixed_uint32(&mut trailer, crc_mask(crc32c(contents)));
        writer.append(contents).await?;
        writer.append(&trailer).await?;
        block.reset();
        Ok(handle)
    }

    pub async fn finish(&mut self) -> Result<()> {
        self.flush_data_block().await?;
        if self.pending_index_entry {
            let mut sep = std::mem::take(&mut self.last_key);
            self.comparator.find_short_successor(&mut sep);
            let mut handle = vec![];
            self.pending_handle.encode_to(&mut handle);
            self.index_block.add(&sep, &handle);
            self.pending_index_entry = false;
        }
        let index_handle =
            Self::write_block(&mut self.writer, &mut self.index_block, self.offset).await?;
        self.offset = index_handle.offset + index_handle.size + super::BLOCK_TRAILER_SIZE as u64;
        let mut footer = vec![];
        footer.extend_from_slice(&index_handle.offset.to_le_bytes());
        footer.extend_from_slice(&index_handle.size.to_le_bytes());
        footer.extend_from_slice(&TABLE_MAGIC.to_le_bytes());
        debug_assert_eq!(footer.len(), FOOTER_SIZE);
        self.writer.append(&footer).await?;
        self.offset += FOOTER_SIZE as u64;
        self.writer.sync().await?;
        Ok(())
    }

    /// Bytes written so far plus the buffered tail; exact once `finish` has
    /// run.
    pub fn file_size(&self) -> u64 {
        if self.data_block.is_empty() {
            self.offset
        } else {
            self.offset + self.data_block.size_estimate() as u64
        }
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }
}
