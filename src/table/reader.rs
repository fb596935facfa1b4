use crate::common::{
    Error, InternalKeyComparator, RandomAccessFileReader, Result,
};
use crate::iterator::{AsyncIterator, InternalIterator};
use crate::table::{Block, BlockHandle, BlockIter, BLOCK_TRAILER_SIZE, FOOTER_SIZE, TABLE_MAGIC};
use crate::util::{crc_unmask, decode_fixed_uint32, decode_fixed_uint64};
use async_trait::async_trait;
use std::sync::Arc;

/// Read side of the table format: loads the footer and index once, data
/// blocks on demand with checksum verification.
pub struct TableReader {
    file: Box<RandomAccessFileReader>,
    index: Arc<Block>,
    comparator: InternalKeyComparator,
}

impl TableReader {
    pub async fn open(
        file: Box<RandomAccessFileReader>,
        file_size: usize,
        comparator: InternalKeyComparator,
    ) -> Result<TableReader> {
        if file_size < FOOTER_SIZE {
            return Err(Error::Corruption(format!(
                "file {} is too short to be a table",
                file.name()
            )));
        }
        let mut footer = [0u8; FOOTER_SIZE];
        let read = file.read(file_size - FOOTER_SIZE, &mut footer).await?;
        if read != FOOTER_SIZE {
            return Err(Error::Corruption(format!(
                "truncated footer in {}",
                file.name()
            )));
        }
        if decode_fixed_uint64(&footer[16..]) != TABLE_MAGIC {
            return Err(Error::Corruption(format!(
                "bad table magic in {}",
                file.name()
            )));
        }
        let index_handle = BlockHandle::new(
            decode_fixed_uint64(&footer[..8]),
            decode_fixed_uint64(&footer[8..16]),
        );
        let index = Self::read_block_from(&file, index_handle).await?;
        Ok(TableReader {
            file,
            index,
            comparator,
        })
    }

    async fn read_block_from(
        file: &RandomAccessFileReader,
        handle: BlockHandle,
    ) -> Result<Arc<Block>> {
        let total = handle.size as usize + BLOCK_TRAILER_SIZE;
        let mut buf = vec![0u8; total];
        let read = file.read(handle.offset as usize, &mut buf).await?;
        if read != total {
            return Err(Error::Corruption(format!(
                "truncated block in {}",
                file.name()
            )));
        }
        let expected = crc_unmask(decode_fixed_uint32(&buf[handle.size as usize..]));
        buf.truncate(handle.size as usize);
        if crc32c::crc32c(&buf) != expected {
            return Err(Error::Corruption(format!(
                "block checksum mismatch in {}",
                file.name()
            )));
        }
        Ok(Arc::new(Block::decode(buf)?))
    }

    async fn read_block(&self, handle: BlockHandle) -> Result<Arc<Block>> {
        Self::read_block_from(&self.file, handle).await
    }

    /// Positions on the first entry >= `key` and returns it, or `None` when
    /// the table holds nothing at or after `key`.
    pub async fn get(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut index_iter = BlockIter::new(self.index.clone(), self.comparator.clone());
        index_iter.seek(key);
        while index_iter.valid() {
            let handle = BlockHandle::decode_from(index_iter.value())?;
            let block = self.read_block(handle).await?;
            let mut iter = BlockIter::new(block, self.comparator.clone());
            iter.seek(key);
            if iter.valid() {
                return Ok(Some((iter.key().to_vec(), iter.value().to_vec())));
            }
            // The key falls between the last entry of this block and its
            // separator; the answer is the first entry of the next block.
            index_iter.next();
        }
        Ok(None)
    }

    pub fn new_iterator(self: &Arc<TableReader>) -> Box<dyn AsyncIterator> {
        Box::new(TableIterator {
            index_iter: BlockIter::new(self.index.clone(), self.comparator.clone()),
            data_iter: None,
            status: Ok(()),
            table: self.clone(),
        })
    }
}

/// Two-level iterator over one table: the index block positions a data-block
/// iterator.
pub struct TableIterator {
    table: Arc<TableReader>,
    index_iter: BlockIter,
    data_iter: Option<BlockIter>,
    status: Result<()>,
}

impl TableIterator {
    async fn load_data_block(&mut self) -> bool {
        if !self.index_iter.valid() {
            self.data_iter = None;
            return false;
        }
        let handle = match BlockHandle::decode_from(self.index_iter.value()) {
            Ok(handle) => handle,
            Err(e) => {
                self.status = Err(e);
                self.data_iter = None;
                return false;
            }
        };
        match self.table.read_block(handle).await {
            Ok(block) => {
                self.data_iter = Some(BlockIter::new(block, self.table.comparator.clone()));
                true
            }
            Err(e) => {
                self.status = Err(e);
                self.data_iter = None;
                false
            }
        }
    }

    async fn skip_empty_blocks_forward(&mut self) {
        while !self.data_iter.as_ref().map_or(false, |i| i.valid()) {
            if self.status.is_err() || !self.index_iter.valid() {
                self.data_iter = None;
                return;
            }
            self.index_iter.next();
            if self.load_data_block().await {
                self.data_iter.as_mut().unwrap().seek_to_first();
            }
        }
    }

    async fn skip_empty_blocks_backward(&mut self) {
        while !self.data_iter.as_ref().map_or(false, |i| i.valid()) {
            if self.status.is_err() || !self.index_iter.valid() {
                self.data_iter = None;
                return;
            }
            self.index_iter.prev();
            if self.load_data_block().await {
                self.data_iter.as_mut().unwrap().seek_to_last();
            }
        }
    }
}

#[async_trait]
impl AsyncIterator for TableIterator {
    fn valid(&self) -> bool {
        self.data_iter.as_ref().map_or(false, |i| i.valid())
    }

    async fn seek(&mut self, key: &[u8]) {
        self.index_iter.seek(key);
        if self.load_data_block().await {
            self.data_iter.as_mut().unwrap().seek(key);
        }
        self.skip_empty_blocks_forward().await;
    }

    async fn seek_for_prev(&mut self, key: &[u8]) {
        self.index_iter.seek(key);
        if !self.index_iter.valid() {
            self.index_iter.seek_to_last();
        }
        if self.load_data_block().await {
            self.data_iter.as_mut().unwrap().seek_for_prev(key);
        }
        self.skip_empty_blocks_backward().await;
    }

    async fn seek_to_first(&mut self) {
        self.index_iter.seek_to_first();
        if self.load_data_block().await {
            self.data_iter.as_mut().unwrap().seek_to_first();
        }
        self.skip_empty_blocks_forward().await;
    }

    async fn seek_to_last(&mut self) {
        self.index_iter.seek_to_last();
        if self.load_data_block().await {
            self.data_iter.as_mut().unwrap().seek_to_last();
        }
        self.skip_empty_blocks_backward().await;
    }

    async fn next(&mut self) {
        self.data_iter.as_mut().unwrap().next();
        self.skip_empty_blocks_forward().await;
    }

    async fn prev(&mut self) {
        self.data_iter.as_mut().unwrap().prev();
        self.skip_empty_blocks_backward().await;
    }

    fn key(&self) -> &[u8] {
        self.data_iter.as_ref().unwrap().key()
    }

    fn value(&self) -> &[u8] {
        self.data_iter.as_ref().unwrap().value()
    }

    fn status(&self) -> Result<()> {
        match &self.status {
            Ok(()) => Ok(()),
            Err(e) => Err(e.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::format::{pack_sequence_and_type, ValueType};
    use crate::common::{FileSystem, InMemFileSystem};
    use crate::table::TableBuilder;
    use crate::util::extract_user_key;
    use std::path::PathBuf;
    use tokio::runtime::Runtime;

    fn ikey(key: &[u8], seq: u64) -> Vec<u8> {
        let mut k = key.to_vec();
        k.extend_from_slice(
            &pack_sequence_and_type(seq, ValueType::TypeValue as u8).to_le_bytes(),
        );
        k
    }

    fn build_table(fs: &InMemFileSystem, n: usize, block_size: usize) -> Arc<TableReader> {
        let r = Runtime::new().unwrap();
        let writer = fs.open_writable_file(PathBuf::from("t.ldb")).unwrap();
        let mut builder =
            TableBuilder::new(writer, InternalKeyComparator::default(), block_size);
        for i in 0..n {
            let key = format!("key-{:05}", i);
            let value = format!("value-{:05}", i);
            r.block_on(builder.add(&ikey(key.as_bytes(), 1), value.as_bytes()))
                .unwrap();
        }
        r.block_on(builder.finish()).unwrap();
        let file = fs.open_random_access_file(PathBuf::from("t.ldb")).unwrap();
        let size = file.file_size();
        Arc::new(
            r.block_on(TableReader::open(
                file,
                size,
                InternalKeyComparator::default(),
            ))
            .unwrap(),
        )
    }

    #[test]
    fn test_build_and_get() {
        let fs = InMemFileSystem::default();
        let table = build_table(&fs, 1000, 256);
        let r = Runtime::new().unwrap();
        for i in [0usize, 1, 499, 998, 999] {
            let key = format!("key-{:05}", i);
            let found = r
                .block_on(table.get(&ikey(key.as_bytes(), crate::common::MAX_SEQUENCE_NUMBER)))
                .unwrap()
                .unwrap();
            assert_eq!(extract_user_key(&found.0), key.as_bytes());
            assert_eq!(found.1, format!("value-{:05}", i).as_bytes());
        }
        // A key past the end finds nothing.
        assert!(r
            .block_on(table.get(&ikey(b"zzz", crate::common::MAX_SEQUENCE_NUMBER)))
            .unwrap()
            .is_none());
        // A probe between keys lands on the successor.
        let found = r
            .block_on(table.get(&ikey(b"key-00010x", crate::common::MAX_SEQUENCE_NUMBER)))
            .unwrap()
            .unwrap();
        assert_eq!(extract_user_key(&found.0), b"key-00011");
    }

    #[test]
    fn test_full_scan_both_directions() {
        let fs = InMemFileSystem::default();
        let table = build_table(&fs, 500, 128);
        let r = Runtime::new().unwrap();
        let mut iter = table.new_iterator();
        r.block_on(iter.seek_to_first());
        let mut count = 0;
        let mut last = vec![];
        while iter.valid() {
            let key = iter.key().to_vec();
            assert!(last.is_empty() || last < key);
            last = key;
            count += 1;
            r.block_on(iter.next());
        }
        assert_eq!(count, 500);

        r.block_on(iter.seek_to_last());
        let mut count = 0;
        while iter.valid() {
            count += 1;
            r.block_on(iter.prev());
        }
        assert_eq!(count, 500);
    }

    #[test]
    fn test_seek_for_prev() {
        let fs = InMemFileSystem::default();
        let table = build_table(&fs, 100, 128);
        let r = Runtime::new().unwrap();
        let mut iter = table.new_iterator();
        r.block_on(iter.seek_for_prev(&ikey(b"key-00050x", 0)));
        assert!(iter.valid());
        assert_eq!(extract_user_key(iter.key()), b"key-00050");
        // Before the first key: invalid.
        r.block_on(iter.seek_for_prev(&ikey(b"a", 0)));
        assert!(!iter.valid());
    }

    #[test]
    fn test_corrupt_block_detected() {
        let fs = InMemFileSystem::default();
        build_table(&fs, 100, 128);
        let mut data = fs.read_file_content(PathBuf::from("t.ldb")).unwrap();
        data[10] ^= 0x01;
        let r = Runtime::new().unwrap();
        let mut f = fs.open_writable_file(PathBuf::from("bad.ldb")).unwrap();
        r.block_on(f.append(&data)).unwrap();
        let file = fs.open_random_access_file(PathBuf::from("bad.ldb")).unwrap();
        let size = file.file_size();
        let table = r
            .block_on(TableReader::open(
                file,
                size,
                InternalKeyComparator::default(),
            ))
            .unwrap();
        let ret = r.block_on(table.get(&ikey(b"key-00000", crate::common::MAX_SEQUENCE_NUMBER)));
        assert!(matches!(ret, Err(Error::Corruption(_))));
    }
}
