mod block;
mod builder;
mod reader;
mod table_cache;

pub use block::{Block, BlockBuilder, BlockIter};
pub use builder::TableBuilder;
pub use reader::TableReader;
pub use table_cache::TableCache;

use crate::common::{Error, Result};
use crate::util::{get_var_uint64, put_var_uint64};

pub const TABLE_MAGIC: u64 = 0x9fc3_a55e_71d8_b042;

/// Footer layout: index handle offset (8) || index handle size (8) || magic (8).
pub const FOOTER_SIZE: usize = 24;

/// Trailer appended after every block: a masked crc32c of the block bytes.
pub const BLOCK_TRAILER_SIZE: usize = 4;

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        put_var_uint64(buf, self.offset);
        put_var_uint64(buf, self.size);
    }

    pub fn decode_from(data: &[u8]) -> Result<Self> {
        let mut offset = 0;
        let off = get_var_uint64(data, &mut offset).ok_or(Error::VarDecode("block handle"))?;
        let size = get_var_uint64(data, &mut offset).ok_or(Error::VarDecode("block handle"))?;
        Ok(Self { offset: off, size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_handle_roundtrip() {
        let handle = BlockHandle::new(1 << 40, 4096);
        let mut buf = vec![];
        handle.encode_to(&mut buf);
        assert_eq!(BlockHandle::decode_from(&buf).unwrap(), handle);
    }
}
