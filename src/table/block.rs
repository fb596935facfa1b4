use crate::common::{Error, InternalKeyComparator, KeyComparator, Result};
use crate::iterator::InternalIterator;
use crate::util::{
    decode_fixed_uint32, get_length_prefixed_slice, put_fixed_uint32, put_length_prefixed_slice,
};
use std::cmp::Ordering;
use std::sync::Arc;

/// Serializes a run of key/value entries:
/// `(varint32 klen || key || varint32 vlen || value)* || fixed32 count`.
pub struct BlockBuilder {
    buf: Vec<u8>,
    count: u32,
}

impl Default for BlockBuilder {
    fn default() -> Self {
        Self {
            buf: vec![],
            count: 0,
        }
    }
}

impl BlockBuilder {
    /// Keys must be added in increasing order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        put_length_prefixed_slice(&mut self.buf, key);
        put_length_prefixed_slice(&mut self.buf, value);
        self.count += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn size_estimate(&self) -> usize {
        self.buf.len() + 4
    }

    pub fn finish(&mut self) -> &[u8] {
        put_fixed_uint32(&mut self.buf, self.count);
        &self.buf
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.count = 0;
    }
}

struct Entry {
    key_offset: u32,
    key_len: u32,
    value_offset: u32,
    value_len: u32,
}

/// A decoded block. Entry positions are resolved once at decode time so the
/// iterator can binary search and walk in both directions.
pub struct Block {
    data: Vec<u8>,
    entries: Vec<Entry>,
}

impl Block {
    pub fn decode(data: Vec<u8>) -> Result<Block> {
        if data.len() < 4 {
            return Err(Error::Corruption("block too small".to_string()));
        }
        let count = decode_fixed_uint32(&data[(data.len() - 4)..]) as usize;
        let limit = data.len() - 4;
        let mut entries = Vec::with_capacity(count);
        let mut offset = 0;
        for _ in 0..count {
            let key = get_length_prefixed_slice(&data[..limit], &mut offset)
                .ok_or_else(|| Error::Corruption("block entry truncated".to_string()))?;
            let key_offset = (offset - key.len()) as u32;
            let key_len = key.len() as u32;
            let value = get_length_prefixed_slice(&data[..limit], &mut offset)
                .ok_or_else(|| Error::Corruption("block entry truncated".to_string()))?;
            entries.push(Entry {
                key_offset,
                key_len,
                value_offset: (offset - value.len()) as u32,
                value_len: value.len() as u32,
            });
        }
        if offset != limit {
            return Err(Error::Corruption("block has trailing bytes".to_string()));
        }
        Ok(Block { data, entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn key(&self, idx: usize) -> &[u8] {
        let e = &self.entries[idx];
        &self.data[e.key_offset as usize..(e.key_offset + e.key_len) as usize]
    }

    fn value(&self, idx: usize) -> &[u8] {
        let e = &self.entries[idx];
        &self.data[e.value_offset as usize..(e.value_offset + e.value_len) as usize]
    }
}

pub struct BlockIter {
    block: Arc<Block>,
    comparator: InternalKeyComparator,
    // entries.len() means "invalid".
    index: usize,
}

impl BlockIter {
    pub fn new(block: Arc<Block>, comparator: InternalKeyComparator) -> Self {
        let index = block.len();
        Self {
            block,
            comparator,
            index,
        }
    }
}

impl InternalIterator for BlockIter {
    fn valid(&self) -> bool {
        self.index < self.block.len()
    }

    fn seek(&mut self, key: &[u8]) {
        self.index = lower_bound(&self.block, &self.comparator, key);
    }

    fn seek_for_prev(&mut self, key: &[u8]) {
        let idx = lower_bound(&self.block, &self.comparator, key);
        if idx < self.block.len()
            && self.comparator.compare_key(self.block.key(idx), key) == Ordering::Equal
        {
            self.index = idx;
        } else if idx == 0 {
            self.index = self.block.len();
        } else {
            self.index = idx - 1;
        }
    }

    fn seek_to_first(&mut self) {
        self.index = 0;
    }

    fn seek_to_last(&mut self) {
        self.index = if self.block.is_empty() {
            0
        } else {
            self.block.len() - 1
        };
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        self.index += 1;
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        if self.index == 0 {
            self.index = self.block.len();
        } else {
            self.index -= 1;
        }
    }

    fn key(&self) -> &[u8] {
        self.block.key(self.index)
    }

    fn value(&self) -> &[u8] {
        self.block.value(self.index)
    }
}

/// Index of the first entry whose key is >= `key`.
fn lower_bound(block: &Block, comparator: &InternalKeyComparator, key: &[u8]) -> usize {
    let mut left = 0;
    let mut right = block.len();
    while left < right {
        let mid = (left + right) / 2;
        if comparator.compare_key(block.key(mid), key) == Ordering::Less {
            left = mid + 1;
        } else {
            right = mid;
        }
    }
    left
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::format::{pack_sequence_and_type, ValueType};

    fn ikey(key: &[u8], seq: u64) -> Vec<u8> {
        let mut k = key.to_vec();
        k.extend_from_slice(
            &pack_sequence_and_type(seq, ValueType::TypeValue as u8).to_le_bytes(),
        );
        k
    }

    fn build_block(keys: &[&[u8]]) -> Arc<Block> {
        let mut builder = BlockBuilder::default();
        for (i, k) in keys.iter().enumerate() {
            builder.add(&ikey(k, 1), format!("v{}", i).as_bytes());
        }
        Arc::new(Block::decode(builder.finish().to_vec()).unwrap())
    }

    #[test]
    fn test_build_and_iterate() {
        let block = build_block(&[b"a", b"b", b"d"]);
        let mut iter = BlockIter::new(block, InternalKeyComparator::default());
        iter.seek_to_first();
        let mut seen = vec![];
        while iter.valid() {
            seen.push(crate::util::extract_user_key(iter.key()).to_vec());
            iter.next();
        }
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"d".to_vec()]);
    }

    #[test]
    fn test_seek() {
        let block = build_block(&[b"a", b"b", b"d"]);
        let mut iter = BlockIter::new(block, InternalKeyComparator::default());
        iter.seek(&ikey(b"c", crate::common::MAX_SEQUENCE_NUMBER));
        assert!(iter.valid());
        assert_eq!(crate::util::extract_user_key(iter.key()), b"d");
        iter.seek(&ikey(b"e", crate::common::MAX_SEQUENCE_NUMBER));
        assert!(!iter.valid());
    }

    #[test]
    fn test_seek_for_prev_and_prev() {
        let block = build_block(&[b"a", b"b", b"d"]);
        let mut iter = BlockIter::new(block, InternalKeyComparator::default());
        iter.seek_for_prev(&ikey(b"c", 0));
        assert!(iter.valid());
        assert_eq!(crate::util::extract_user_key(iter.key()), b"b");
        iter.prev();
        assert_eq!(crate::util::extract_user_key(iter.key()), b"a");
        iter.prev();
        assert!(!iter.valid());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Block::decode(vec![1, 2]).is_err());
        let mut builder = BlockBuilder::default();
        builder.add(b"k1234567890", b"v");
        let mut data = builder.finish().to_vec();
        // Claim an extra entry.
        let l = data.len();
        data[l - 4..].copy_from_slice(&2u32.to_le_bytes());
        assert!(Block::decode(data).is_err());
    }
}
