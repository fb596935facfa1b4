use crate::common::format::ValueType;
use crate::common::{Error, Result};
use crate::util::{
    decode_fixed_uint32, decode_fixed_uint64, get_length_prefixed_slice, put_length_prefixed_slice,
};
use bytes::BufMut;

/// `fixed64 sequence || fixed32 count` precede the records.
pub const WRITE_BATCH_HEADER: usize = 12;

/// An atomic group of updates. The encoded form is also the WAL payload:
/// every record carries a type tag, a length-prefixed key and, for puts, a
/// length-prefixed value.
pub struct WriteBatch {
    data: Vec<u8>,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBatch {
    pub fn new() -> Self {
        Self {
            data: vec![0u8; WRITE_BATCH_HEADER],
        }
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.set_count(self.count() + 1);
        self.data.put_u8(ValueType::TypeValue as u8);
        put_length_prefixed_slice(&mut self.data, key);
        put_length_prefixed_slice(&mut self.data, value);
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.set_count(self.count() + 1);
        self.data.put_u8(ValueType::TypeDeletion as u8);
        put_length_prefixed_slice(&mut self.data, key);
    }

    /// Appends all records of `other` to this batch.
    pub fn append(&mut self, other: &WriteBatch) {
        self.set_count(self.count() + other.count());
        self.data
            .extend_from_slice(&other.data[WRITE_BATCH_HEADER..]);
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.data.resize(WRITE_BATCH_HEADER, 0);
    }

    pub fn count(&self) -> u32 {
        decode_fixed_uint32(&self.data[8..])
    }

    fn set_count(&mut self, count: u32) {
        debug_assert!(count < u32::MAX);
        self.data[8..WRITE_BATCH_HEADER].copy_from_slice(&count.to_le_bytes());
    }

    pub fn approximate_size(&self) -> usize {
        self.data.len()
    }

    pub fn iter(&self) -> WriteBatchIter<'_> {
        WriteBatchIter {
            data: &self.data,
            offset: WRITE_BATCH_HEADER,
        }
    }

    /// Hands the encoded payload to the write path; the batch itself becomes
    /// empty and can be refilled after `recycle`.
    pub fn to_raw(&mut self) -> ReadOnlyWriteBatch {
        let data = std::mem::replace(&mut self.data, vec![]);
        ReadOnlyWriteBatch { data }
    }

    pub fn recycle(&mut self, mut raw: ReadOnlyWriteBatch) {
        raw.data.clear();
        raw.data.resize(WRITE_BATCH_HEADER, 0);
        self.data = raw.data;
    }
}

/// The write path's sealed view of a batch. The sequence slot is stamped by
/// the commit leader right before the payload goes to the WAL.
pub struct ReadOnlyWriteBatch {
    data: Vec<u8>,
}

impl ReadOnlyWriteBatch {
    /// Validates an encoded batch, typically one recovered from the WAL.
    pub fn try_from(data: Vec<u8>) -> Result<Self> {
        if data.len() < WRITE_BATCH_HEADER {
            return Err(Error::Corruption("write batch header too small".to_string()));
        }
        let wb = ReadOnlyWriteBatch { data };
        let count = wb.count();
        if count == u32::MAX {
            return Err(Error::Corruption("write batch count overflow".to_string()));
        }
        let mut parsed = 0;
        let mut iter = wb.iter();
        while iter.next().is_some() {
            parsed += 1;
        }
        if parsed != count || !iter.exhausted() {
            return Err(Error::Corruption(format!(
                "write batch has wrong count, expect {} got {}",
                count, parsed
            )));
        }
        Ok(wb)
    }

    pub fn count(&self) -> u32 {
        decode_fixed_uint32(&self.data[8..])
    }

    pub fn sequence(&self) -> u64 {
        decode_fixed_uint64(&self.data)
    }

    pub fn set_sequence(&mut self, sequence: u64) {
        self.data[..8].copy_from_slice(&sequence.to_le_bytes());
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn approximate_size(&self) -> usize {
        self.data.len()
    }

    pub fn iter(&self) -> WriteBatchIter<'_> {
        WriteBatchIter {
            data: &self.data,
            offset: WRITE_BATCH_HEADER,
        }
    }
}

pub enum WriteBatchItem<'a> {
    Put { key: &'a [u8], value: &'a [u8] },
    Delete { key: &'a [u8] },
}

pub struct WriteBatchIter<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> WriteBatchIter<'a> {
    /// True only when every byte of the payload was consumed cleanly.
    pub fn exhausted(&self) -> bool {
        self.offset == self.data.len()
    }
}

impl<'a> Iterator for WriteBatchIter<'a> {
    type Item = WriteBatchItem<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }
        let tag = self.data[self.offset];
        self.offset += 1;
        if tag == ValueType::TypeValue as u8 {
            let key = get_length_prefixed_slice(self.data, &mut self.offset)?;
            let value = get_length_prefixed_slice(self.data, &mut self.offset)?;
            Some(WriteBatchItem::Put { key, value })
        } else if tag == ValueType::TypeDeletion as u8 {
            let key = get_length_prefixed_slice(self.data, &mut self.offset)?;
            Some(WriteBatchItem::Delete { key })
        } else {
            // Unknown tag: stop without consuming the rest so validation
            // notices the mismatch.
            self.offset = usize::MAX;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut wb = WriteBatch::new();
        wb.put(b"a", b"1");
        wb.delete(b"b");
        wb.put(b"", b"");
        assert_eq!(wb.count(), 3);

        let mut raw = wb.to_raw();
        raw.set_sequence(42);
        let decoded = ReadOnlyWriteBatch::try_from(raw.data().to_vec()).unwrap();
        assert_eq!(decoded.sequence(), 42);
        assert_eq!(decoded.count(), 3);
        let mut iter = decoded.iter();
        assert!(matches!(
            iter.next(),
            Some(WriteBatchItem::Put { key: b"a", value: b"1" })
        ));
        assert!(matches!(iter.next(), Some(WriteBatchItem::Delete { key: b"b" })));
        assert!(
            matches!(iter.next(), Some(WriteBatchItem::Put { key, value }) if key.is_empty() && value.is_empty())
        );
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_append() {
        let mut a = WriteBatch::new();
        a.put(b"x", b"1");
        let mut b = WriteBatch::new();
        b.put(b"y", b"2");
        b.delete(b"z");
        a.append(&b);
        assert_eq!(a.count(), 3);
        assert_eq!(a.iter().count(), 3);
    }

    #[test]
    fn test_reject_bad_count() {
        let mut wb = WriteBatch::new();
        wb.put(b"k", b"v");
        let mut data = wb.to_raw().data().to_vec();
        // Claim one more record than present.
        data[8..12].copy_from_slice(&2u32.to_le_bytes());
        assert!(ReadOnlyWriteBatch::try_from(data).is_err());
    }

    #[test]
    fn test_reject_count_overflow() {
        let mut data = vec![0u8; WRITE_BATCH_HEADER];
        data[8..12].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(ReadOnlyWriteBatch::try_from(data).is_err());
    }

    #[test]
    fn test_reject_truncated_record() {
        let mut wb = WriteBatch::new();
        wb.put(b"key", b"value");
        let mut data = wb.to_raw().data().to_vec();
        data.truncate(data.len() - 2);
        assert!(ReadOnlyWriteBatch::try_from(data).is_err());
    }

    #[test]
    fn test_empty_batch() {
        let wb = WriteBatch::new();
        assert_eq!(wb.count(), 0);
        let decoded = ReadOnlyWriteBatch::try_from(wb.data.clone()).unwrap();
        assert_eq!(decoded.count(), 0);
        assert!(decoded.iter().next().is_none());
    }
}
