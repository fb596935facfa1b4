use crate::util::{decode_fixed_uint64, extract_user_key};

pub const MAX_SEQUENCE_NUMBER: u64 = (1u64 << 56) - 1;

#[repr(u8)]
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub enum ValueType {
    TypeDeletion = 0,
    TypeValue = 1,
}

/// Seek trailers use the largest type so that a lookup key sorts before every
/// record of the same user key and sequence.
pub const VALUE_TYPE_FOR_SEEK: u8 = ValueType::TypeValue as u8;

pub fn pack_sequence_and_type(seq: u64, t: u8) -> u64 {
    debug_assert!(seq <= MAX_SEQUENCE_NUMBER);
    (seq << 8) | t as u64
}

pub fn extract_internal_key_footer(key: &[u8]) -> u64 {
    let l = key.len();
    assert!(l >= 8);
    decode_fixed_uint64(&key[(l - 8)..])
}

pub fn extract_sequence(key: &[u8]) -> u64 {
    extract_internal_key_footer(key) >> 8
}

pub fn extract_value_type(key: &[u8]) -> u8 {
    (extract_internal_key_footer(key) & 0xff) as u8
}

pub fn is_value_type(t: u8) -> bool {
    t <= ValueType::TypeValue as u8
}

/// A borrowed decomposition of an encoded internal key.
pub struct ParsedInternalKey<'a> {
    user_key: &'a [u8],
    pub sequence: u64,
    pub tp: u8,
}

impl<'a> ParsedInternalKey<'a> {
    pub fn new(key: &'a [u8]) -> Self {
        if key.len() < 8 {
            return Self {
                user_key: &[],
                sequence: 0,
                tp: u8::MAX,
            };
        }
        let footer = extract_internal_key_footer(key);
        Self {
            user_key: extract_user_key(key),
            sequence: footer >> 8,
            tp: (footer & 0xff) as u8,
        }
    }

    pub fn valid(&self) -> bool {
        self.tp != u8::MAX && is_value_type(self.tp)
    }

    pub fn user_key(&self) -> &'a [u8] {
        self.user_key
    }
}

/// The query form of a key: `user_key || (snapshot << 8 | SEEK_TYPE)`.
/// Seeking an internal-key-ordered structure to a lookup key lands on the
/// newest record of that user key visible at `snapshot`.
pub struct LookupKey {
    data: Vec<u8>,
    user_len: usize,
}

impl LookupKey {
    pub fn new(user_key: &[u8], snapshot: u64) -> Self {
        let mut data = Vec::with_capacity(user_key.len() + 8);
        data.extend_from_slice(user_key);
        data.extend_from_slice(
            &pack_sequence_and_type(snapshot, VALUE_TYPE_FOR_SEEK).to_le_bytes(),
        );
        Self {
            data,
            user_len: user_key.len(),
        }
    }

    pub fn internal_key(&self) -> &[u8] {
        &self.data
    }

    pub fn user_key(&self) -> &[u8] {
        &self.data[..self.user_len]
    }

    pub fn sequence(&self) -> u64 {
        extract_sequence(&self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{InternalKeyComparator, KeyComparator};
    use std::cmp::Ordering;

    fn ikey(user_key: &[u8], seq: u64, tp: ValueType) -> Vec<u8> {
        let mut k = user_key.to_vec();
        k.extend_from_slice(&pack_sequence_and_type(seq, tp as u8).to_le_bytes());
        k
    }

    #[test]
    fn test_parse_internal_key() {
        let k = ikey(b"foo", 42, ValueType::TypeValue);
        let parsed = ParsedInternalKey::new(&k);
        assert!(parsed.valid());
        assert_eq!(parsed.user_key(), b"foo");
        assert_eq!(parsed.sequence, 42);
        assert_eq!(parsed.tp, ValueType::TypeValue as u8);
        assert!(!ParsedInternalKey::new(b"short").valid());
    }

    #[test]
    fn test_internal_key_ordering() {
        // Same user key: larger sequence sorts first.
        let c = InternalKeyComparator::default();
        let newer = ikey(b"k", 9, ValueType::TypeValue);
        let older = ikey(b"k", 3, ValueType::TypeDeletion);
        assert_eq!(c.compare_key(&newer, &older), Ordering::Less);
        // Different user keys: user order dominates regardless of sequence.
        let a = ikey(b"a", 1, ValueType::TypeValue);
        let b = ikey(b"b", 100, ValueType::TypeValue);
        assert_eq!(c.compare_key(&a, &b), Ordering::Less);
    }

    #[test]
    fn test_lookup_key_finds_newest_visible() {
        let c = InternalKeyComparator::default();
        let lk = LookupKey::new(b"k", 5);
        // Records at sequence > snapshot sort before the lookup key.
        assert_eq!(
            c.compare_key(&ikey(b"k", 6, ValueType::TypeValue), lk.internal_key()),
            Ordering::Less
        );
        // The record exactly at the snapshot does not sort before it.
        assert_ne!(
            c.compare_key(&ikey(b"k", 5, ValueType::TypeValue), lk.internal_key()),
            Ordering::Less
        );
        assert_eq!(lk.user_key(), b"k");
        assert_eq!(lk.sequence(), 5);
    }

    #[test]
    fn test_empty_user_key() {
        let k = ikey(b"", 1, ValueType::TypeValue);
        let parsed = ParsedInternalKey::new(&k);
        assert!(parsed.valid());
        assert!(parsed.user_key().is_empty());
    }
}
