mod error;
mod file;
pub mod file_system;
pub mod format;

pub use error::Error;
pub use file::{
    make_current_file, make_descriptor_file_name, make_info_log_file, make_lock_file,
    make_log_file, make_old_info_log_file, make_table_file_name, make_temp_file, parse_file_name,
    DbFileType,
};
#[cfg(unix)]
pub use file_system::SyncPosixFileSystem;
pub use file_system::{
    FileLock, FileSystem, InMemFileSystem, RandomAccessFile, RandomAccessFileReader,
    SequentialFile, SequentialFileReader, WritableFile, WritableFileWriter,
};
pub use format::MAX_SEQUENCE_NUMBER;

use crate::common::format::{pack_sequence_and_type, VALUE_TYPE_FOR_SEEK};
use crate::util::{decode_fixed_uint64, difference_offset, extract_user_key};
use std::cmp::Ordering;
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, Error>;

pub trait KeyComparator: Send + Sync {
    fn name(&self) -> &str;
    fn compare_key(&self, lhs: &[u8], rhs: &[u8]) -> Ordering;
    fn less_than(&self, lhs: &[u8], rhs: &[u8]) -> bool {
        self.compare_key(lhs, rhs) == Ordering::Less
    }
    fn same_key(&self, lhs: &[u8], rhs: &[u8]) -> bool {
        self.compare_key(lhs, rhs) == Ordering::Equal
    }
    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]);
    fn find_short_successor(&self, key: &mut Vec<u8>) {
        // Find first character that can be incremented
        let n = key.len();
        for i in 0..n {
            let byte = key[i];
            if byte != 0xff {
                key[i] = byte + 1;
                key.resize(i + 1, 0);
                return;
            }
        }
        // *key is a run of 0xffs.  Leave it alone.
    }
}

#[derive(Default, Clone)]
pub struct BytewiseComparator {}

impl KeyComparator for BytewiseComparator {
    fn name(&self) -> &str {
        "leveldb.BytewiseComparator"
    }

    fn compare_key(&self, lhs: &[u8], rhs: &[u8]) -> Ordering {
        lhs.cmp(rhs)
    }

    fn same_key(&self, lhs: &[u8], rhs: &[u8]) -> bool {
        lhs.eq(rhs)
    }

    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]) {
        let l = std::cmp::min(start.len(), limit.len());
        let diff_index = difference_offset(start, limit);
        if diff_index < l {
            let start_byte = start[diff_index];
            let limit_byte = limit[diff_index];
            if start_byte < limit_byte && start_byte + 1 < limit_byte {
                start[diff_index] += 1;
                start.resize(diff_index + 1, 0);
            }
        }
    }
}

/// Orders encoded internal keys: user key ascending per the user comparator,
/// then the 8-byte trailer descending, so the newest record of a user key
/// sorts first.
#[derive(Clone)]
pub struct InternalKeyComparator {
    user_comparator: Arc<dyn KeyComparator>,
    name: String,
}

impl Default for InternalKeyComparator {
    fn default() -> Self {
        InternalKeyComparator::new(Arc::new(BytewiseComparator::default()))
    }
}

impl InternalKeyComparator {
    pub fn new(user_comparator: Arc<dyn KeyComparator>) -> InternalKeyComparator {
        let mut name = "basalt.InternalKeyComparator:".to_string();
        name.push_str(user_comparator.name());
        InternalKeyComparator {
            user_comparator,
            name,
        }
    }

    pub fn get_user_comparator(&self) -> &Arc<dyn KeyComparator> {
        &self.user_comparator
    }
}

impl KeyComparator for InternalKeyComparator {
    fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    fn compare_key(&self, lhs: &[u8], rhs: &[u8]) -> Ordering {
        let mut ret = self
            .user_comparator
            .compare_key(extract_user_key(lhs), extract_user_key(rhs));
        if ret == Ordering::Equal {
            let anum = decode_fixed_uint64(&lhs[(lhs.len() - 8)..]);
            let bnum = decode_fixed_uint64(&rhs[(rhs.len() - 8)..]);
            ret = if anum > bnum {
                Ordering::Less
            } else if anum < bnum {
                Ordering::Greater
            } else {
                Ordering::Equal
            };
        }
        ret
    }

    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]) {
        let user_start = extract_user_key(start);
        let user_limit = extract_user_key(limit);
        let mut tmp = user_start.to_vec();
        self.user_comparator
            .find_shortest_separator(&mut tmp, user_limit);
        if tmp.len() < user_start.len()
            && self.user_comparator.compare_key(user_start, &tmp) == Ordering::Less
        {
            tmp.extend_from_slice(
                &pack_sequence_and_type(MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK).to_le_bytes(),
            );
            std::mem::swap(start, &mut tmp);
        }
    }

    fn find_short_successor(&self, key: &mut Vec<u8>) {
        let user_key = extract_user_key(key);
        let mut tmp = user_key.to_vec();
        self.user_comparator.find_short_successor(&mut tmp);
        if tmp.len() < user_key.len()
            && self.user_comparator.compare_key(user_key, &tmp) == Ordering::Less
        {
            tmp.extend_from_slice(
                &pack_sequence_and_type(MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK).to_le_bytes(),
            );
            std::mem::swap(key, &mut tmp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytewise_separator() {
        let mut start = b"abcdefg".to_vec();
        BytewiseComparator::default().find_shortest_separator(&mut start, b"abzz");
        assert_eq!(start, b"abd");
        assert!(start.as_slice() < &b"abzz"[..]);

        // No shortening possible when one is a prefix of the other.
        let mut start = b"ab".to_vec();
        BytewiseComparator::default().find_shortest_separator(&mut start, b"abc");
        assert_eq!(start, b"ab");
    }

    #[test]
    fn test_short_successor() {
        let mut key = b"abc".to_vec();
        BytewiseComparator::default().find_short_successor(&mut key);
        assert_eq!(key, b"b");

        let mut key = vec![0xffu8, 0xff];
        BytewiseComparator::default().find_short_successor(&mut key);
        assert_eq!(key, vec![0xffu8, 0xff]);
    }
}
