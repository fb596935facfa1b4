use crate::common::format::{ParsedInternalKey, ValueType};
use crate::common::{KeyComparator, Result, MAX_SEQUENCE_NUMBER};
use crate::compaction::Compaction;
use crate::iterator::AsyncIterator;
use std::sync::Arc;

/// Walks the merged compaction input and decides, record by record, what
/// survives into the outputs:
/// - a version older than another version of the same user key already at or
///   below the snapshot floor is superseded and dropped;
/// - a tombstone at or below the floor is dropped once no deeper level can
///   hold the key it shadows.
pub struct CompactionIter {
    inner: Box<dyn AsyncIterator>,
    ucmp: Arc<dyn KeyComparator>,
    smallest_snapshot: u64,
    key: Vec<u8>,
    value: Vec<u8>,
    valid: bool,
    has_current_user_key: bool,
    current_user_key: Vec<u8>,
    last_sequence_for_key: u64,
}

impl CompactionIter {
    pub fn new(
        inner: Box<dyn AsyncIterator>,
        ucmp: Arc<dyn KeyComparator>,
        smallest_snapshot: u64,
    ) -> Self {
        Self {
            inner,
            ucmp,
            smallest_snapshot,
            key: vec![],
            value: vec![],
            valid: false,
            has_current_user_key: false,
            current_user_key: vec![],
            last_sequence_for_key: MAX_SEQUENCE_NUMBER,
        }
    }

    pub async fn seek_to_first(&mut self, compaction: &mut Compaction) {
        self.inner.seek_to_first().await;
        self.next_from_input(compaction).await;
    }

    pub async fn next(&mut self, compaction: &mut Compaction) {
        self.inner.next().await;
        self.next_from_input(compaction).await;
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn status(&self) -> Result<()> {
        self.inner.status()
    }

    async fn next_from_input(&mut self, compaction: &mut Compaction) {
        self.valid = false;
        while !self.valid && self.inner.valid() {
            let drop = {
                let key = self.inner.key();
                let ikey = ParsedInternalKey::new(key);
                if !ikey.valid() {
                    // Keep corrupted records so the problem stays visible;
                    // do not treat neighbours as the same user key.
                    self.has_current_user_key = false;
                    self.last_sequence_for_key = MAX_SEQUENCE_NUMBER;
                    false
                } else {
                    if !self.has_current_user_key
                        || !self.ucmp.same_key(ikey.user_key(), &self.current_user_key)
                    {
                        self.current_user_key.clear();
                        self.current_user_key.extend_from_slice(ikey.user_key());
                        self.has_current_user_key = true;
                        self.last_sequence_for_key = MAX_SEQUENCE_NUMBER;
                    }
                    let drop = if self.last_sequence_for_key <= self.smallest_snapshot {
                        // A newer version of this user key was already kept
                        // and is visible to every live snapshot.
                        true
                    } else {
                        ikey.tp == ValueType::TypeDeletion as u8
                            && ikey.sequence <= self.smallest_snapshot
                            && compaction.is_base_level_for_key(ikey.user_key())
                    };
                    self.last_sequence_for_key = ikey.sequence;
                    drop
                }
            };
            if !drop {
                self.key.clear();
                self.key.extend_from_slice(self.inner.key());
                self.value.clear();
                self.value.extend_from_slice(self.inner.value());
                self.valid = true;
            } else {
                self.inner.next().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::format::pack_sequence_and_type;
    use crate::common::{BytewiseComparator, InternalKeyComparator};
    use crate::iterator::SyncIteratorAdapter;
    use crate::memtable::Memtable;
    use crate::options::{ImmutableDbOptions, Options};
    use crate::table::TableCache;
    use crate::util::extract_user_key;
    use crate::version::Version;
    use std::sync::Arc;
    use tokio::runtime::Runtime;

    fn empty_compaction() -> Compaction {
        let mut options = Options::default();
        options.fs = Arc::new(crate::common::InMemFileSystem::default());
        let options: Arc<ImmutableDbOptions> = Arc::new(options.into());
        let cache = Arc::new(TableCache::new(
            options.fs.clone(),
            options.db_path.clone(),
            options.comparator.clone(),
            options.max_open_files,
        ));
        let version = Arc::new(Version::new(options.clone(), cache));
        Compaction::new(
            0,
            1,
            [vec![], vec![]],
            vec![],
            version,
            options.max_file_size as u64,
            options.max_grandparent_overlap_bytes(),
            vec![],
        )
    }

    fn collect(mem: Arc<Memtable>, smallest_snapshot: u64) -> Vec<(Vec<u8>, u64, u8)> {
        let r = Runtime::new().unwrap();
        let mut compaction = empty_compaction();
        let mut iter = CompactionIter::new(
            Box::new(SyncIteratorAdapter::new(mem.new_iterator())),
            Arc::new(BytewiseComparator::default()),
            smallest_snapshot,
        );
        let mut out = vec![];
        r.block_on(iter.seek_to_first(&mut compaction));
        while iter.valid() {
            let parsed = ParsedInternalKey::new(iter.key());
            out.push((
                extract_user_key(iter.key()).to_vec(),
                parsed.sequence,
                parsed.tp,
            ));
            r.block_on(iter.next(&mut compaction));
        }
        out
    }

    #[test]
    fn test_superseded_versions_dropped() {
        let mem = Arc::new(Memtable::new(1, InternalKeyComparator::default()));
        mem.add(1, ValueType::TypeValue, b"k", b"v1");
        mem.add(2, ValueType::TypeValue, b"k", b"v2");
        mem.add(3, ValueType::TypeValue, b"k", b"v3");
        // Everything is below the floor: only the newest survives.
        let out = collect(mem, 10);
        assert_eq!(out, vec![(b"k".to_vec(), 3, ValueType::TypeValue as u8)]);
    }

    #[test]
    fn test_snapshot_floor_preserves_versions() {
        let mem = Arc::new(Memtable::new(1, InternalKeyComparator::default()));
        mem.add(1, ValueType::TypeValue, b"k", b"v1");
        mem.add(5, ValueType::TypeValue, b"k", b"v2");
        // A snapshot at 3 still needs the version at sequence 1.
        let out = collect(mem, 3);
        assert_eq!(
            out,
            vec![
                (b"k".to_vec(), 5, ValueType::TypeValue as u8),
                (b"k".to_vec(), 1, ValueType::TypeValue as u8),
            ]
        );
    }

    #[test]
    fn test_tombstone_dropped_at_base_level() {
        let mem = Arc::new(Memtable::new(1, InternalKeyComparator::default()));
        mem.add(1, ValueType::TypeValue, b"k", b"v1");
        mem.add(2, ValueType::TypeDeletion, b"k", b"");
        // No deeper level can hold "k", so the tombstone and what it
        // shadows both vanish.
        let out = collect(mem, 10);
        assert!(out.is_empty());
    }

    #[test]
    fn test_tombstone_kept_above_snapshot() {
        let mem = Arc::new(Memtable::new(1, InternalKeyComparator::default()));
        mem.add(1, ValueType::TypeValue, b"k", b"v1");
        mem.add(5, ValueType::TypeDeletion, b"k", b"");
        let out = collect(mem, 2);
        assert_eq!(
            out,
            vec![
                (b"k".to_vec(), 5, ValueType::TypeDeletion as u8),
                (b"k".to_vec(), 1, ValueType::TypeValue as u8),
            ]
        );
    }

    #[test]
    fn test_distinct_keys_all_survive() {
        let mem = Arc::new(Memtable::new(1, InternalKeyComparator::default()));
        mem.add(1, ValueType::TypeValue, b"a", b"1");
        mem.add(2, ValueType::TypeValue, b"b", b"2");
        mem.add(3, ValueType::TypeValue, b"c", b"3");
        let out = collect(mem, 10);
        assert_eq!(out.len(), 3);
    }
}
