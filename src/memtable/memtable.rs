use crate::common::format::{LookupKey, ValueType};
use crate::common::{InternalKeyComparator, KeyComparator};
use crate::iterator::InternalIterator;
use crate::memtable::skiplist::{
    decode_node_key, Comparator, InlineSkipList, SkipListIterator,
};
use crate::util::{extract_user_key, get_var_uint32};
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

pub struct RecordComparator {
    comparator: InternalKeyComparator,
}

impl RecordComparator {
    pub fn new(comparator: InternalKeyComparator) -> Self {
        Self { comparator }
    }
}

impl Comparator for RecordComparator {
    unsafe fn compare_raw_key(&self, k1: *const u8, k2: *const u8) -> CmpOrdering {
        self.comparator
            .compare_key(decode_node_key(k1), decode_node_key(k2))
    }

    unsafe fn compare_key(&self, k1: *const u8, k2: &[u8]) -> CmpOrdering {
        self.comparator.compare_key(decode_node_key(k1), k2)
    }
}

unsafe fn decode_node_value<'a>(k: *const u8) -> &'a [u8] {
    let head = std::slice::from_raw_parts(k, 5);
    let mut offset = 0;
    let klen = get_var_uint32(head, &mut offset).unwrap() as usize;
    let value_head = std::slice::from_raw_parts(k.add(offset + klen), 5);
    let mut voffset = 0;
    let vlen = get_var_uint32(value_head, &mut voffset).unwrap() as usize;
    std::slice::from_raw_parts(k.add(offset + klen + voffset), vlen)
}

/// The in-memory ordered record set behind the write path. Records are
/// `(user_key, sequence, type, value)` tuples stored in internal-key order
/// inside an arena-backed skip list, so a memtable never shrinks; it is
/// frozen once it crosses the write buffer size and later flushed to a table
/// file.
pub struct Memtable {
    list: InlineSkipList<RecordComparator>,
    comparator: InternalKeyComparator,
    id: u64,
    /// Number of the WAL opened when this memtable was frozen. WALs below
    /// this number are obsolete once the flush of this memtable is durable.
    next_log_number: AtomicU64,
    flush_scheduled: AtomicBool,
}

impl Memtable {
    pub fn new(id: u64, comparator: InternalKeyComparator) -> Self {
        Self {
            list: InlineSkipList::new(RecordComparator::new(comparator.clone())),
            comparator,
            id,
            next_log_number: AtomicU64::new(0),
            flush_scheduled: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Single-writer entry point; the write path serializes all callers.
    pub fn add(&self, sequence: u64, tp: ValueType, key: &[u8], value: &[u8]) {
        self.list.add(key, value, sequence, tp);
    }

    /// Tri-state point lookup: `None` when the key is absent here,
    /// `Some(Some(v))` for a live value, `Some(None)` for a tombstone.
    pub fn get(&self, key: &LookupKey) -> Option<Option<Vec<u8>>> {
        let mut iter = SkipListIterator::new(&self.list);
        unsafe {
            iter.seek(key.internal_key());
            if !iter.valid() {
                return None;
            }
            let entry_key = decode_node_key(iter.key());
            let user_comparator = self.comparator.get_user_comparator();
            if !user_comparator.same_key(extract_user_key(entry_key), key.user_key()) {
                return None;
            }
            let footer = crate::common::format::extract_internal_key_footer(entry_key);
            if (footer & 0xff) as u8 == ValueType::TypeValue as u8 {
                Some(Some(decode_node_value(iter.key()).to_vec()))
            } else {
                Some(None)
            }
        }
    }

    pub fn approximate_memory_usage(&self) -> usize {
        self.list.mem_size()
    }

    pub fn new_iterator(self: &Arc<Memtable>) -> Box<dyn InternalIterator> {
        Box::new(MemtableIter {
            iter: SkipListIterator::new(&self.list),
            _mem: self.clone(),
        })
    }

    pub fn set_next_log_number(&self, num: u64) {
        self.next_log_number.store(num, Ordering::Release);
    }

    pub fn get_next_log_number(&self) -> u64 {
        self.next_log_number.load(Ordering::Acquire)
    }

    /// Returns true exactly once, for the caller that gets to flush it.
    pub fn mark_flush_scheduled(&self) -> bool {
        !self.flush_scheduled.swap(true, Ordering::SeqCst)
    }
}

pub struct MemtableIter {
    iter: SkipListIterator<RecordComparator>,
    // Pins the arena the raw iterator points into.
    _mem: Arc<Memtable>,
}

impl InternalIterator for MemtableIter {
    fn valid(&self) -> bool {
        self.iter.valid()
    }

    fn seek(&mut self, key: &[u8]) {
        unsafe { self.iter.seek(key) }
    }

    fn seek_for_prev(&mut self, key: &[u8]) {
        unsafe {
            self.iter.seek(key);
            if !self.iter.valid() {
                self.iter.seek_to_last();
            } else if self._mem.comparator.compare_key(self.key(), key) == CmpOrdering::Greater {
                self.iter.prev();
            }
        }
    }

    fn seek_to_first(&mut self) {
        unsafe { self.iter.seek_to_first() }
    }

    fn seek_to_last(&mut self) {
        unsafe { self.iter.seek_to_last() }
    }

    fn next(&mut self) {
        unsafe { self.iter.next() }
    }

    fn prev(&mut self) {
        unsafe { self.iter.prev() }
    }

    fn key(&self) -> &[u8] {
        unsafe { decode_node_key(self.iter.key()) }
    }

    fn value(&self) -> &[u8] {
        unsafe { decode_node_value(self.iter.key()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_mem() -> Arc<Memtable> {
        Arc::new(Memtable::new(1, InternalKeyComparator::default()))
    }

    #[test]
    fn test_add_get() {
        let mem = new_mem();
        mem.add(1, ValueType::TypeValue, b"foo", b"v1");
        mem.add(2, ValueType::TypeValue, b"foo", b"v2");
        mem.add(3, ValueType::TypeDeletion, b"bar", b"");

        assert_eq!(
            mem.get(&LookupKey::new(b"foo", 10)),
            Some(Some(b"v2".to_vec()))
        );
        // A snapshot below the second write sees the first.
        assert_eq!(
            mem.get(&LookupKey::new(b"foo", 1)),
            Some(Some(b"v1".to_vec()))
        );
        // Tombstones are reported, not hidden.
        assert_eq!(mem.get(&LookupKey::new(b"bar", 10)), Some(None));
        assert_eq!(mem.get(&LookupKey::new(b"baz", 10)), None);
    }

    #[test]
    fn test_empty_key_and_value() {
        let mem = new_mem();
        mem.add(1, ValueType::TypeValue, b"", b"");
        assert_eq!(mem.get(&LookupKey::new(b"", 1)), Some(Some(vec![])));
    }

    #[test]
    fn test_iterator_order() {
        let mem = new_mem();
        mem.add(3, ValueType::TypeValue, b"a", b"3");
        mem.add(1, ValueType::TypeValue, b"c", b"1");
        mem.add(2, ValueType::TypeValue, b"b", b"2");
        let mut iter = mem.new_iterator();
        iter.seek_to_first();
        let mut keys = vec![];
        while iter.valid() {
            keys.push(extract_user_key(iter.key()).to_vec());
            iter.next();
        }
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_memory_usage_grows() {
        let mem = new_mem();
        let before = mem.approximate_memory_usage();
        mem.add(1, ValueType::TypeValue, b"key", &[0u8; 1024]);
        assert!(mem.approximate_memory_usage() > before);
    }

    #[test]
    fn test_flush_scheduled_once() {
        let mem = new_mem();
        assert!(mem.mark_flush_scheduled());
        assert!(!mem.mark_flush_scheduled());
    }
}
