use crate::common::format::{pack_sequence_and_type, ValueType};
use crate::memtable::arena::ConcurrentArena;
use crate::util::{encode_var_uint32, get_var_uint32, varint_length};
use rand::{thread_rng, RngCore};
use std::cmp::Ordering as CmpOrdering;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

pub const MAX_HEIGHT: usize = 12;
const BRANCHING_FACTOR: u32 = 4;

/// Compares keys stored inline in skip-list nodes. `k1` points at an encoded
/// record (`varint32 len || internal_key || ...`); `k2` is a bare internal key.
pub trait Comparator: Send + Sync {
    unsafe fn compare_raw_key(&self, k1: *const u8, k2: *const u8) -> CmpOrdering;
    unsafe fn compare_key(&self, k1: *const u8, k2: &[u8]) -> CmpOrdering;
}

/// Reads the internal key out of an encoded node payload.
pub unsafe fn decode_node_key<'a>(k: *const u8) -> &'a [u8] {
    let head = std::slice::from_raw_parts(k, 5);
    let mut offset = 0;
    let l = get_var_uint32(head, &mut offset).unwrap();
    std::slice::from_raw_parts(k.add(offset), l as usize)
}

// The tower of forward pointers is laid out *before* the node in memory:
// next[0] is the struct field, level i lives at negative offset i. The key
// payload follows the struct.
#[repr(C)]
struct Node {
    next: [AtomicPtr<Node>; 1],
}

impl Node {
    unsafe fn key(&self) -> *const u8 {
        (self.next.as_ptr() as *const u8).add(std::mem::size_of::<AtomicPtr<Node>>())
    }

    unsafe fn get_next(&self, level: usize) -> *mut Node {
        (*self.next.as_ptr().sub(level)).load(Ordering::Acquire)
    }

    unsafe fn set_next(&self, level: usize, x: *mut Node) {
        (*self.next.as_ptr().sub(level)).store(x, Ordering::Release)
    }

    unsafe fn no_barrier_set_next(&self, level: usize, x: *mut Node) {
        (*self.next.as_ptr().sub(level)).store(x, Ordering::Relaxed)
    }
}

/// An ordered set of encoded records supporting one writer and any number of
/// concurrent readers. Writers must be serialized externally; after `add`
/// returns, readers observe the new record. Nodes are never removed.
pub struct InlineSkipList<C: Comparator> {
    arena: ConcurrentArena,
    head: *mut Node,
    max_height: AtomicUsize,
    cmp: C,
}

unsafe impl<C: Comparator> Send for InlineSkipList<C> {}
unsafe impl<C: Comparator> Sync for InlineSkipList<C> {}

impl<C: Comparator> InlineSkipList<C> {
    pub fn new(cmp: C) -> Self {
        let arena = ConcurrentArena::default();
        let head = unsafe {
            let prefix = std::mem::size_of::<AtomicPtr<Node>>() * (MAX_HEIGHT - 1);
            // One byte of zeroed payload doubles as an empty varint key.
            let addr = arena.allocate(prefix + std::mem::size_of::<Node>() + 1);
            addr.add(prefix) as *mut Node
        };
        Self {
            arena,
            head,
            max_height: AtomicUsize::new(1),
            cmp,
        }
    }

    pub fn mem_size(&self) -> usize {
        self.arena.mem_size()
    }

    fn random_height(&self) -> usize {
        let mut height = 1;
        let mut rng = thread_rng();
        while height < MAX_HEIGHT && rng.next_u32() % BRANCHING_FACTOR == 0 {
            height += 1;
        }
        height
    }

    pub fn add(&self, key: &[u8], value: &[u8], sequence: u64, tp: ValueType) {
        unsafe {
            let (height, node) = self.encode_key_value(key, value, sequence, tp);
            self.insert(node, height);
        }
    }

    /// Lock-free; safe to call while the writer inserts.
    pub fn contains(&self, internal_key: &[u8]) -> bool {
        unsafe {
            let node = self.find_greater_or_equal(internal_key, None);
            !node.is_null()
                && self.cmp.compare_key((*node).key(), internal_key) == CmpOrdering::Equal
        }
    }

    /// Caller guarantees it is the only writer and that no equal internal key
    /// has been inserted before.
    unsafe fn insert(&self, x: *mut Node, height: usize) {
        let key = decode_node_key((*x).key());
        let mut prev = [null_mut(); MAX_HEIGHT + 1];
        self.find_greater_or_equal(key, Some(&mut prev));

        let list_height = self.max_height.load(Ordering::Relaxed);
        if height > list_height {
            for p in prev.iter_mut().take(height).skip(list_height) {
                *p = self.head;
            }
            // Readers that observe the new height before the pointer stores
            // below will find null at the upper levels and drop down a level,
            // which is safe.
            self.max_height.store(height, Ordering::Relaxed);
        }
        for i in 0..height {
            (*x).no_barrier_set_next(i, (*prev[i]).get_next(i));
            (*prev[i]).set_next(i, x);
        }
    }

    unsafe fn encode_key_value(
        &self,
        key: &[u8],
        value: &[u8],
        sequence: u64,
        tp: ValueType,
    ) -> (usize, *mut Node) {
        let internal_key_size = key.len() + 8;
        let encoded_len = varint_length(internal_key_size as u64)
            + internal_key_size
            + varint_length(value.len() as u64)
            + value.len();
        let height = self.random_height();
        let prefix = std::mem::size_of::<AtomicPtr<Node>>() * (height - 1);
        let addr = self
            .arena
            .allocate(prefix + std::mem::size_of::<Node>() + encoded_len);
        let key_addr = addr.add(prefix + std::mem::size_of::<Node>());
        let data = std::slice::from_raw_parts_mut(key_addr, encoded_len);
        let mut offset = encode_var_uint32(data, internal_key_size as u32);
        data[offset..(offset + key.len())].copy_from_slice(key);
        offset += key.len();
        data[offset..(offset + 8)]
            .copy_from_slice(&pack_sequence_and_type(sequence, tp as u8).to_le_bytes());
        offset += 8;
        offset += encode_var_uint32(&mut data[offset..], value.len() as u32);
        data[offset..(offset + value.len())].copy_from_slice(value);
        (height, addr.add(prefix) as *mut Node)
    }

    unsafe fn key_is_after_node(&self, key: &[u8], x: *mut Node) -> bool {
        !x.is_null() && self.cmp.compare_key((*x).key(), key) == CmpOrdering::Less
    }

    /// First node whose key is >= `key`, filling `prev` with the rightmost
    /// node before it at every level when requested.
    unsafe fn find_greater_or_equal(
        &self,
        key: &[u8],
        mut prev: Option<&mut [*mut Node; MAX_HEIGHT + 1]>,
    ) -> *mut Node {
        let mut x = self.head;
        let mut level = self.max_height.load(Ordering::Relaxed) - 1;
        loop {
            let next = (*x).get_next(level);
            if self.key_is_after_node(key, next) {
                x = next;
            } else {
                if let Some(prev) = prev.as_deref_mut() {
                    prev[level] = x;
                }
                if level == 0 {
                    return next;
                }
                level -= 1;
            }
        }
    }

    /// Last node whose key is < `key`, or the head if there is none.
    unsafe fn find_less_than(&self, key: &[u8]) -> *mut Node {
        let mut x = self.head;
        let mut level = self.max_height.load(Ordering::Relaxed) - 1;
        loop {
            let next = (*x).get_next(level);
            if next.is_null() || self.cmp.compare_key((*next).key(), key) != CmpOrdering::Less {
                if level == 0 {
                    return x;
                }
                level -= 1;
            } else {
                x = next;
            }
        }
    }

    unsafe fn find_last(&self) -> *mut Node {
        let mut x = self.head;
        let mut level = self.max_height.load(Ordering::Relaxed) - 1;
        loop {
            let next = (*x).get_next(level);
            if next.is_null() {
                if level == 0 {
                    return x;
                }
                level -= 1;
            } else {
                x = next;
            }
        }
    }
}

pub struct SkipListIterator<C: Comparator> {
    list: *const InlineSkipList<C>,
    node: *mut Node,
}

unsafe impl<C: Comparator> Send for SkipListIterator<C> {}

impl<C: Comparator> SkipListIterator<C> {
    pub fn new(list: *const InlineSkipList<C>) -> Self {
        Self {
            list,
            node: null_mut(),
        }
    }

    pub fn valid(&self) -> bool {
        !self.node.is_null()
    }

    /// Pointer to the encoded record of the current node.
    pub unsafe fn key(&self) -> *const u8 {
        (*self.node).key()
    }

    pub unsafe fn seek(&mut self, key: &[u8]) {
        self.node = (*self.list).find_greater_or_equal(key, None);
    }

    pub unsafe fn seek_to_first(&mut self) {
        self.node = (*(*self.list).head).get_next(0);
    }

    pub unsafe fn seek_to_last(&mut self) {
        let node = (*self.list).find_last();
        self.node = if node == (*self.list).head {
            null_mut()
        } else {
            node
        };
    }

    pub unsafe fn next(&mut self) {
        self.node = (*self.node).get_next(0);
    }

    pub unsafe fn prev(&mut self) {
        let key = decode_node_key((*self.node).key());
        let node = (*self.list).find_less_than(key);
        self.node = if node == (*self.list).head {
            null_mut()
        } else {
            node
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::InternalKeyComparator;
    use crate::memtable::memtable::RecordComparator;

    fn new_list() -> InlineSkipList<RecordComparator> {
        InlineSkipList::new(RecordComparator::new(InternalKeyComparator::default()))
    }

    fn internal_key(key: &[u8], seq: u64, tp: ValueType) -> Vec<u8> {
        let mut ik = key.to_vec();
        ik.extend_from_slice(&pack_sequence_and_type(seq, tp as u8).to_le_bytes());
        ik
    }

    #[test]
    fn test_insert_and_seek() {
        let list = new_list();
        for (i, k) in [b"b", b"d", b"f"].iter().enumerate() {
            list.add(*k, b"v", i as u64 + 1, ValueType::TypeValue);
        }
        let mut iter = SkipListIterator::new(&list);
        unsafe {
            iter.seek_to_first();
            assert!(iter.valid());
            assert_eq!(
                decode_node_key(iter.key()),
                internal_key(b"b", 1, ValueType::TypeValue).as_slice()
            );
            // First key >= target.
            iter.seek(&internal_key(b"c", crate::common::MAX_SEQUENCE_NUMBER, ValueType::TypeValue));
            assert!(iter.valid());
            assert_eq!(
                decode_node_key(iter.key()),
                internal_key(b"d", 2, ValueType::TypeValue).as_slice()
            );
            iter.next();
            assert_eq!(
                decode_node_key(iter.key()),
                internal_key(b"f", 3, ValueType::TypeValue).as_slice()
            );
            iter.next();
            assert!(!iter.valid());
        }
    }

    #[test]
    fn test_contains() {
        let list = new_list();
        list.add(b"k", b"v", 7, ValueType::TypeValue);
        assert!(list.contains(&internal_key(b"k", 7, ValueType::TypeValue)));
        assert!(!list.contains(&internal_key(b"k", 8, ValueType::TypeValue)));
        assert!(!list.contains(&internal_key(b"j", 7, ValueType::TypeValue)));
    }

    #[test]
    fn test_newest_record_sorts_first() {
        let list = new_list();
        list.add(b"k", b"v1", 1, ValueType::TypeValue);
        list.add(b"k", b"v2", 2, ValueType::TypeValue);
        let mut iter = SkipListIterator::new(&list);
        unsafe {
            iter.seek_to_first();
            assert_eq!(
                decode_node_key(iter.key()),
                internal_key(b"k", 2, ValueType::TypeValue).as_slice()
            );
            iter.next();
            assert_eq!(
                decode_node_key(iter.key()),
                internal_key(b"k", 1, ValueType::TypeValue).as_slice()
            );
        }
    }

    #[test]
    fn test_prev_and_seek_to_last() {
        let list = new_list();
        for (i, k) in [b"a", b"m", b"z"].iter().enumerate() {
            list.add(*k, b"v", i as u64 + 1, ValueType::TypeValue);
        }
        let mut iter = SkipListIterator::new(&list);
        unsafe {
            iter.seek_to_last();
            assert!(iter.valid());
            assert_eq!(
                decode_node_key(iter.key()),
                internal_key(b"z", 3, ValueType::TypeValue).as_slice()
            );
            iter.prev();
            assert_eq!(
                decode_node_key(iter.key()),
                internal_key(b"m", 2, ValueType::TypeValue).as_slice()
            );
            iter.prev();
            iter.prev();
            assert!(!iter.valid());
        }
    }

    #[test]
    fn test_concurrent_readers_one_writer() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let list = Arc::new(new_list());
        let done = Arc::new(AtomicBool::new(false));
        let mut readers = vec![];
        for _ in 0..4 {
            let list = list.clone();
            let done = done.clone();
            readers.push(std::thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    let mut iter = SkipListIterator::new(list.as_ref());
                    let mut count = 0;
                    let mut last: Option<Vec<u8>> = None;
                    unsafe {
                        iter.seek_to_first();
                        while iter.valid() {
                            let key = decode_node_key(iter.key()).to_vec();
                            if let Some(prev) = &last {
                                assert!(prev.as_slice() < key.as_slice());
                            }
                            last = Some(key);
                            count += 1;
                            iter.next();
                        }
                    }
                    let _ = count;
                }
            }));
        }
        for i in 0..5000u64 {
            let key = format!("key-{:08}", i);
            list.add(key.as_bytes(), b"value", i + 1, ValueType::TypeValue);
        }
        done.store(true, Ordering::Release);
        for r in readers {
            r.join().unwrap();
        }
        let mut iter = SkipListIterator::new(list.as_ref());
        let mut count = 0;
        unsafe {
            iter.seek_to_first();
            while iter.valid() {
                count += 1;
                iter.next();
            }
        }
        assert_eq!(count, 5000);
    }
}
