use crate::common::{InternalKeyComparator, KeyComparator, Result};
use crate::iterator::AsyncIterator;
use async_trait::async_trait;
use std::cmp::Ordering;

#[derive(Eq, PartialEq, Clone, Copy)]
enum Direction {
    Forward,
    Reverse,
}

/// K-way merge over child iterators in internal-key order. On ties the
/// earliest child wins, so callers must order children newest source first.
pub struct MergingIterator {
    comparator: InternalKeyComparator,
    children: Vec<Box<dyn AsyncIterator>>,
    current: Option<usize>,
    direction: Direction,
    scratch: Vec<u8>,
}

impl MergingIterator {
    pub fn new(children: Vec<Box<dyn AsyncIterator>>, comparator: InternalKeyComparator) -> Self {
        Self {
            comparator,
            children,
            current: None,
            direction: Direction::Forward,
            scratch: vec![],
        }
    }

    fn find_smallest(&mut self) {
        let mut smallest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            match smallest {
                None => smallest = Some(i),
                Some(s) => {
                    if self
                        .comparator
                        .compare_key(child.key(), self.children[s].key())
                        == Ordering::Less
                    {
                        smallest = Some(i);
                    }
                }
            }
        }
        self.current = smallest;
    }

    fn find_largest(&mut self) {
        let mut largest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            match largest {
                None => largest = Some(i),
                Some(l) => {
                    if self
                        .comparator
                        .compare_key(child.key(), self.children[l].key())
                        == Ordering::Greater
                    {
                        largest = Some(i);
                    }
                }
            }
        }
        self.current = largest;
    }
}

#[async_trait]
impl AsyncIterator for MergingIterator {
    fn valid(&self) -> bool {
        self.current
            .map_or(false, |i| self.children[i].valid())
    }

    async fn seek(&mut self, key: &[u8]) {
        for child in self.children.iter_mut() {
            child.seek(key).await;
        }
        self.direction = Direction::Forward;
        self.find_smallest();
    }

    async fn seek_for_prev(&mut self, key: &[u8]) {
        for child in self.children.iter_mut() {
            child.seek_for_prev(key).await;
        }
        self.direction = Direction::Reverse;
        self.find_largest();
    }

    async fn seek_to_first(&mut self) {
        for child in self.children.iter_mut() {
            child.seek_to_first().await;
        }
        self.direction = Direction::Forward;
        self.find_smallest();
    }

    async fn seek_to_last(&mut self) {
        for child in self.children.iter_mut() {
            child.seek_to_last().await;
        }
        self.direction = Direction::Reverse;
        self.find_largest();
    }

    async fn next(&mut self) {
        let current = self.current.unwrap();
        if self.direction == Direction::Reverse {
            // Reposition every other child strictly after the current key
            // before moving forward.
            self.scratch.clear();
            self.scratch.extend_from_slice(self.children[current].key());
            for i in 0..self.children.len() {
                if i == current {
                    continue;
                }
                self.children[i].seek(&self.scratch).await;
                if self.children[i].valid()
                    && self
                        .comparator
                        .compare_key(self.children[i].key(), &self.scratch)
                        == Ordering::Equal
                {
                    self.children[i].next().await;
                }
            }
            self.direction = Direction::Forward;
        }
        self.children[current].next().await;
        self.find_smallest();
    }

    async fn prev(&mut self) {
        let current = self.current.unwrap();
        if self.direction == Direction::Forward {
            // Reposition every other child strictly before the current key.
            self.scratch.clear();
            self.scratch.extend_from_slice(self.children[current].key());
            for i in 0..self.children.len() {
                if i == current {
                    continue;
                }
                self.children[i].seek(&self.scratch).await;
                if self.children[i].valid() {
                    self.children[i].prev().await;
                } else {
                    self.children[i].seek_to_last().await;
                }
            }
            self.direction = Direction::Reverse;
        }
        self.children[current].prev().await;
        self.find_largest();
    }

    fn key(&self) -> &[u8] {
        self.children[self.current.unwrap()].key()
    }

    fn value(&self) -> &[u8] {
        self.children[self.current.unwrap()].value()
    }

    fn status(&self) -> Result<()> {
        for child in &self.children {
            child.status()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::format::{pack_sequence_and_type, ValueType};
    use crate::common::InternalKeyComparator;
    use crate::iterator::{InternalIterator, SyncIteratorAdapter};
    use crate::memtable::Memtable;
    use crate::util::extract_user_key;
    use std::sync::Arc;
    use tokio::runtime::Runtime;

    fn mem_with(keys: &[(&[u8], u64)]) -> Arc<Memtable> {
        let mem = Arc::new(Memtable::new(1, InternalKeyComparator::default()));
        for (key, seq) in keys {
            mem.add(*seq, ValueType::TypeValue, key, b"v");
        }
        mem
    }

    fn merging(mems: &[Arc<Memtable>]) -> MergingIterator {
        let children: Vec<Box<dyn AsyncIterator>> = mems
            .iter()
            .map(|m| {
                Box::new(SyncIteratorAdapter::new(m.new_iterator())) as Box<dyn AsyncIterator>
            })
            .collect();
        MergingIterator::new(children, InternalKeyComparator::default())
    }

    #[test]
    fn test_merge_order() {
        let a = mem_with(&[(b"a", 1), (b"d", 2), (b"g", 3)]);
        let b = mem_with(&[(b"b", 4), (b"e", 5)]);
        let c = mem_with(&[(b"c", 6), (b"f", 7)]);
        let mut iter = merging(&[a, b, c]);
        let r = Runtime::new().unwrap();
        r.block_on(iter.seek_to_first());
        let mut seen = vec![];
        while iter.valid() {
            seen.push(extract_user_key(iter.key()).to_vec());
            r.block_on(iter.next());
        }
        let expect: Vec<Vec<u8>> = [b"a", b"b", b"c", b"d", b"e", b"f", b"g"]
            .iter()
            .map(|k| k.to_vec())
            .collect();
        assert_eq!(seen, expect);
    }

    #[test]
    fn test_direction_switch() {
        let a = mem_with(&[(b"a", 1), (b"c", 2)]);
        let b = mem_with(&[(b"b", 3), (b"d", 4)]);
        let mut iter = merging(&[a, b]);
        let r = Runtime::new().unwrap();
        r.block_on(iter.seek_to_first());
        r.block_on(iter.next());
        assert_eq!(extract_user_key(iter.key()), b"b");
        // Turn around mid-stream.
        r.block_on(iter.prev());
        assert_eq!(extract_user_key(iter.key()), b"a");
        r.block_on(iter.next());
        assert_eq!(extract_user_key(iter.key()), b"b");
        r.block_on(iter.next());
        assert_eq!(extract_user_key(iter.key()), b"c");
    }

    #[test]
    fn test_reverse_scan() {
        let a = mem_with(&[(b"a", 1), (b"c", 2)]);
        let b = mem_with(&[(b"b", 3)]);
        let mut iter = merging(&[a, b]);
        let r = Runtime::new().unwrap();
        r.block_on(iter.seek_to_last());
        let mut seen = vec![];
        while iter.valid() {
            seen.push(extract_user_key(iter.key()).to_vec());
            r.block_on(iter.prev());
        }
        let expect: Vec<Vec<u8>> = [b"c", b"b", b"a"].iter().map(|k| k.to_vec()).collect();
        assert_eq!(seen, expect);
    }
}
