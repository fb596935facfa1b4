mod db_iterator;
mod merge_iterator;
mod two_level_iterator;

use crate::common::Result;
use async_trait::async_trait;

pub use db_iterator::DbIterator;
pub use merge_iterator::MergingIterator;
pub use two_level_iterator::LevelConcatIterator;

/// Iterator over encoded internal keys in a purely in-memory structure.
pub trait InternalIterator: Send {
    fn valid(&self) -> bool;
    /// Positions at the first entry >= `key`.
    fn seek(&mut self, key: &[u8]);
    /// Positions at the last entry <= `key`.
    fn seek_for_prev(&mut self, key: &[u8]);
    fn seek_to_first(&mut self);
    fn seek_to_last(&mut self);
    fn next(&mut self);
    fn prev(&mut self);
    fn key(&self) -> &[u8];
    fn value(&self) -> &[u8];
}

/// Iterator whose repositioning may touch files. A read error makes the
/// iterator invalid and is reported through `status`.
#[async_trait]
pub trait AsyncIterator: Send {
    fn valid(&self) -> bool;
    async fn seek(&mut self, key: &[u8]);
    async fn seek_for_prev(&mut self, key: &[u8]);
    async fn seek_to_first(&mut self);
    async fn seek_to_last(&mut self);
    async fn next(&mut self);
    async fn prev(&mut self);
    fn key(&self) -> &[u8];
    fn value(&self) -> &[u8];
    fn status(&self) -> Result<()> {
        Ok(())
    }
}

/// Lets a memtable iterator participate in a merge with file iterators.
pub struct SyncIteratorAdapter {
    inner: Box<dyn InternalIterator>,
}

impl SyncIteratorAdapter {
    pub fn new(inner: Box<dyn InternalIterator>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl AsyncIterator for SyncIteratorAdapter {
    fn valid(&self) -> bool {
        self.inner.valid()
    }

    async fn seek(&mut self, key: &[u8]) {
        self.inner.seek(key)
    }

    async fn seek_for_prev(&mut self, key: &[u8]) {
        self.inner.seek_for_prev(key)
    }

    async fn seek_to_first(&mut self) {
        self.inner.seek_to_first()
    }

    async fn seek_to_last(&mut self) {
        self.inner.seek_to_last()
    }

    async fn next(&mut self) {
        self.inner.next()
    }

    async fn prev(&mut self) {
        self.inner.prev()
    }

    fn key(&self) -> &[u8] {
        self.inner.key()
    }

    fn value(&self) -> &[u8] {
        self.inner.value()
    }
}
