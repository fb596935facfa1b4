use crate::common::{InternalKeyComparator, KeyComparator, Result};
use crate::iterator::AsyncIterator;
use crate::table::TableCache;
use crate::version::TableFile;
use async_trait::async_trait;
use std::cmp::Ordering;
use std::sync::Arc;

/// Concatenates the iterators of one sorted, non-overlapping level: an outer
/// cursor over the file list and an inner iterator over the open table.
/// Useless for level 0.
pub struct LevelConcatIterator {
    files: Vec<Arc<TableFile>>,
    table_cache: Arc<TableCache>,
    comparator: InternalKeyComparator,
    // files.len() means "no file".
    cursor: usize,
    current: Option<Box<dyn AsyncIterator>>,
    status: Result<()>,
}

impl LevelConcatIterator {
    pub fn new(
        files: Vec<Arc<TableFile>>,
        table_cache: Arc<TableCache>,
        comparator: InternalKeyComparator,
    ) -> Self {
        let cursor = files.len();
        Self {
            files,
            table_cache,
            comparator,
            cursor,
            current: None,
            status: Ok(()),
        }
    }

    async fn load_file(&mut self) -> bool {
        if self.cursor >= self.files.len() {
            self.current = None;
            return false;
        }
        let meta = &self.files[self.cursor].meta;
        match self.table_cache.new_iterator(meta.number, meta.file_size).await {
            Ok(iter) => {
                self.current = Some(iter);
                true
            }
            Err(e) => {
                self.status = Err(e);
                self.current = None;
                false
            }
        }
    }

    fn inner_valid(&self) -> bool {
        self.current.as_ref().map_or(false, |i| i.valid())
    }

    async fn skip_forward(&mut self) {
        while !self.inner_valid() {
            // An I/O error freezes the iterator where it is.
            if self.status.is_err() || self.cursor >= self.files.len() {
                self.current = None;
                return;
            }
            self.cursor += 1;
            if self.load_file().await {
                self.current.as_mut().unwrap().seek_to_first().await;
            }
        }
    }

    async fn skip_backward(&mut self) {
        while !self.inner_valid() {
            if self.status.is_err() || self.cursor == 0 || self.files.is_empty() {
                self.cursor = self.files.len();
                self.current = None;
                return;
            }
            self.cursor -= 1;
            if self.load_file().await {
                self.current.as_mut().unwrap().seek_to_last().await;
            }
        }
    }
}

#[async_trait]
impl AsyncIterator for LevelConcatIterator {
    fn valid(&self) -> bool {
        self.inner_valid()
    }

    async fn seek(&mut self, key: &[u8]) {
        // First file whose largest key admits the target.
        self.cursor = self.files.partition_point(|f| {
            self.comparator.compare_key(f.meta.largest.as_ref(), key) == Ordering::Less
        });
        if self.load_file().await {
            self.current.as_mut().unwrap().seek(key).await;
        }
        self.skip_forward().await;
    }

    async fn seek_for_prev(&mut self, key: &[u8]) {
        // Last file whose smallest key does not exceed the target.
        let idx = self.files.partition_point(|f| {
            self.comparator.compare_key(f.meta.smallest.as_ref(), key) != Ordering::Greater
        });
        if idx == 0 {
            self.cursor = self.files.len();
            self.current = None;
            return;
        }
        self.cursor = idx - 1;
        if self.load_file().await {
            self.current.as_mut().unwrap().seek_for_prev(key).await;
        }
        self.skip_backward().await;
    }

    async fn seek_to_first(&mut self) {
        self.cursor = 0;
        if self.load_file().await {
            self.current.as_mut().unwrap().seek_to_first().await;
        }
        self.skip_forward().await;
    }

    async fn seek_to_last(&mut self) {
        if self.files.is_empty() {
            self.current = None;
            return;
        }
        self.cursor = self.files.len() - 1;
        if self.load_file().await {
            self.current.as_mut().unwrap().seek_to_last().await;
        }
        self.skip_backward().await;
    }

    async fn next(&mut self) {
        self.current.as_mut().unwrap().next().await;
        self.skip_forward().await;
    }

    async fn prev(&mut self) {
        self.current.as_mut().unwrap().prev().await;
        self.skip_backward().await;
    }

    fn key(&self) -> &[u8] {
        self.current.as_ref().unwrap().key()
    }

    fn value(&self) -> &[u8] {
        self.current.as_ref().unwrap().value()
    }

    fn status(&self) -> Result<()> {
        match &self.status {
            Ok(()) => self
                .current
                .as_ref()
                .map_or(Ok(()), |i| i.status()),
            Err(e) => Err(e.clone()),
        }
    }
}
