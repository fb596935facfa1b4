mod edit;
mod snapshot;
mod version;
mod version_set;

pub use edit::VersionEdit;
pub use snapshot::{Snapshot, SnapshotList};
pub use version::{total_file_size, SuperVersion, Version};
pub use version_set::{DbNumbers, VersionSet};

use crate::common::FileSystem;
use crate::table::TableCache;
use crate::util::extract_user_key;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FileMetaData {
    pub number: u64,
    pub level: u32,
    pub file_size: u64,
    /// Smallest internal key served by the file.
    pub smallest: Bytes,
    /// Largest internal key served by the file.
    pub largest: Bytes,
}

impl FileMetaData {
    pub fn new(number: u64, level: u32, smallest: Vec<u8>, largest: Vec<u8>) -> Self {
        FileMetaData {
            number,
            level,
            file_size: 0,
            smallest: Bytes::from(smallest),
            largest: Bytes::from(largest),
        }
    }

    pub fn update_boundary(&mut self, key: &[u8]) {
        if self.smallest.is_empty() {
            self.smallest = Bytes::from(key.to_vec());
        }
        self.largest = Bytes::from(key.to_vec());
    }

    pub fn smallest_user_key(&self) -> &[u8] {
        extract_user_key(self.smallest.as_ref())
    }

    pub fn largest_user_key(&self) -> &[u8] {
        extract_user_key(self.largest.as_ref())
    }
}

/// A table file as referenced by versions. When the last version (or
/// iterator) holding the file lets go after it was marked removed, the file
/// is unlinked and its cached reader evicted, which is what keeps spec
/// invariant "a live file is never deleted" without a separate refcount.
pub struct TableFile {
    pub meta: FileMetaData,
    allowed_seeks: AtomicI64,
    deleted: AtomicBool,
    fs: Arc<dyn FileSystem>,
    cache: Arc<TableCache>,
    path: PathBuf,
}

impl TableFile {
    pub fn new(
        meta: FileMetaData,
        fs: Arc<dyn FileSystem>,
        cache: Arc<TableCache>,
        path: PathBuf,
    ) -> Self {
        // One seek is worth roughly 16KB of compaction work; very small
        // files still get a generous budget.
        let allowed_seeks = std::cmp::max(meta.file_size as i64 / 16384, 100);
        TableFile {
            meta,
            allowed_seeks: AtomicI64::new(allowed_seeks),
            deleted: AtomicBool::new(false),
            fs,
            cache,
            path,
        }
    }

    pub fn id(&self) -> u64 {
        self.meta.number
    }

    /// Debits one wasted seek; true when the budget just ran out and the
    /// file should become a compaction candidate.
    pub fn charge_seek(&self) -> bool {
        self.allowed_seeks.fetch_sub(1, Ordering::Relaxed) == 1
    }

    pub fn mark_removed(&self) {
        self.deleted.store(true, Ordering::Release);
    }
}

impl Drop for TableFile {
    fn drop(&mut self) {
        if self.deleted.load(Ordering::Acquire) {
            self.cache.evict(self.meta.number);
            if let Err(e) = self.fs.remove(self.path.clone()) {
                log::warn!("failed to remove table file {:?}: {:?}", self.path, e);
            } else {
                log::info!("deleted table file {:?}", self.path);
            }
        }
    }
}
