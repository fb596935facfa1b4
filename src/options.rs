use crate::common::{
    BytewiseComparator, FileSystem, InternalKeyComparator, KeyComparator, SyncPosixFileSystem,
};
use std::sync::Arc;

pub const NUM_LEVELS: usize = 7;

/// Level-0 file count that triggers a compaction.
pub const L0_COMPACTION_TRIGGER: usize = 4;
/// Level-0 file count at which writes are slowed by a 1ms pause.
pub const L0_SLOWDOWN_WRITES_TRIGGER: usize = 8;
/// Level-0 file count at which writes stall until compaction catches up.
pub const L0_STOP_WRITES_TRIGGER: usize = 12;

/// Highest level a fresh memtable flush may be placed at when nothing
/// overlaps it.
pub const MAX_MEM_COMPACT_LEVEL: usize = 2;

#[derive(Clone)]
pub struct Options {
    pub create_if_missing: bool,
    pub paranoid_checks: bool,
    pub write_buffer_size: usize,
    pub max_open_files: usize,
    pub block_size: usize,
    pub max_file_size: usize,
    pub max_manifest_file_size: usize,
    pub max_background_jobs: usize,
    pub reuse_logs: bool,
    pub comparator: Arc<dyn KeyComparator>,
    pub fs: Arc<dyn FileSystem>,
    pub db_path: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            paranoid_checks: false,
            write_buffer_size: 4 << 20,
            max_open_files: 1000,
            block_size: 4096,
            max_file_size: 2 << 20,
            max_manifest_file_size: 128 << 20,
            max_background_jobs: 2,
            reuse_logs: false,
            comparator: Arc::new(BytewiseComparator::default()),
            fs: Arc::new(SyncPosixFileSystem {}),
            db_path: "db".to_string(),
        }
    }
}

pub struct ImmutableDbOptions {
    pub paranoid_checks: bool,
    pub write_buffer_size: usize,
    pub max_open_files: usize,
    pub block_size: usize,
    pub max_file_size: usize,
    pub max_manifest_file_size: usize,
    pub max_background_jobs: usize,
    pub comparator: InternalKeyComparator,
    pub fs: Arc<dyn FileSystem>,
    pub db_path: String,
}

impl ImmutableDbOptions {
    /// Bound on bytes a fresh output may overlap at grandparent level before
    /// the compaction rolls to a new output file.
    pub fn max_grandparent_overlap_bytes(&self) -> u64 {
        10 * self.max_file_size as u64
    }

    /// Bound on total input bytes when widening the input set of a compaction.
    pub fn expanded_compaction_byte_size_limit(&self) -> u64 {
        25 * self.max_file_size as u64
    }

    pub fn max_bytes_for_level(&self, level: usize) -> f64 {
        // Level 1 holds 10MB, each deeper level ten times more.
        let mut result = 10.0 * 1048576.0;
        let mut l = 1;
        while l < level {
            result *= 10.0;
            l += 1;
        }
        result
    }
}

impl From<Options> for ImmutableDbOptions {
    fn from(opt: Options) -> Self {
        Self {
            paranoid_checks: opt.paranoid_checks,
            write_buffer_size: opt.write_buffer_size,
            max_open_files: opt.max_open_files,
            block_size: opt.block_size,
            max_file_size: opt.max_file_size,
            max_manifest_file_size: opt.max_manifest_file_size,
            max_background_jobs: opt.max_background_jobs,
            comparator: InternalKeyComparator::new(opt.comparator.clone()),
            fs: opt.fs.clone(),
            db_path: opt.db_path,
        }
    }
}

#[derive(Default, Clone)]
pub struct ReadOptions {
    /// Read as of this sequence instead of the latest visible one.
    pub snapshot: Option<u64>,
    pub verify_checksums: bool,
    pub fill_cache: bool,
}

#[derive(Default, Clone)]
pub struct WriteOptions {
    pub sync: bool,
}
