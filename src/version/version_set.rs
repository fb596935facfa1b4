use crate::common::{Error, InternalKeyComparator};
use crate::memtable::Memtable;
use crate::options::{ImmutableDbOptions, NUM_LEVELS};
use crate::table::TableCache;
use crate::version::{Snapshot, SnapshotList, SuperVersion, Version};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Monotonic counters shared across the engine. File numbers feed WALs,
/// tables and manifests alike; `last_sequence` is the visibility horizon
/// for reads.
#[derive(Default)]
pub struct DbNumbers {
    next_file_number: AtomicU64,
    next_memtable_id: AtomicU64,
    last_sequence: AtomicU64,
}

impl DbNumbers {
    pub fn new_file_number(&self) -> u64 {
        self.next_file_number.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_next_file_number(&self) -> u64 {
        self.next_file_number.load(Ordering::Acquire)
    }

    pub fn new_memtable_id(&self) -> u64 {
        self.next_memtable_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::Acquire)
    }

    pub fn set_last_sequence(&self, v: u64) {
        debug_assert!(v >= self.last_sequence());
        self.last_sequence.store(v, Ordering::Release);
    }

    pub fn mark_file_number_used(&self, v: u64) {
        let mut old = self.next_file_number.load(Ordering::Acquire);
        while old <= v {
            match self.next_file_number.compare_exchange(
                old,
                v + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(x) => old = x,
            }
        }
    }
}

/// The mutable heart of the engine, guarded by one mutex: the current
/// version, the memtable stack, compaction bookkeeping, snapshots and the
/// sticky background error.
pub struct VersionSet {
    numbers: Arc<DbNumbers>,
    options: Arc<ImmutableDbOptions>,
    current: Arc<Version>,
    super_version: Arc<SuperVersion>,
    version_number: u64,
    /// WALs numbered below this are no longer needed.
    log_number: u64,
    compact_pointer: Vec<Vec<u8>>,
    snapshots: SnapshotList,
    bg_error: Option<Error>,
}

impl VersionSet {
    pub fn new(
        numbers: Arc<DbNumbers>,
        options: Arc<ImmutableDbOptions>,
        version: Version,
        log_number: u64,
        compact_pointer: Vec<Vec<u8>>,
    ) -> Self {
        let current = Arc::new(version);
        let mem = Arc::new(Memtable::new(
            numbers.new_memtable_id(),
            options.comparator.clone(),
        ));
        let super_version = Arc::new(SuperVersion::new(mem, vec![], current.clone(), 0));
        let mut pointers = compact_pointer;
        pointers.resize(NUM_LEVELS, vec![]);
        Self {
            numbers,
            options,
            current,
            super_version,
            version_number: 0,
            log_number,
            compact_pointer: pointers,
            snapshots: SnapshotList::default(),
            bg_error: None,
        }
    }

    pub fn numbers(&self) -> Arc<DbNumbers> {
        self.numbers.clone()
    }

    pub fn options(&self) -> Arc<ImmutableDbOptions> {
        self.options.clone()
    }

    pub fn current(&self) -> Arc<Version> {
        self.current.clone()
    }

    pub fn super_version(&self) -> Arc<SuperVersion> {
        self.super_version.clone()
    }

    pub fn mem(&self) -> Arc<Memtable> {
        self.super_version.mem.clone()
    }

    pub fn imms(&self) -> Vec<Arc<Memtable>> {
        self.super_version.imms.clone()
    }

    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    /// Freezes the active memtable and installs a fresh one. The frozen
    /// table remembers the WAL that replaced its own so recovery knows
    /// which logs are still needed.
    pub fn switch_memtable(&mut self, next_log_number: u64) -> Arc<Memtable> {
        let frozen = self.super_version.mem.clone();
        frozen.set_next_log_number(next_log_number);
        let mem = Arc::new(Memtable::new(
            self.numbers.new_memtable_id(),
            self.options.comparator.clone(),
        ));
        let mut imms = self.super_version.imms.clone();
        imms.push(frozen.clone());
        self.version_number += 1;
        self.super_version = Arc::new(SuperVersion::new(
            mem,
            imms,
            self.current.clone(),
            self.version_number,
        ));
        frozen
    }

    /// Publishes the version produced by a manifest write and unpins any
    /// flushed memtables.
    pub fn install_version(
        &mut self,
        mems_flushed: &[u64],
        log_number: Option<u64>,
        version: Version,
    ) {
        self.current = Arc::new(version);
        if let Some(log_number) = log_number {
            if log_number > self.log_number {
                self.log_number = log_number;
            }
        }
        let imms: Vec<Arc<Memtable>> = self
            .super_version
            .imms
            .iter()
            .filter(|m| !mems_flushed.contains(&m.id()))
            .cloned()
            .collect();
        self.version_number += 1;
        self.super_version = Arc::new(SuperVersion::new(
            self.super_version.mem.clone(),
            imms,
            self.current.clone(),
            self.version_number,
        ));
    }

    pub fn compact_pointer(&self, level: usize) -> &[u8] {
        &self.compact_pointer[level]
    }

    pub fn set_compact_pointer(&mut self, level: usize, key: Vec<u8>) {
        self.compact_pointer[level] = key;
    }

    pub fn comparator(&self) -> InternalKeyComparator {
        self.options.comparator.clone()
    }

    pub fn table_cache(&self) -> Arc<TableCache> {
        self.current.table_cache().clone()
    }

    /// Whether the background worker has size or seek work to do. A pending
    /// immutable memtable is tracked separately by the flush queue.
    pub fn needs_compaction(&self) -> bool {
        self.current.compaction_score() >= 1.0 || self.current.file_to_compact().is_some()
    }

    pub fn has_imm(&self) -> bool {
        !self.super_version.imms.is_empty()
    }

    pub fn record_bg_error(&mut self, e: Error) {
        if self.bg_error.is_none() {
            log::error!("background error: {:?}", e);
            self.bg_error = Some(e);
        }
    }

    pub fn bg_error(&self) -> Option<Error> {
        self.bg_error.clone()
    }

    pub fn new_snapshot(&mut self) -> Snapshot {
        self.snapshots.new_snapshot(self.numbers.last_sequence())
    }

    pub fn release_snapshot(&mut self, snapshot: Snapshot) {
        self.snapshots.release_snapshot(snapshot);
    }

    /// The floor below which superseded record versions may be dropped by
    /// compactions.
    pub fn smallest_snapshot(&self) -> u64 {
        self.snapshots
            .oldest()
            .unwrap_or_else(|| self.numbers.last_sequence())
    }
}
