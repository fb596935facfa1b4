use crate::common::format::LookupKey;
use crate::common::{
    make_current_file, make_lock_file, make_log_file, parse_file_name, DbFileType, Error,
    FileLock, FileSystem, Result,
};
use crate::compaction::{
    build_memtable_table, flush_edit, pick_compaction, pick_range_compaction, run_compaction_job,
    run_flush_job, Compaction,
};
use crate::iterator::DbIterator;
use crate::log::{LogReader, LogWriter};
use crate::manifest::{
    CompactionEngine, Manifest, ManifestScheduler, ManifestTask, ManifestWriter,
};
use crate::options::{ImmutableDbOptions, Options, ReadOptions, WriteOptions, NUM_LEVELS};
use crate::table::TableCache;
use crate::version::{DbNumbers, Snapshot, VersionEdit, VersionSet};
use crate::wal::{run_wal_job, BatchWalProcessor, WalScheduler, WalWriter};
use crate::write_batch::{ReadOnlyWriteBatch, WriteBatch, WriteBatchItem, WRITE_BATCH_HEADER};
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::channel::oneshot::{channel as once_channel, Sender as OnceSender};
use futures::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use yatp::{task::future::TaskCell, Builder as PoolBuilder, ThreadPool};

/// Work orders for the single background worker.
pub(crate) enum BgJob {
    /// Something may need flushing or compacting; the worker re-derives what.
    Wake,
    /// One round of manual compaction at `level`; answers whether any
    /// overlapping input existed.
    Manual {
        level: usize,
        begin: Option<Vec<u8>>,
        end: Option<Vec<u8>>,
        cb: OnceSender<Result<bool>>,
    },
}

/// An embedded ordered key/value store: a write-ahead-logged memtable in
/// front of leveled table files, compacted in the background. Clones share
/// the same underlying database.
#[derive(Clone)]
pub struct Db {
    version_set: Arc<Mutex<VersionSet>>,
    numbers: Arc<DbNumbers>,
    options: Arc<ImmutableDbOptions>,
    pool: Arc<ThreadPool<TaskCell>>,
    wal_scheduler: WalScheduler,
    bg_tx: UnboundedSender<BgJob>,
    table_cache: Arc<TableCache>,
    pending_outputs: Arc<Mutex<HashSet<u64>>>,
    stopped: Arc<AtomicBool>,
    _lock: Arc<FileLock>,
}

impl Db {
    pub async fn open(options: Options) -> Result<Db> {
        if options.reuse_logs {
            return Err(Error::NotSupported(
                "reuse_logs is not implemented".to_string(),
            ));
        }
        let create_if_missing = options.create_if_missing;
        let paranoid = options.paranoid_checks;
        let options: Arc<ImmutableDbOptions> = Arc::new(options.into());
        let fs = options.fs.clone();
        fs.create_dir(Path::new(&options.db_path))?;
        let lock = Arc::new(fs.lock_file(make_lock_file(&options.db_path))?);
        let table_cache = Arc::new(TableCache::new(
            fs.clone(),
            options.db_path.clone(),
            options.comparator.clone(),
            options.max_open_files,
        ));

        let current = make_current_file(&options.db_path);
        let mut manifest = if !fs.file_exist(&current)? {
            if !create_if_missing {
                return Err(Error::InvalidArgument(format!(
                    "database {} does not exist",
                    options.db_path
                )));
            }
            log::info!("creating database {}", options.db_path);
            Manifest::create(&options, &table_cache).await?
        } else {
            Manifest::recover(&options, &table_cache).await?
        };
        let version_set = manifest.version_set();
        let numbers = version_set.lock().unwrap().numbers();

        // Every number already on disk is spoken for, orphaned or not.
        let mut logs = vec![];
        for path in fs.list_files(PathBuf::from(&options.db_path))? {
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            if let Ok((tp, number)) = parse_file_name(name) {
                numbers.mark_file_number_used(number);
                if tp == DbFileType::LogFile {
                    logs.push(number);
                }
            }
        }
        let min_log = version_set.lock().unwrap().log_number();
        logs.retain(|number| *number >= min_log);
        logs.sort_unstable();

        Self::replay_logs(&logs, &version_set, &numbers, &options, &table_cache, &mut manifest, paranoid)
            .await?;

        // A fresh WAL for this incarnation; everything older becomes
        // deletable once this edit is durable.
        let new_log_number = numbers.new_file_number();
        let log_file = fs.open_writable_file(make_log_file(&options.db_path, new_log_number))?;
        let log_writer = LogWriter::new(log_file, new_log_number);
        {
            let mem_bytes = {
                let vs = version_set.lock().unwrap();
                vs.mem().approximate_memory_usage()
            };
            if mem_bytes > 0 {
                let (frozen, base) = {
                    let mut vs = version_set.lock().unwrap();
                    (vs.switch_memtable(new_log_number), vs.current())
                };
                let file_number = numbers.new_file_number();
                let meta =
                    build_memtable_table(&frozen, &base, file_number, &options, &table_cache)
                        .await?;
                let edit = flush_edit(&frozen, &meta);
                manifest
                    .process_manifest_writes(vec![edit], vec![frozen.id()])
                    .await?;
            } else {
                let mut edit = VersionEdit::default();
                edit.set_log_number(new_log_number);
                manifest.process_manifest_writes(vec![edit], vec![]).await?;
            }
        }

        let pending_outputs = Arc::new(Mutex::new(HashSet::default()));
        sweep_obsolete_files(
            fs.as_ref(),
            &options.db_path,
            &manifest.live_table_numbers(),
            &pending_outputs.lock().unwrap(),
            version_set.lock().unwrap().log_number(),
            manifest.manifest_file_number(),
        );

        let pool = {
            let mut builder = PoolBuilder::new("basalt");
            let pool = builder
                .max_thread_count(std::cmp::max(options.max_background_jobs, 2) + 1)
                .build_future_pool();
            Arc::new(pool)
        };
        let stopped = Arc::new(AtomicBool::new(false));

        let manifest_scheduler = Self::start_manifest_job(&pool, manifest);
        let (bg_tx, bg_rx) = unbounded();
        let (notify_tx, notify_rx) = unbounded();
        let (wal_tx, wal_rx) = unbounded();
        let wal_scheduler = WalScheduler::new(wal_tx);
        let writer = WalWriter::new(
            version_set.clone(),
            options.clone(),
            log_writer,
            notify_rx,
            bg_tx.clone(),
        );
        pool.spawn(run_wal_job(BatchWalProcessor::new(writer), wal_rx));
        let ctx = BgContext {
            version_set: version_set.clone(),
            numbers: numbers.clone(),
            options: options.clone(),
            table_cache: table_cache.clone(),
            pending_outputs: pending_outputs.clone(),
            manifest_scheduler,
            notify_tx,
            stopped: stopped.clone(),
        };
        pool.spawn(run_bg_worker(bg_rx, ctx));

        let db = Db {
            version_set,
            numbers,
            options,
            pool,
            wal_scheduler,
            bg_tx,
            table_cache,
            pending_outputs,
            stopped,
            _lock: lock,
        };
        db.maybe_schedule_compaction();
        Ok(db)
    }

    async fn replay_logs(
        logs: &[u64],
        version_set: &Arc<Mutex<VersionSet>>,
        numbers: &Arc<DbNumbers>,
        options: &Arc<ImmutableDbOptions>,
        table_cache: &Arc<TableCache>,
        manifest: &mut Manifest,
        paranoid: bool,
    ) -> Result<()> {
        let mut max_sequence = numbers.last_sequence();
        for log_number in logs {
            log::info!("recovering log {:06}", log_number);
            let reader = options
                .fs
                .open_sequential_file(make_log_file(&options.db_path, *log_number))?;
            let mut log_reader = LogReader::with_paranoid(reader, paranoid);
            let mut record = vec![];
            while log_reader.read_record(&mut record).await? {
                if record.len() < WRITE_BATCH_HEADER {
                    if paranoid {
                        return Err(Error::Corruption(
                            "log record smaller than a batch header".to_string(),
                        ));
                    }
                    log::warn!("dropping short record in log {:06}", log_number);
                    break;
                }
                let wb = match ReadOnlyWriteBatch::try_from(record.clone()) {
                    Ok(wb) => wb,
                    Err(e) => {
                        if paranoid {
                            return Err(e);
                        }
                        log::warn!("dropping bad batch in log {:06}: {:?}", log_number, e);
                        break;
                    }
                };
                let mem = version_set.lock().unwrap().mem();
                let mut sequence = wb.sequence();
                for item in wb.iter() {
                    match item {
                        WriteBatchItem::Put { key, value } => mem.add(
                            sequence,
                            crate::common::format::ValueType::TypeValue,
                            key,
                            value,
                        ),
                        WriteBatchItem::Delete { key } => mem.add(
                            sequence,
                            crate::common::format::ValueType::TypeDeletion,
                            key,
                            b"",
                        ),
                    }
                    sequence += 1;
                }
                max_sequence = std::cmp::max(max_sequence, wb.sequence() + wb.count() as u64 - 1);
                numbers.set_last_sequence(max_sequence);

                if mem.approximate_memory_usage() > options.write_buffer_size {
                    // The rest of this log keeps feeding the new memtable,
                    // so this log stays required.
                    let (frozen, base) = {
                        let mut vs = version_set.lock().unwrap();
                        (vs.switch_memtable(*log_number), vs.current())
                    };
                    let file_number = numbers.new_file_number();
                    let meta =
                        build_memtable_table(&frozen, &base, file_number, options, table_cache)
                            .await?;
                    let edit = flush_edit(&frozen, &meta);
                    manifest
                        .process_manifest_writes(vec![edit], vec![frozen.id()])
                        .await?;
                }
            }
        }
        numbers.set_last_sequence(max_sequence);
        Ok(())
    }

    fn start_manifest_job(pool: &ThreadPool<TaskCell>, manifest: Manifest) -> ManifestScheduler {
        let (tx, mut rx): (UnboundedSender<ManifestTask>, UnboundedReceiver<ManifestTask>) =
            unbounded();
        let mut writer = ManifestWriter::new(manifest);
        pool.spawn(async move {
            while let Some(task) = rx.next().await {
                writer.batch(task);
                while let Ok(next) = rx.try_next() {
                    match next {
                        Some(task) => {
                            if writer.batch(task) {
                                break;
                            }
                        }
                        None => {
                            writer.apply().await;
                            return;
                        }
                    }
                }
                writer.apply().await;
            }
        });
        ManifestScheduler::new(tx)
    }

    pub async fn write(&self, opts: &WriteOptions, wb: &mut WriteBatch) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::DbClosed);
        }
        let raw = wb.to_raw();
        let mut scheduler = self.wal_scheduler.clone();
        let raw = scheduler.schedule_writebatch(raw, opts.sync).await?;
        wb.recycle(raw);
        Ok(())
    }

    pub async fn put(&self, opts: &WriteOptions, key: &[u8], value: &[u8]) -> Result<()> {
        let mut wb = WriteBatch::new();
        wb.put(key, value);
        self.write(opts, &mut wb).await
    }

    pub async fn delete(&self, opts: &WriteOptions, key: &[u8]) -> Result<()> {
        let mut wb = WriteBatch::new();
        wb.delete(key);
        self.write(opts, &mut wb).await
    }

    pub async fn get(&self, opts: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let super_version = {
            let vs = self.version_set.lock().unwrap();
            vs.super_version()
        };
        let sequence = opts.snapshot.unwrap_or_else(|| self.numbers.last_sequence());
        let lookup = LookupKey::new(key, sequence);
        let ret = super_version.get(&lookup).await?;
        if super_version.current.file_to_compact().is_some() {
            self.maybe_schedule_compaction();
        }
        Ok(ret)
    }

    /// An iterator over the database as of now (or of the read snapshot),
    /// yielding each live user key once in comparator order.
    pub async fn new_iterator(&self, opts: &ReadOptions) -> Result<DbIterator> {
        let super_version = {
            let vs = self.version_set.lock().unwrap();
            vs.super_version()
        };
        let sequence = opts.snapshot.unwrap_or_else(|| self.numbers.last_sequence());
        let inner = super_version.new_merging_iterator().await?;
        Ok(DbIterator::new(
            inner,
            self.options.comparator.get_user_comparator().clone(),
            sequence,
            super_version,
        ))
    }

    /// Pins the current visibility horizon until released.
    pub fn snapshot(&self) -> Snapshot {
        self.version_set.lock().unwrap().new_snapshot()
    }

    pub fn release_snapshot(&self, snapshot: Snapshot) {
        self.version_set.lock().unwrap().release_snapshot(snapshot);
    }

    /// Flushes the active memtable, then repeatedly compacts every level
    /// whose files overlap the range until none do. `None` bounds are
    /// unbounded.
    pub async fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        let mut scheduler = self.wal_scheduler.clone();
        scheduler.schedule_memtable_flush().await?;
        for level in 0..(NUM_LEVELS - 1) {
            loop {
                let (cb, rx) = once_channel();
                self.bg_tx
                    .clone()
                    .send(BgJob::Manual {
                        level,
                        begin: begin.map(|b| b.to_vec()),
                        end: end.map(|e| e.to_vec()),
                        cb,
                    })
                    .await
                    .map_err(|_| Error::DbClosed)?;
                let compacted = rx
                    .await
                    .map_err(|_| Error::Cancel("background worker has exited"))??;
                if !compacted {
                    break;
                }
            }
        }
        Ok(())
    }

    /// String-valued introspection properties:
    /// `num-files-at-level<N>`, `stats`, `sstables`,
    /// `approximate-memory-usage`, prefixed with `basalt.` (the historic
    /// `leveldb.` prefix is accepted too).
    pub fn get_property(&self, name: &str) -> Option<String> {
        let rest = name
            .strip_prefix("basalt.")
            .or_else(|| name.strip_prefix("leveldb."))?;
        let vs = self.version_set.lock().unwrap();
        if let Some(level) = rest.strip_prefix("num-files-at-level") {
            let level: usize = level.parse().ok()?;
            if level >= NUM_LEVELS {
                return None;
            }
            return Some(vs.current().num_files(level).to_string());
        }
        match rest {
            "stats" => {
                let current = vs.current();
                let mut out = String::from(
                    "Level  Files  Size(MB)\n-----------------------\n",
                );
                for level in 0..NUM_LEVELS {
                    let files = current.num_files(level);
                    if files == 0 {
                        continue;
                    }
                    out.push_str(&format!(
                        "{:>5}  {:>5}  {:>8.2}\n",
                        level,
                        files,
                        current.level_bytes(level) as f64 / 1048576.0,
                    ));
                }
                Some(out)
            }
            "sstables" => {
                let current = vs.current();
                let mut out = String::new();
                for level in 0..NUM_LEVELS {
                    out.push_str(&format!("--- level {} ---\n", level));
                    for f in current.files(level) {
                        out.push_str(&format!("{}:{}\n", f.meta.number, f.meta.file_size));
                    }
                }
                Some(out)
            }
            "approximate-memory-usage" => {
                let sv = vs.super_version();
                let total: usize = sv.mem.approximate_memory_usage()
                    + sv
                        .imms
                        .iter()
                        .map(|m| m.approximate_memory_usage())
                        .sum::<usize>();
                Some(total.to_string())
            }
            _ => None,
        }
    }

    fn maybe_schedule_compaction(&self) {
        let needs = {
            let vs = self.version_set.lock().unwrap();
            vs.needs_compaction() || vs.has_imm()
        };
        if needs {
            let _ = self.bg_tx.unbounded_send(BgJob::Wake);
        }
    }

    /// Stops background work. In-flight flushes or compactions are cut
    /// short; the WAL and manifest make that safe.
    pub fn close(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pool.shutdown();
        Ok(())
    }
}

struct BgContext {
    version_set: Arc<Mutex<VersionSet>>,
    numbers: Arc<DbNumbers>,
    options: Arc<ImmutableDbOptions>,
    table_cache: Arc<TableCache>,
    pending_outputs: Arc<Mutex<HashSet<u64>>>,
    manifest_scheduler: ManifestScheduler,
    notify_tx: UnboundedSender<()>,
    stopped: Arc<AtomicBool>,
}

impl BgContext {
    fn notify_waiters(&self) {
        let _ = self.notify_tx.unbounded_send(());
    }

    fn record_error(&self, e: Error) {
        self.version_set.lock().unwrap().record_bg_error(e);
        // Stalled writers must wake up to observe the error.
        self.notify_waiters();
    }
}

/// The single background worker: flushes frozen memtables first, then runs
/// size- and seek-triggered compactions until the tree is in shape.
async fn run_bg_worker(mut rx: UnboundedReceiver<BgJob>, ctx: BgContext) {
    while let Some(job) = rx.next().await {
        if ctx.stopped.load(Ordering::Acquire) {
            return;
        }
        match job {
            BgJob::Wake => {
                if let Err(e) = background_work(&ctx).await {
                    ctx.record_error(e);
                }
            }
            BgJob::Manual {
                level,
                begin,
                end,
                cb,
            } => {
                let ret = manual_compaction(&ctx, level, begin.as_deref(), end.as_deref()).await;
                if let Err(e) = &ret {
                    ctx.record_error(e.clone());
                }
                let _ = cb.send(ret);
            }
        }
    }
}

async fn background_work(ctx: &BgContext) -> Result<()> {
    loop {
        if ctx.stopped.load(Ordering::Acquire) {
            return Ok(());
        }
        if flush_one_memtable(ctx).await? {
            continue;
        }
        let compaction = {
            let mut vs = ctx.version_set.lock().unwrap();
            if vs.needs_compaction() {
                pick_compaction(&mut vs)
            } else {
                None
            }
        };
        match compaction {
            Some(compaction) => execute_compaction(ctx, compaction).await?,
            None => return Ok(()),
        }
    }
}

/// Flushes the oldest frozen memtable, if any. Returns whether it did work.
async fn flush_one_memtable(ctx: &BgContext) -> Result<bool> {
    let (imm, base) = {
        let vs = ctx.version_set.lock().unwrap();
        (vs.imms().into_iter().next(), vs.current())
    };
    let imm = match imm {
        Some(imm) => imm,
        None => return Ok(false),
    };
    let mut engine = ctx.manifest_scheduler.clone();
    run_flush_job(
        &mut engine,
        imm,
        base,
        ctx.numbers.clone(),
        ctx.options.clone(),
        ctx.table_cache.clone(),
        ctx.pending_outputs.clone(),
    )
    .await?;
    delete_obsolete_wals(ctx);
    ctx.notify_waiters();
    Ok(true)
}

async fn execute_compaction(ctx: &BgContext, compaction: Compaction) -> Result<()> {
    if compaction.is_trivial_move() {
        let f = &compaction.inputs[0][0];
        let mut edit = VersionEdit::default();
        edit.delete_file(compaction.level as u32, f.meta.number);
        edit.add_file(
            compaction.output_level as u32,
            f.meta.number,
            f.meta.file_size,
            f.meta.smallest.as_ref(),
            f.meta.largest.as_ref(),
        );
        edit.set_compact_pointer(compaction.level as u32, &compaction.largest_input_key);
        log::info!(
            "trivial move: table {} from level {} to {}",
            f.meta.number,
            compaction.level,
            compaction.output_level
        );
        let mut engine = ctx.manifest_scheduler.clone();
        engine.apply(vec![edit], vec![]).await?;
    } else {
        let smallest_snapshot = ctx.version_set.lock().unwrap().smallest_snapshot();
        let mut engine = ctx.manifest_scheduler.clone();
        run_compaction_job(
            &mut engine,
            compaction,
            ctx.numbers.clone(),
            ctx.options.clone(),
            ctx.table_cache.clone(),
            ctx.pending_outputs.clone(),
            smallest_snapshot,
        )
        .await?;
    }
    ctx.notify_waiters();
    Ok(())
}

async fn manual_compaction(
    ctx: &BgContext,
    level: usize,
    begin: Option<&[u8]>,
    end: Option<&[u8]>,
) -> Result<bool> {
    // Flushes queued ahead of this request must land first.
    while flush_one_memtable(ctx).await? {}
    let compaction = {
        let mut vs = ctx.version_set.lock().unwrap();
        pick_range_compaction(&mut vs, level, begin, end)
    };
    match compaction {
        Some(compaction) => {
            execute_compaction(ctx, compaction).await?;
            Ok(true)
        }
        None => Ok(false),
    }
}

fn delete_obsolete_wals(ctx: &BgContext) {
    let log_number = ctx.version_set.lock().unwrap().log_number();
    let files = match ctx
        .options
        .fs
        .list_files(PathBuf::from(&ctx.options.db_path))
    {
        Ok(files) => files,
        Err(_) => return,
    };
    for path in files {
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => continue,
        };
        if let Ok((DbFileType::LogFile, number)) = parse_file_name(name) {
            if number < log_number {
                log::info!("deleting obsolete WAL {:?}", path);
                let _ = ctx.options.fs.remove(path);
            }
        }
    }
}

/// Directory sweep at open: anything not referenced by the recovered state
/// is a leftover of a previous incarnation.
fn sweep_obsolete_files(
    fs: &dyn FileSystem,
    db_path: &str,
    live_tables: &HashSet<u64>,
    pending_outputs: &HashSet<u64>,
    log_number: u64,
    manifest_number: u64,
) {
    let files = match fs.list_files(PathBuf::from(db_path)) {
        Ok(files) => files,
        Err(_) => return,
    };
    for path in files {
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => continue,
        };
        let (tp, number) = match parse_file_name(name) {
            Ok(parsed) => parsed,
            Err(_) => continue,
        };
        let keep = match tp {
            DbFileType::LogFile => number >= log_number,
            DbFileType::TableFile => {
                live_tables.contains(&number) || pending_outputs.contains(&number)
            }
            DbFileType::DescriptorFile => number >= manifest_number,
            DbFileType::TempFile => false,
            DbFileType::CurrentFile | DbFileType::LockFile | DbFileType::InfoLogFile => true,
        };
        if !keep {
            log::info!("deleting obsolete file {:?}", path);
            let _ = fs.remove(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use tokio::runtime::Runtime;

    fn test_options(dir: &tempfile::TempDir) -> Options {
        let mut options = Options::default();
        options.db_path = dir.path().to_str().unwrap().to_string();
        options
    }

    fn reopen(r: &Runtime, db: Db, options: Options) -> Db {
        db.close().unwrap();
        drop(db);
        r.block_on(Db::open(options)).unwrap()
    }

    #[test]
    fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let r = Runtime::new().unwrap();
        let db = r.block_on(Db::open(test_options(&dir))).unwrap();
        let w = WriteOptions::default();
        let rd = ReadOptions::default();

        r.block_on(db.put(&w, b"a", b"1")).unwrap();
        r.block_on(db.put(&w, b"b", b"2")).unwrap();
        assert_eq!(r.block_on(db.get(&rd, b"a")).unwrap(), Some(b"1".to_vec()));
        r.block_on(db.delete(&w, b"a")).unwrap();
        assert_eq!(r.block_on(db.get(&rd, b"a")).unwrap(), None);
        assert_eq!(r.block_on(db.get(&rd, b"b")).unwrap(), Some(b"2".to_vec()));
        db.close().unwrap();
    }

    #[test]
    fn test_overwrite_and_empty_values() {
        let dir = tempfile::tempdir().unwrap();
        let r = Runtime::new().unwrap();
        let db = r.block_on(Db::open(test_options(&dir))).unwrap();
        let w = WriteOptions::default();
        let rd = ReadOptions::default();

        r.block_on(db.put(&w, b"k", b"v1")).unwrap();
        r.block_on(db.put(&w, b"k", b"v2")).unwrap();
        assert_eq!(r.block_on(db.get(&rd, b"k")).unwrap(), Some(b"v2".to_vec()));
        r.block_on(db.put(&w, b"", b"")).unwrap();
        assert_eq!(r.block_on(db.get(&rd, b"")).unwrap(), Some(vec![]));
        db.close().unwrap();
    }

    #[test]
    fn test_snapshot_isolation() {
        let dir = tempfile::tempdir().unwrap();
        let r = Runtime::new().unwrap();
        let db = r.block_on(Db::open(test_options(&dir))).unwrap();
        let w = WriteOptions::default();

        r.block_on(db.put(&w, b"k", b"v1")).unwrap();
        let snapshot = db.snapshot();
        r.block_on(db.put(&w, b"k", b"v2")).unwrap();

        assert_eq!(
            r.block_on(db.get(&ReadOptions::default(), b"k")).unwrap(),
            Some(b"v2".to_vec())
        );
        let mut at = ReadOptions::default();
        at.snapshot = Some(snapshot.sequence());
        assert_eq!(r.block_on(db.get(&at, b"k")).unwrap(), Some(b"v1".to_vec()));
        db.release_snapshot(snapshot);
        db.close().unwrap();
    }

    #[test]
    fn test_batch_is_atomic_and_sequenced() {
        let dir = tempfile::tempdir().unwrap();
        let r = Runtime::new().unwrap();
        let db = r.block_on(Db::open(test_options(&dir))).unwrap();
        let w = WriteOptions::default();
        let rd = ReadOptions::default();

        let before = db.snapshot().sequence();
        let mut wb = WriteBatch::new();
        wb.put(b"x", b"1");
        wb.put(b"y", b"2");
        wb.delete(b"x");
        r.block_on(db.write(&w, &mut wb)).unwrap();
        // One sequence per record.
        assert_eq!(db.snapshot().sequence(), before + 3);
        assert_eq!(r.block_on(db.get(&rd, b"x")).unwrap(), None);
        assert_eq!(r.block_on(db.get(&rd, b"y")).unwrap(), Some(b"2".to_vec()));
        db.close().unwrap();
    }

    #[test]
    fn test_group_commit() {
        let dir = tempfile::tempdir().unwrap();
        let r = Runtime::new().unwrap();
        let db = r.block_on(Db::open(test_options(&dir))).unwrap();
        let before = db.snapshot().sequence();

        let writes: Vec<_> = (0..8)
            .map(|i| {
                let db = db.clone();
                async move {
                    let key = format!("key-{}", i);
                    db.put(&WriteOptions::default(), key.as_bytes(), b"v").await
                }
            })
            .collect();
        for ret in r.block_on(join_all(writes)) {
            ret.unwrap();
        }
        assert_eq!(db.snapshot().sequence(), before + 8);
        let rd = ReadOptions::default();
        for i in 0..8 {
            let key = format!("key-{}", i);
            assert_eq!(
                r.block_on(db.get(&rd, key.as_bytes())).unwrap(),
                Some(b"v".to_vec())
            );
        }
        db.close().unwrap();
    }

    #[test]
    fn test_flush_and_recover() {
        let dir = tempfile::tempdir().unwrap();
        let r = Runtime::new().unwrap();
        let mut options = test_options(&dir);
        // Small enough to force several memtable rotations.
        options.write_buffer_size = 64 << 10;
        let db = r.block_on(Db::open(options.clone())).unwrap();
        let w = WriteOptions::default();
        let n = 10_000;
        for i in 0..n {
            let key = format!("key-{:05}", i);
            let value = format!("v-{}", i);
            r.block_on(db.put(&w, key.as_bytes(), value.as_bytes()))
                .unwrap();
        }
        let db = reopen(&r, db, options);

        let mut iter = r.block_on(db.new_iterator(&ReadOptions::default())).unwrap();
        r.block_on(iter.seek_to_first());
        let mut count = 0;
        while iter.valid() {
            let expect_key = format!("key-{:05}", count);
            let expect_value = format!("v-{}", count);
            assert_eq!(iter.key(), expect_key.as_bytes());
            assert_eq!(iter.value(), expect_value.as_bytes());
            count += 1;
            r.block_on(iter.next());
        }
        assert_eq!(count, n);
        db.close().unwrap();
    }

    #[test]
    fn test_recover_without_flush() {
        let dir = tempfile::tempdir().unwrap();
        let r = Runtime::new().unwrap();
        let options = test_options(&dir);
        let db = r.block_on(Db::open(options.clone())).unwrap();
        let w = WriteOptions::default();
        r.block_on(db.put(&w, b"persisted", b"yes")).unwrap();
        r.block_on(db.delete(&w, b"persisted")).unwrap();
        r.block_on(db.put(&w, b"other", b"ok")).unwrap();
        let db = reopen(&r, db, options);

        let rd = ReadOptions::default();
        assert_eq!(r.block_on(db.get(&rd, b"persisted")).unwrap(), None);
        assert_eq!(
            r.block_on(db.get(&rd, b"other")).unwrap(),
            Some(b"ok".to_vec())
        );
        db.close().unwrap();
    }

    #[test]
    fn test_compact_range_and_reads() {
        let dir = tempfile::tempdir().unwrap();
        let r = Runtime::new().unwrap();
        let mut options = test_options(&dir);
        options.write_buffer_size = 32 << 10;
        let db = r.block_on(Db::open(options)).unwrap();
        let w = WriteOptions::default();
        for i in 0..2000 {
            let key = format!("key-{:05}", i % 500);
            let value = format!("v-{}", i);
            r.block_on(db.put(&w, key.as_bytes(), value.as_bytes()))
                .unwrap();
        }
        r.block_on(db.compact_range(None, None)).unwrap();
        // Level 0 was fully pushed down.
        assert_eq!(
            db.get_property("basalt.num-files-at-level0").unwrap(),
            "0"
        );
        let rd = ReadOptions::default();
        for i in 0..500 {
            let key = format!("key-{:05}", i);
            let expect = format!("v-{}", 1500 + i);
            assert_eq!(
                r.block_on(db.get(&rd, key.as_bytes())).unwrap(),
                Some(expect.into_bytes())
            );
        }
        db.close().unwrap();
    }

    #[test]
    fn test_deletion_survives_compaction_under_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let r = Runtime::new().unwrap();
        let db = r.block_on(Db::open(test_options(&dir))).unwrap();
        let w = WriteOptions::default();

        r.block_on(db.put(&w, b"x", b"1")).unwrap();
        let snapshot = db.snapshot();
        r.block_on(db.delete(&w, b"x")).unwrap();
        r.block_on(db.compact_range(None, None)).unwrap();

        assert_eq!(r.block_on(db.get(&ReadOptions::default(), b"x")).unwrap(), None);
        let mut at = ReadOptions::default();
        at.snapshot = Some(snapshot.sequence());
        assert_eq!(r.block_on(db.get(&at, b"x")).unwrap(), Some(b"1".to_vec()));
        db.release_snapshot(snapshot);
        // With the snapshot gone, further compaction may drop the tombstone;
        // visible results stay the same.
        r.block_on(db.compact_range(None, None)).unwrap();
        assert_eq!(r.block_on(db.get(&ReadOptions::default(), b"x")).unwrap(), None);
        db.close().unwrap();
    }

    #[test]
    fn test_iterator_skips_deletions_and_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let r = Runtime::new().unwrap();
        let mut options = test_options(&dir);
        options.write_buffer_size = 16 << 10;
        let db = r.block_on(Db::open(options)).unwrap();
        let w = WriteOptions::default();

        for i in 0..500 {
            let key = format!("key-{:04}", i);
            r.block_on(db.put(&w, key.as_bytes(), b"old")).unwrap();
        }
        // Overwrite some and delete others across a forced flush boundary.
        r.block_on(db.compact_range(None, None)).unwrap();
        for i in (0..500).step_by(2) {
            let key = format!("key-{:04}", i);
            r.block_on(db.put(&w, key.as_bytes(), b"new")).unwrap();
        }
        for i in (1..500).step_by(10) {
            let key = format!("key-{:04}", i);
            r.block_on(db.delete(&w, key.as_bytes())).unwrap();
        }

        let mut iter = r.block_on(db.new_iterator(&ReadOptions::default())).unwrap();
        r.block_on(iter.seek_to_first());
        let mut last: Option<Vec<u8>> = None;
        let mut seen = 0;
        while iter.valid() {
            let key = iter.key().to_vec();
            if let Some(prev) = &last {
                assert!(prev < &key, "keys must be strictly increasing");
            }
            let i: usize = String::from_utf8(key[4..].to_vec())
                .unwrap()
                .parse()
                .unwrap();
            assert!(!(i % 10 == 1), "deleted key {} must not appear", i);
            if i % 2 == 0 {
                assert_eq!(iter.value(), b"new");
            } else {
                assert_eq!(iter.value(), b"old");
            }
            last = Some(key);
            seen += 1;
            r.block_on(iter.next());
        }
        assert_eq!(seen, 500 - 50);
        db.close().unwrap();
    }

    #[test]
    fn test_reverse_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let r = Runtime::new().unwrap();
        let db = r.block_on(Db::open(test_options(&dir))).unwrap();
        let w = WriteOptions::default();
        for i in 0..100 {
            let key = format!("key-{:03}", i);
            let value = format!("v-{}", i);
            r.block_on(db.put(&w, key.as_bytes(), value.as_bytes()))
                .unwrap();
        }
        r.block_on(db.delete(&w, b"key-050")).unwrap();

        let mut iter = r.block_on(db.new_iterator(&ReadOptions::default())).unwrap();
        r.block_on(iter.seek_to_last());
        let mut seen = vec![];
        while iter.valid() {
            seen.push(iter.key().to_vec());
            r.block_on(iter.prev());
        }
        assert_eq!(seen.len(), 99);
        assert_eq!(seen.first().unwrap(), b"key-099");
        assert_eq!(seen.last().unwrap(), b"key-000");
        assert!(!seen.contains(&b"key-050".to_vec()));

        // Turn around in the middle.
        r.block_on(iter.seek(b"key-030"));
        assert_eq!(iter.key(), b"key-030");
        r.block_on(iter.prev());
        assert_eq!(iter.key(), b"key-029");
        r.block_on(iter.next());
        assert_eq!(iter.key(), b"key-030");
        db.close().unwrap();
    }

    /// Writes two records, truncates the WAL tail as a crash mid-write
    /// would, and reopens.
    fn damage_wal_tail(r: &Runtime, options: &Options, dir: &tempfile::TempDir) {
        let db = r.block_on(Db::open(options.clone())).unwrap();
        let mut w = WriteOptions::default();
        w.sync = true;
        r.block_on(db.put(&w, b"first", b"1")).unwrap();
        r.block_on(db.put(&w, b"second", b"2")).unwrap();
        db.close().unwrap();
        drop(db);

        let mut wals: Vec<PathBuf> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().map_or(false, |e| e == "log"))
            .collect();
        wals.sort();
        let wal = wals.pop().unwrap();
        let data = std::fs::read(&wal).unwrap();
        std::fs::write(&wal, &data[..data.len() - 3]).unwrap();
    }

    #[test]
    fn test_crash_mid_wal_tolerant() {
        let dir = tempfile::tempdir().unwrap();
        let r = Runtime::new().unwrap();
        let options = test_options(&dir);
        damage_wal_tail(&r, &options, &dir);

        let db = r.block_on(Db::open(options)).unwrap();
        let rd = ReadOptions::default();
        assert_eq!(
            r.block_on(db.get(&rd, b"first")).unwrap(),
            Some(b"1".to_vec())
        );
        assert_eq!(r.block_on(db.get(&rd, b"second")).unwrap(), None);
        db.close().unwrap();
    }

    #[test]
    fn test_crash_mid_wal_paranoid() {
        let dir = tempfile::tempdir().unwrap();
        let r = Runtime::new().unwrap();
        let mut options = test_options(&dir);
        damage_wal_tail(&r, &options, &dir);

        options.paranoid_checks = true;
        assert!(matches!(
            r.block_on(Db::open(options)),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_lock_excludes_second_instance() {
        let dir = tempfile::tempdir().unwrap();
        let r = Runtime::new().unwrap();
        let options = test_options(&dir);
        let db = r.block_on(Db::open(options.clone())).unwrap();
        assert!(r.block_on(Db::open(options)).is_err());
        db.close().unwrap();
    }

    #[test]
    fn test_properties() {
        let dir = tempfile::tempdir().unwrap();
        let r = Runtime::new().unwrap();
        let db = r.block_on(Db::open(test_options(&dir))).unwrap();
        let w = WriteOptions::default();
        r.block_on(db.put(&w, b"k", b"v")).unwrap();

        assert_eq!(
            db.get_property("basalt.num-files-at-level0").unwrap(),
            "0"
        );
        assert!(db.get_property("basalt.stats").is_some());
        assert!(db.get_property("basalt.sstables").is_some());
        assert!(db
            .get_property("basalt.approximate-memory-usage")
            .unwrap()
            .parse::<usize>()
            .unwrap()
            > 0);
        assert!(db.get_property("leveldb.num-files-at-level0").is_some());
        assert!(db.get_property("basalt.nonsense").is_none());
        db.close().unwrap();
    }

    #[test]
    fn test_open_missing_without_create() {
        let dir = tempfile::tempdir().unwrap();
        let r = Runtime::new().unwrap();
        let mut options = test_options(&dir);
        options.create_if_missing = false;
        assert!(matches!(
            r.block_on(Db::open(options)),
            Err(Error::InvalidArgument(_))
        ));
    }
}
