use crate::common::format::ValueType;
use crate::common::{make_log_file, Error, Result};
use crate::db::BgJob;
use crate::log::LogWriter;
use crate::memtable::Memtable;
use crate::options::{
    ImmutableDbOptions, L0_SLOWDOWN_WRITES_TRIGGER, L0_STOP_WRITES_TRIGGER,
};
use crate::version::{DbNumbers, VersionSet};
use crate::write_batch::{ReadOnlyWriteBatch, WriteBatchItem};
use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender};
use futures::channel::oneshot::{channel as once_channel, Sender as OnceSender};
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Once the leader batch is this large, no followers are merged beyond it.
const SMALL_BATCH_LIMIT: usize = 128 << 10;
/// Absolute cap on one commit group.
const MAX_GROUP_SIZE: usize = 1 << 20;

pub enum WalTask {
    Write {
        wb: ReadOnlyWriteBatch,
        sync: bool,
        cb: OnceSender<Result<ReadOnlyWriteBatch>>,
    },
    /// Freezes the active memtable (when non-empty) and schedules its flush.
    Flush { cb: OnceSender<Result<()>> },
}

#[derive(Clone)]
pub struct WalScheduler {
    sender: UnboundedSender<WalTask>,
}

impl WalScheduler {
    pub fn new(sender: UnboundedSender<WalTask>) -> Self {
        Self { sender }
    }

    pub async fn schedule_writebatch(
        &mut self,
        wb: ReadOnlyWriteBatch,
        sync: bool,
    ) -> Result<ReadOnlyWriteBatch> {
        let (cb, rx) = once_channel();
        self.sender
            .send(WalTask::Write { wb, sync, cb })
            .await
            .map_err(|_| Error::DbClosed)?;
        rx.await.map_err(|_| Error::Cancel("write task has exited"))?
    }

    pub async fn schedule_memtable_flush(&mut self) -> Result<()> {
        let (cb, rx) = once_channel();
        self.sender
            .send(WalTask::Flush { cb })
            .await
            .map_err(|_| Error::DbClosed)?;
        rx.await.map_err(|_| Error::Cancel("write task has exited"))?
    }
}

/// Owner of the WAL and of the sole right to insert into the active
/// memtable. Exactly one instance runs, inside the write task, which is what
/// serializes writers the way a leader queue would.
pub struct WalWriter {
    version_set: Arc<Mutex<VersionSet>>,
    numbers: Arc<DbNumbers>,
    options: Arc<ImmutableDbOptions>,
    log: LogWriter,
    mem: Arc<Memtable>,
    bg_finished: UnboundedReceiver<()>,
    bg_tx: UnboundedSender<BgJob>,
}

impl WalWriter {
    pub fn new(
        version_set: Arc<Mutex<VersionSet>>,
        options: Arc<ImmutableDbOptions>,
        log: LogWriter,
        bg_finished: UnboundedReceiver<()>,
        bg_tx: UnboundedSender<BgJob>,
    ) -> Self {
        let (numbers, mem) = {
            let vs = version_set.lock().unwrap();
            (vs.numbers(), vs.mem())
        };
        Self {
            version_set,
            numbers,
            options,
            log,
            mem,
            bg_finished,
            bg_tx,
        }
    }

    /// Makes room for the next commit group: apply soft backpressure once,
    /// wait out a pending flush or a level-0 pileup, and rotate a full
    /// memtable to the flush queue.
    pub async fn preprocess_write(&mut self) -> Result<()> {
        let mut allow_delay = true;
        loop {
            let (bg_error, l0_files, has_imm) = {
                let vs = self.version_set.lock().unwrap();
                (vs.bg_error(), vs.current().num_files(0), vs.has_imm())
            };
            if let Some(e) = bg_error {
                return Err(e);
            }
            if allow_delay && l0_files >= L0_SLOWDOWN_WRITES_TRIGGER {
                // One millisecond of delay per write hands the CPU to the
                // compaction instead of stalling hard at the stop trigger.
                std::thread::sleep(Duration::from_millis(1));
                allow_delay = false;
                continue;
            }
            if self.mem.approximate_memory_usage() <= self.options.write_buffer_size {
                return Ok(());
            }
            if has_imm {
                log::info!("current memtable full; waiting on flush");
                self.wait_background_work().await?;
                continue;
            }
            if l0_files >= L0_STOP_WRITES_TRIGGER {
                log::info!("too many level-0 files; waiting on compaction");
                self.wait_background_work().await?;
                continue;
            }
            self.switch_memtable().await?;
        }
    }

    async fn wait_background_work(&mut self) -> Result<()> {
        match self.bg_finished.next().await {
            Some(()) => Ok(()),
            None => Err(Error::DbClosed),
        }
    }

    async fn switch_memtable(&mut self) -> Result<()> {
        let new_log_number = self.numbers.new_file_number();
        let file = self
            .options
            .fs
            .open_writable_file(make_log_file(&self.options.db_path, new_log_number))?;
        let new_log = LogWriter::new(file, new_log_number);
        self.log = new_log;
        let frozen = {
            let mut vs = self.version_set.lock().unwrap();
            let frozen = vs.switch_memtable(new_log_number);
            self.mem = vs.mem();
            frozen
        };
        log::info!(
            "memtable {} frozen, new WAL {:06}.log",
            frozen.id(),
            new_log_number
        );
        if frozen.mark_flush_scheduled() {
            let _ = self.bg_tx.send(BgJob::Wake).await;
        }
        Ok(())
    }

    /// Force-freezes a non-empty memtable for manual compaction.
    pub async fn force_flush(&mut self) -> Result<()> {
        if let Some(e) = self.version_set.lock().unwrap().bg_error() {
            return Err(e);
        }
        if self.mem.approximate_memory_usage() == 0 {
            return Ok(());
        }
        self.switch_memtable().await
    }

    /// Commits one group: stamp contiguous sequences, append every batch to
    /// the WAL, sync once if anyone asked, insert into the memtable, then
    /// publish the new `last_sequence`.
    pub async fn write(
        &mut self,
        tasks: &mut [(ReadOnlyWriteBatch, OnceSender<Result<ReadOnlyWriteBatch>>)],
        need_sync: bool,
    ) -> Result<()> {
        let mut last_sequence = self.numbers.last_sequence();
        for (wb, _) in tasks.iter_mut() {
            wb.set_sequence(last_sequence + 1);
            last_sequence += wb.count() as u64;
            self.log.add_record(wb.data()).await?;
        }
        if need_sync {
            self.log.fsync().await?;
        }
        for (wb, _) in tasks.iter() {
            let mut sequence = wb.sequence();
            for item in wb.iter() {
                match item {
                    WriteBatchItem::Put { key, value } => {
                        self.mem.add(sequence, ValueType::TypeValue, key, value)
                    }
                    WriteBatchItem::Delete { key } => {
                        self.mem.add(sequence, ValueType::TypeDeletion, key, b"")
                    }
                }
                sequence += 1;
            }
        }
        // Readers may observe the group only now, as one atomic step.
        self.numbers.set_last_sequence(last_sequence);
        Ok(())
    }

    fn record_bg_error(&self, e: Error) {
        self.version_set.lock().unwrap().record_bg_error(e);
    }
}

/// Builds commit groups out of the writer queue. The first batch of a group
/// is the leader: it fixes the sync mode and the size cap.
pub struct BatchWalProcessor {
    pub writer: WalWriter,
    tasks: Vec<(ReadOnlyWriteBatch, OnceSender<Result<ReadOnlyWriteBatch>>)>,
    need_sync: bool,
    group_size: usize,
    group_cap: usize,
}

impl BatchWalProcessor {
    pub fn new(writer: WalWriter) -> Self {
        Self {
            writer,
            tasks: vec![],
            need_sync: false,
            group_size: 0,
            group_cap: MAX_GROUP_SIZE,
        }
    }

    /// Adds a batch to the group; a follower with a stronger sync
    /// requirement than the leader is handed back to start the next group.
    pub fn batch(
        &mut self,
        wb: ReadOnlyWriteBatch,
        sync: bool,
        cb: OnceSender<Result<ReadOnlyWriteBatch>>,
    ) -> Option<WalTask> {
        if self.tasks.is_empty() {
            self.need_sync = sync;
            let size = wb.approximate_size();
            // A small leader should not be held hostage by a huge group.
            self.group_cap = if size <= SMALL_BATCH_LIMIT {
                size + SMALL_BATCH_LIMIT
            } else {
                MAX_GROUP_SIZE
            };
            self.group_size = size;
            self.tasks.push((wb, cb));
            return None;
        }
        if sync && !self.need_sync {
            return Some(WalTask::Write { wb, sync, cb });
        }
        self.group_size += wb.approximate_size();
        self.tasks.push((wb, cb));
        None
    }

    pub fn should_flush(&self) -> bool {
        self.group_size >= self.group_cap
    }

    pub async fn flush(&mut self) -> Result<()> {
        let ret = self.writer.write(&mut self.tasks, self.need_sync).await;
        if let Err(e) = &ret {
            // The WAL may hold a partial group; nothing else may commit
            // until the database is reopened.
            self.writer.record_bg_error(e.clone());
        }
        for (wb, cb) in self.tasks.drain(..) {
            match &ret {
                Ok(()) => {
                    let _ = cb.send(Ok(wb));
                }
                Err(e) => {
                    let _ = cb.send(Err(e.clone()));
                }
            }
        }
        self.need_sync = false;
        self.group_size = 0;
        self.group_cap = MAX_GROUP_SIZE;
        ret
    }
}

/// The write task: drains the queue, grouping compatible writers behind a
/// leader, and commits one group per iteration.
pub async fn run_wal_job(mut processor: BatchWalProcessor, mut rx: UnboundedReceiver<WalTask>) {
    let mut pending: Option<WalTask> = None;
    loop {
        let task = match pending.take() {
            Some(task) => task,
            None => match rx.next().await {
                Some(task) => task,
                None => return,
            },
        };
        match task {
            WalTask::Write { wb, sync, cb } => {
                if let Err(e) = processor.writer.preprocess_write().await {
                    let _ = cb.send(Err(e));
                    continue;
                }
                processor.batch(wb, sync, cb);
                while !processor.should_flush() {
                    match rx.try_next() {
                        Ok(Some(WalTask::Write { wb, sync, cb })) => {
                            if let Some(rejected) = processor.batch(wb, sync, cb) {
                                pending = Some(rejected);
                                break;
                            }
                        }
                        Ok(Some(flush @ WalTask::Flush { .. })) => {
                            pending = Some(flush);
                            break;
                        }
                        // Empty right now, or closed: commit what we have.
                        _ => break,
                    }
                }
                let _ = processor.flush().await;
            }
            WalTask::Flush { cb } => {
                let _ = cb.send(processor.writer.force_flush().await);
            }
        }
    }
}
