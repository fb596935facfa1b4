use crate::common::{
    make_current_file, make_descriptor_file_name, make_table_file_name, make_temp_file,
    parse_file_name, DbFileType, Error, FileSystem, KeyComparator, Result,
};
use crate::log::{LogReader, LogWriter};
use crate::options::{ImmutableDbOptions, NUM_LEVELS};
use crate::table::TableCache;
use crate::version::{DbNumbers, TableFile, Version, VersionEdit, VersionSet};
use async_trait::async_trait;
use futures::channel::mpsc::UnboundedSender;
use futures::channel::oneshot::{channel as once_channel, Sender as OnceSender};
use futures::SinkExt;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

const MAX_BATCH_SIZE: usize = 128;

/// Applies version edits to the installed state by a grouped manifest write:
/// encode, append, fsync, then swap the current version under the mutex.
pub struct Manifest {
    log: Option<LogWriter>,
    version_set: Arc<Mutex<VersionSet>>,
    // Every table file the engine knows about, so a deletion can be routed
    // through the drop path of the last referencing version.
    files_by_id: HashMap<u64, Arc<TableFile>>,
    numbers: Arc<DbNumbers>,
    options: Arc<ImmutableDbOptions>,
    table_cache: Arc<TableCache>,
    manifest_file_number: u64,
}

impl Manifest {
    /// Bootstraps an empty database: manifest #1 holding a single edit, and
    /// a CURRENT file pointing at it.
    pub async fn create(
        options: &Arc<ImmutableDbOptions>,
        table_cache: &Arc<TableCache>,
    ) -> Result<Manifest> {
        let mut new_db = VersionEdit::default();
        new_db.set_comparator_name(options.comparator.get_user_comparator().name());
        new_db.set_log_number(0);
        new_db.set_next_file(2);
        new_db.set_last_sequence(0);
        let descriptor = make_descriptor_file_name(&options.db_path, 1);
        let writer = options.fs.open_writable_file(descriptor)?;
        let mut writer = LogWriter::new(writer, 1);
        let mut record = vec![];
        new_db.encode_to(&mut record);
        writer.add_record(&record).await?;
        writer.fsync().await?;
        store_current_file(&options.fs, 1, &options.db_path).await?;
        Self::recover(options, table_cache).await
    }

    /// Rebuilds the current version by replaying every edit in the manifest
    /// CURRENT points at.
    pub async fn recover(
        options: &Arc<ImmutableDbOptions>,
        table_cache: &Arc<TableCache>,
    ) -> Result<Manifest> {
        let (manifest_path, manifest_file_number) =
            get_current_manifest_path(&options.db_path, options.fs.as_ref())?;
        let reader = options
            .fs
            .open_sequential_file(PathBuf::from(manifest_path))?;
        // Damage in the manifest is always fatal; only an unsynced tail from
        // a crash is forgiven.
        let mut log_reader = LogReader::for_manifest(reader);

        let numbers = Arc::new(DbNumbers::default());
        let mut files: HashMap<u64, crate::version::FileMetaData> = HashMap::default();
        let mut compact_pointers: Vec<Vec<u8>> = vec![vec![]; NUM_LEVELS];
        let mut log_number = 0;
        let mut next_file = 0;
        let mut last_sequence = 0;
        let mut has_log_number = false;
        let mut has_next_file = false;
        let mut has_last_sequence = false;
        let mut comparator_name: Option<String> = None;

        let mut record = vec![];
        while log_reader.read_record(&mut record).await? {
            let mut edit = VersionEdit::default();
            edit.decode_from(&record)?;
            if let Some(name) = &edit.comparator_name {
                comparator_name = Some(name.clone());
            }
            if let Some(n) = edit.log_number {
                log_number = n;
                has_log_number = true;
            }
            if let Some(n) = edit.next_file_number {
                next_file = n;
                has_next_file = true;
            }
            if let Some(n) = edit.last_sequence {
                last_sequence = n;
                has_last_sequence = true;
            }
            for (level, key) in &edit.compact_pointers {
                if *level as usize >= NUM_LEVELS {
                    return Err(Error::Corruption(format!(
                        "compact pointer for level {} out of range",
                        level
                    )));
                }
                compact_pointers[*level as usize] = key.clone();
            }
            for (_, number) in &edit.deleted_files {
                files.remove(number);
            }
            for f in &edit.new_files {
                if f.level as usize >= NUM_LEVELS {
                    return Err(Error::Corruption(format!(
                        "new file at level {} out of range",
                        f.level
                    )));
                }
                files.insert(f.number, f.clone());
            }
        }
        if !has_next_file || !has_log_number || !has_last_sequence {
            return Err(Error::Corruption(
                "manifest is missing required fields".to_string(),
            ));
        }
        match comparator_name {
            Some(name) if name == options.comparator.get_user_comparator().name() => {}
            Some(name) => {
                return Err(Error::InvalidArgument(format!(
                    "comparator {} does not match existing comparator {}",
                    options.comparator.get_user_comparator().name(),
                    name
                )));
            }
            None => {
                return Err(Error::Corruption(
                    "manifest has no comparator name".to_string(),
                ));
            }
        }
        numbers.mark_file_number_used(next_file.saturating_sub(1));
        numbers.mark_file_number_used(log_number);
        numbers.set_last_sequence(last_sequence);

        let mut files_by_id = HashMap::default();
        let mut levels: Vec<Vec<Arc<TableFile>>> = vec![vec![]; NUM_LEVELS];
        for (number, meta) in files {
            numbers.mark_file_number_used(number);
            let path = make_table_file_name(&options.db_path, number);
            let table = Arc::new(TableFile::new(
                meta.clone(),
                options.fs.clone(),
                table_cache.clone(),
                path,
            ));
            files_by_id.insert(number, table.clone());
            levels[meta.level as usize].push(table);
        }
        let version = Version::with_files(options.clone(), table_cache.clone(), levels);
        let version_set = VersionSet::new(
            numbers.clone(),
            options.clone(),
            version,
            log_number,
            compact_pointers,
        );
        Ok(Manifest {
            log: None,
            version_set: Arc::new(Mutex::new(version_set)),
            files_by_id,
            numbers,
            options: options.clone(),
            table_cache: table_cache.clone(),
            manifest_file_number,
        })
    }

    pub fn version_set(&self) -> Arc<Mutex<VersionSet>> {
        self.version_set.clone()
    }

    pub fn live_table_numbers(&self) -> HashSet<u64> {
        self.files_by_id.keys().copied().collect()
    }

    pub fn manifest_file_number(&self) -> u64 {
        self.manifest_file_number
    }

    pub async fn process_manifest_writes(
        &mut self,
        mut edits: Vec<VersionEdit>,
        mems_flushed: Vec<u64>,
    ) -> Result<()> {
        if edits.is_empty() && mems_flushed.is_empty() {
            return Ok(());
        }
        let mut new_descriptor = false;
        if self
            .log
            .as_ref()
            .map_or(true, |l| l.file_size() > self.options.max_manifest_file_size)
        {
            let file_number = self.numbers.new_file_number();
            let descriptor = make_descriptor_file_name(&self.options.db_path, file_number);
            let writer = self.options.fs.open_writable_file(descriptor)?;
            let mut writer = LogWriter::new(writer, file_number);
            self.write_snapshot(&mut writer).await?;
            self.log = Some(writer);
            self.manifest_file_number = file_number;
            new_descriptor = true;
        }
        let mut record = vec![];
        let mut log_number = None;
        for e in edits.iter_mut() {
            // Refresh the counters so a manifest replayed alone restores
            // them.
            if e.next_file_number.is_none() {
                e.set_next_file(self.numbers.current_next_file_number());
            }
            if e.last_sequence.is_none() {
                e.set_last_sequence(self.numbers.last_sequence());
            }
            if let Some(n) = e.log_number {
                log_number = Some(log_number.map_or(n, |old: u64| old.max(n)));
            }
            record.clear();
            e.encode_to(&mut record);
            self.log.as_mut().unwrap().add_record(&record).await?;
        }
        self.log.as_mut().unwrap().fsync().await?;
        if new_descriptor {
            store_current_file(
                &self.options.fs,
                self.manifest_file_number,
                &self.options.db_path,
            )
            .await?;
        }

        // The writes are durable; build and install the new version.
        // A number both deleted and re-added is a level move; the file on
        // disk must survive.
        let moved: HashSet<u64> = edits
            .iter()
            .flat_map(|e| e.new_files.iter().map(|f| f.number))
            .collect();
        let mut to_add = vec![];
        let mut to_delete: HashSet<(u32, u64)> = HashSet::default();
        let mut removed_tables = vec![];
        for e in &edits {
            for (level, number) in &e.deleted_files {
                to_delete.insert((*level, *number));
                if let Some(f) = self.files_by_id.remove(number) {
                    if !moved.contains(number) {
                        removed_tables.push(f);
                    }
                }
            }
            for m in &e.new_files {
                let path = make_table_file_name(&self.options.db_path, m.number);
                let table = Arc::new(TableFile::new(
                    m.clone(),
                    self.options.fs.clone(),
                    self.table_cache.clone(),
                    path,
                ));
                self.files_by_id.insert(m.number, table.clone());
                to_add.push(table);
            }
        }
        let mut version_set = self.version_set.lock().unwrap();
        let new_version = version_set.current().edit(to_add, &to_delete);
        version_set.install_version(&mems_flushed, log_number, new_version);
        for e in &edits {
            for (level, key) in &e.compact_pointers {
                version_set.set_compact_pointer(*level as usize, key.clone());
            }
        }
        drop(version_set);
        // Unlinked once the last pinning version or iterator lets go.
        for f in removed_tables {
            f.mark_removed();
        }
        Ok(())
    }

    async fn write_snapshot(&mut self, writer: &mut LogWriter) -> Result<()> {
        let (current, compact_pointers, log_number) = {
            let vs = self.version_set.lock().unwrap();
            let pointers: Vec<Vec<u8>> = (0..NUM_LEVELS)
                .map(|l| vs.compact_pointer(l).to_vec())
                .collect();
            (vs.current(), pointers, vs.log_number())
        };
        let mut edit = VersionEdit::default();
        edit.set_comparator_name(self.options.comparator.get_user_comparator().name());
        edit.set_log_number(log_number);
        edit.set_next_file(self.numbers.current_next_file_number());
        edit.set_last_sequence(self.numbers.last_sequence());
        for (level, key) in compact_pointers.iter().enumerate() {
            if !key.is_empty() {
                edit.set_compact_pointer(level as u32, key);
            }
        }
        for level in 0..NUM_LEVELS {
            for f in current.files(level) {
                edit.add_file(
                    level as u32,
                    f.meta.number,
                    f.meta.file_size,
                    f.meta.smallest.as_ref(),
                    f.meta.largest.as_ref(),
                );
            }
        }
        let mut record = vec![];
        edit.encode_to(&mut record);
        writer.add_record(&record).await?;
        writer.fsync().await
    }
}

pub struct ManifestTask {
    pub edits: Vec<VersionEdit>,
    pub mems_flushed: Vec<u64>,
    pub cb: OnceSender<Result<()>>,
}

/// Batches concurrent apply requests into one manifest write.
pub struct ManifestWriter {
    manifest: Manifest,
    cbs: Vec<OnceSender<Result<()>>>,
    edits: Vec<VersionEdit>,
    mems_flushed: Vec<u64>,
}

impl ManifestWriter {
    pub fn new(manifest: Manifest) -> Self {
        Self {
            manifest,
            cbs: vec![],
            edits: vec![],
            mems_flushed: vec![],
        }
    }

    pub fn batch(&mut self, mut task: ManifestTask) -> bool {
        let need_apply = self.edits.len() > MAX_BATCH_SIZE;
        self.edits.append(&mut task.edits);
        self.mems_flushed.append(&mut task.mems_flushed);
        self.cbs.push(task.cb);
        need_apply
    }

    pub async fn apply(&mut self) {
        let edits = std::mem::take(&mut self.edits);
        let mems = std::mem::take(&mut self.mems_flushed);
        let ret = self.manifest.process_manifest_writes(edits, mems).await;
        for cb in self.cbs.drain(..) {
            let _ = cb.send(ret.clone());
        }
    }
}

#[derive(Clone)]
pub struct ManifestScheduler {
    sender: UnboundedSender<ManifestTask>,
}

impl ManifestScheduler {
    pub fn new(sender: UnboundedSender<ManifestTask>) -> Self {
        Self { sender }
    }
}

/// How flush and compaction jobs install their results.
#[async_trait]
pub trait CompactionEngine: Clone + Send + Sync + 'static {
    async fn apply(&mut self, edits: Vec<VersionEdit>, mems_flushed: Vec<u64>) -> Result<()>;
}

#[async_trait]
impl CompactionEngine for ManifestScheduler {
    async fn apply(&mut self, edits: Vec<VersionEdit>, mems_flushed: Vec<u64>) -> Result<()> {
        let (cb, rx) = once_channel();
        let task = ManifestTask {
            edits,
            mems_flushed,
            cb,
        };
        self.sender
            .send(task)
            .await
            .map_err(|_| Error::Cancel("the manifest task has exited"))?;
        rx.await
            .map_err(|_| Error::Cancel("the manifest task dropped this apply"))?
    }
}

pub async fn store_current_file(
    fs: &Arc<dyn FileSystem>,
    descriptor_number: u64,
    db_path: &str,
) -> Result<()> {
    let mut contents = format!("MANIFEST-{:06}", descriptor_number);
    contents.push('\n');
    let tmp = make_temp_file(db_path, descriptor_number);
    let mut writer = fs.open_writable_file(tmp.clone())?;
    writer.append(contents.as_bytes()).await?;
    writer.sync().await?;
    fs.rename(tmp, make_current_file(db_path))
}

pub fn get_current_manifest_path(
    db_path: &str,
    fs: &dyn FileSystem,
) -> Result<(String, u64)> {
    let mut data = fs.read_file_content(make_current_file(db_path))?;
    if data.is_empty() || *data.last().unwrap() != b'\n' {
        return Err(Error::Corruption("CURRENT file corrupted".to_string()));
    }
    data.pop();
    let fname = String::from_utf8(data)
        .map_err(|_| Error::Corruption("CURRENT file corrupted".to_string()))?;
    let (tp, manifest_file_number) = parse_file_name(&fname)?;
    if tp != DbFileType::DescriptorFile {
        return Err(Error::Corruption("CURRENT file corrupted".to_string()));
    }
    let mut manifest_path = db_path.to_string();
    if !manifest_path.ends_with('/') {
        manifest_path.push('/');
    }
    manifest_path.push_str(&fname);
    Ok((manifest_path, manifest_file_number))
}
