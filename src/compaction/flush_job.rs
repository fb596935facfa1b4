use crate::common::{make_table_file_name, Result};
use crate::iterator::{AsyncIterator, InternalIterator};
use crate::manifest::CompactionEngine;
use crate::memtable::Memtable;
use crate::options::ImmutableDbOptions;
use crate::table::{TableBuilder, TableCache};
use crate::version::{DbNumbers, FileMetaData, Version, VersionEdit};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Writes one immutable memtable out as a table file: build in internal-key
/// order, read the result back through the table cache to verify it, then
/// choose the deepest level the file may safely land on.
pub async fn build_memtable_table(
    mem: &Arc<Memtable>,
    base: &Arc<Version>,
    file_number: u64,
    options: &Arc<ImmutableDbOptions>,
    table_cache: &Arc<TableCache>,
) -> Result<FileMetaData> {
    let fname = make_table_file_name(&options.db_path, file_number);
    log::info!("flushing memtable {} to {:?}", mem.id(), fname);
    let writer = options.fs.open_writable_file(fname)?;
    let mut builder = TableBuilder::new(writer, options.comparator.clone(), options.block_size);
    let mut meta = FileMetaData::new(file_number, 0, vec![], vec![]);
    let mut iter = mem.new_iterator();
    iter.seek_to_first();
    while iter.valid() {
        meta.update_boundary(iter.key());
        builder.add(iter.key(), iter.value()).await?;
        iter.next();
    }
    builder.finish().await?;
    meta.file_size = builder.file_size();

    // Reading the fresh table catches a bad write before the manifest
    // commits to it.
    let mut verify = table_cache
        .new_iterator(meta.number, meta.file_size)
        .await?;
    verify.seek_to_first().await;
    verify.status()?;
    drop(verify);

    meta.level =
        base.pick_level_for_memtable_output(meta.smallest_user_key(), meta.largest_user_key())
            as u32;
    Ok(meta)
}

/// The edit that installs a flushed memtable: add its table and retire every
/// WAL older than the one that replaced the memtable.
pub fn flush_edit(mem: &Arc<Memtable>, meta: &FileMetaData) -> VersionEdit {
    let mut edit = VersionEdit::default();
    edit.set_log_number(mem.get_next_log_number());
    edit.add_file(
        meta.level,
        meta.number,
        meta.file_size,
        meta.smallest.as_ref(),
        meta.largest.as_ref(),
    );
    edit
}

pub async fn run_flush_job<E: CompactionEngine>(
    engine: &mut E,
    mem: Arc<Memtable>,
    base: Arc<Version>,
    numbers: Arc<DbNumbers>,
    options: Arc<ImmutableDbOptions>,
    table_cache: Arc<TableCache>,
    pending_outputs: Arc<Mutex<HashSet<u64>>>,
) -> Result<FileMetaData> {
    let file_number = numbers.new_file_number();
    pending_outputs.lock().unwrap().insert(file_number);
    let ret = async {
        let meta =
            build_memtable_table(&mem, &base, file_number, &options, &table_cache).await?;
        let edit = flush_edit(&mem, &meta);
        engine.apply(vec![edit], vec![mem.id()]).await?;
        log::info!(
            "flushed memtable {} as table {} ({} bytes) at level {}",
            mem.id(),
            meta.number,
            meta.file_size,
            meta.level
        );
        Ok(meta)
    }
    .await;
    pending_outputs.lock().unwrap().remove(&file_number);
    if ret.is_err() {
        table_cache.evict(file_number);
        let _ = options
            .fs
            .remove(make_table_file_name(&options.db_path, file_number));
    }
    ret
}
