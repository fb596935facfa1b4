use crate::common::{make_table_file_name, KeyComparator, Result};
use crate::compaction::{Compaction, CompactionIter};
use crate::iterator::{AsyncIterator, LevelConcatIterator, MergingIterator};
use crate::manifest::CompactionEngine;
use crate::options::ImmutableDbOptions;
use crate::table::{TableBuilder, TableCache};
use crate::version::{DbNumbers, FileMetaData, VersionEdit};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Merges the inputs, applies the drop rules, and rewrites the survivors as
/// a run of output files at `output_level`, rolling to a new file at the
/// size cap or when the grandparent overlap grows too expensive. Installs
/// everything with a single version edit.
pub async fn run_compaction_job<E: CompactionEngine>(
    engine: &mut E,
    mut compaction: Compaction,
    numbers: Arc<DbNumbers>,
    options: Arc<ImmutableDbOptions>,
    table_cache: Arc<TableCache>,
    pending_outputs: Arc<Mutex<HashSet<u64>>>,
    smallest_snapshot: u64,
) -> Result<()> {
    log::info!(
        "compacting {}@{} + {}@{} files ({} bytes)",
        compaction.inputs[0].len(),
        compaction.level,
        compaction.inputs[1].len(),
        compaction.output_level,
        compaction.total_input_bytes(),
    );
    let mut outputs: Vec<FileMetaData> = vec![];
    let ret = write_outputs(
        &mut compaction,
        &numbers,
        &options,
        &table_cache,
        &pending_outputs,
        smallest_snapshot,
        &mut outputs,
    )
    .await;
    match ret {
        Ok(()) => {
            let mut edit = VersionEdit::default();
            compaction.add_input_deletions(&mut edit);
            for m in &outputs {
                edit.add_file(
                    compaction.output_level as u32,
                    m.number,
                    m.file_size,
                    m.smallest.as_ref(),
                    m.largest.as_ref(),
                );
            }
            edit.set_compact_pointer(compaction.level as u32, &compaction.largest_input_key);
            let ret = engine.apply(vec![edit], vec![]).await;
            let mut pending = pending_outputs.lock().unwrap();
            for m in &outputs {
                pending.remove(&m.number);
            }
            drop(pending);
            if ret.is_ok() {
                log::info!(
                    "compacted to level {}: {} output files",
                    compaction.output_level,
                    outputs.len()
                );
            } else {
                remove_orphans(&options, &table_cache, &outputs);
            }
            ret
        }
        Err(e) => {
            let mut pending = pending_outputs.lock().unwrap();
            for m in &outputs {
                pending.remove(&m.number);
            }
            drop(pending);
            remove_orphans(&options, &table_cache, &outputs);
            Err(e)
        }
    }
}

fn remove_orphans(
    options: &Arc<ImmutableDbOptions>,
    table_cache: &Arc<TableCache>,
    outputs: &[FileMetaData],
) {
    for m in outputs {
        table_cache.evict(m.number);
        let _ = options
            .fs
            .remove(make_table_file_name(&options.db_path, m.number));
    }
}

async fn write_outputs(
    compaction: &mut Compaction,
    numbers: &Arc<DbNumbers>,
    options: &Arc<ImmutableDbOptions>,
    table_cache: &Arc<TableCache>,
    pending_outputs: &Arc<Mutex<HashSet<u64>>>,
    smallest_snapshot: u64,
    outputs: &mut Vec<FileMetaData>,
) -> Result<()> {
    let mut iters: Vec<Box<dyn AsyncIterator>> = vec![];
    for (which, input) in compaction.inputs.iter().enumerate() {
        if input.is_empty() {
            continue;
        }
        if which == 0 && compaction.level == 0 {
            // Level-0 inputs overlap; each file merges on its own.
            for f in input {
                iters.push(
                    table_cache
                        .new_iterator(f.meta.number, f.meta.file_size)
                        .await?,
                );
            }
        } else {
            iters.push(Box::new(LevelConcatIterator::new(
                input.clone(),
                table_cache.clone(),
                options.comparator.clone(),
            )));
        }
    }
    let merged = MergingIterator::new(iters, options.comparator.clone());
    let mut iter = CompactionIter::new(
        Box::new(merged),
        options.comparator.get_user_comparator().clone(),
        smallest_snapshot,
    );

    let icmp = options.comparator.clone();
    let ucmp = icmp.get_user_comparator().clone();
    let mut builder: Option<(TableBuilder, FileMetaData)> = None;
    iter.seek_to_first(compaction).await;
    while iter.valid() {
        // Outputs only roll over between distinct user keys; splitting the
        // versions of one key across files would break the disjointness of
        // the output level.
        let roll = match builder.as_ref() {
            Some((b, meta)) => {
                !ucmp.same_key(
                    crate::util::extract_user_key(meta.largest.as_ref()),
                    crate::util::extract_user_key(iter.key()),
                ) && (b.file_size() >= compaction.max_output_file_size
                    || compaction.should_stop_before(iter.key(), &icmp))
            }
            None => false,
        };
        if roll {
            finish_output(builder.take().unwrap(), outputs).await?;
        }
        if builder.is_none() {
            let file_number = numbers.new_file_number();
            pending_outputs.lock().unwrap().insert(file_number);
            let fname = make_table_file_name(&options.db_path, file_number);
            let writer = options.fs.open_writable_file(fname)?;
            builder = Some((
                TableBuilder::new(writer, options.comparator.clone(), options.block_size),
                FileMetaData::new(file_number, compaction.output_level as u32, vec![], vec![]),
            ));
        }
        let (b, meta) = builder.as_mut().unwrap();
        meta.update_boundary(iter.key());
        b.add(iter.key(), iter.value()).await?;
        iter.next(compaction).await;
    }
    iter.status()?;
    if let Some(output) = builder.take() {
        finish_output(output, outputs).await?;
    }
    // Verify the outputs are readable before they are installed.
    for m in outputs.iter() {
        let mut verify = table_cache.new_iterator(m.number, m.file_size).await?;
        verify.seek_to_first().await;
        verify.status()?;
    }
    Ok(())
}

async fn finish_output(
    (mut builder, mut meta): (TableBuilder, FileMetaData),
    outputs: &mut Vec<FileMetaData>,
) -> Result<()> {
    builder.finish().await?;
    meta.file_size = builder.file_size();
    outputs.push(meta);
    Ok(())
}
