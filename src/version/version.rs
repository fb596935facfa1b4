use crate::common::format::LookupKey;
use crate::common::{KeyComparator, Result};
use crate::iterator::{AsyncIterator, LevelConcatIterator, MergingIterator, SyncIteratorAdapter};
use crate::memtable::Memtable;
use crate::options::{ImmutableDbOptions, L0_COMPACTION_TRIGGER, MAX_MEM_COMPACT_LEVEL, NUM_LEVELS};
use crate::table::TableCache;
use crate::util::extract_user_key;
use crate::version::TableFile;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

pub fn total_file_size(files: &[Arc<TableFile>]) -> u64 {
    files.iter().map(|f| f.meta.file_size).sum()
}

/// An immutable snapshot of the file layout. Level 0 holds files newest
/// first and they may overlap; every deeper level is sorted by smallest key
/// with pairwise disjoint ranges.
pub struct Version {
    options: Arc<ImmutableDbOptions>,
    table_cache: Arc<TableCache>,
    levels: Vec<Vec<Arc<TableFile>>>,
    compaction_score: f64,
    compaction_level: usize,
    /// Filled by the read path when a file exhausts its seek budget.
    file_to_compact: Mutex<Option<(usize, Arc<TableFile>)>>,
}

impl Version {
    pub fn new(options: Arc<ImmutableDbOptions>, table_cache: Arc<TableCache>) -> Self {
        Self::with_files(options, table_cache, vec![vec![]; NUM_LEVELS])
    }

    pub fn with_files(
        options: Arc<ImmutableDbOptions>,
        table_cache: Arc<TableCache>,
        mut levels: Vec<Vec<Arc<TableFile>>>,
    ) -> Self {
        levels.resize_with(NUM_LEVELS, Vec::new);
        let ucmp = options.comparator.get_user_comparator().clone();
        levels[0].sort_by(|a, b| b.meta.number.cmp(&a.meta.number));
        for files in levels.iter_mut().skip(1) {
            files.sort_by(|a, b| {
                ucmp.compare_key(a.meta.smallest_user_key(), b.meta.smallest_user_key())
            });
            for pair in files.windows(2) {
                debug_assert!(
                    ucmp.compare_key(
                        pair[0].meta.largest_user_key(),
                        pair[1].meta.smallest_user_key()
                    ) == Ordering::Less,
                    "files within a level must stay disjoint"
                );
            }
        }
        let mut version = Version {
            options,
            table_cache,
            levels,
            compaction_score: 0.0,
            compaction_level: 0,
            file_to_compact: Mutex::new(None),
        };
        version.finalize();
        version
    }

    /// Produces the version that results from adding and deleting the given
    /// files.
    pub fn edit(
        &self,
        to_add: Vec<Arc<TableFile>>,
        to_delete: &HashSet<(u32, u64)>,
    ) -> Version {
        let mut levels: Vec<Vec<Arc<TableFile>>> = vec![vec![]; NUM_LEVELS];
        for (level, files) in self.levels.iter().enumerate() {
            for f in files {
                if !to_delete.contains(&(level as u32, f.meta.number)) {
                    levels[level].push(f.clone());
                }
            }
        }
        for f in to_add {
            let level = f.meta.level as usize;
            debug_assert!(level < NUM_LEVELS);
            levels[level].push(f);
        }
        Version::with_files(self.options.clone(), self.table_cache.clone(), levels)
    }

    fn finalize(&mut self) {
        let mut best_level = 0;
        let mut best_score = self.levels[0].len() as f64 / L0_COMPACTION_TRIGGER as f64;
        for level in 1..(NUM_LEVELS - 1) {
            let score =
                total_file_size(&self.levels[level]) as f64 / self.options.max_bytes_for_level(level);
            if score > best_score {
                best_score = score;
                best_level = level;
            }
        }
        self.compaction_score = best_score;
        self.compaction_level = best_level;
    }

    pub fn files(&self, level: usize) -> &[Arc<TableFile>] {
        &self.levels[level]
    }

    pub fn num_files(&self, level: usize) -> usize {
        self.levels[level].len()
    }

    pub fn level_bytes(&self, level: usize) -> u64 {
        total_file_size(&self.levels[level])
    }

    pub fn compaction_score(&self) -> f64 {
        self.compaction_score
    }

    pub fn compaction_level(&self) -> usize {
        self.compaction_level
    }

    pub fn file_to_compact(&self) -> Option<(usize, Arc<TableFile>)> {
        self.file_to_compact.lock().unwrap().clone()
    }

    pub fn live_files(&self) -> Vec<Arc<TableFile>> {
        self.levels.iter().flatten().cloned().collect()
    }

    pub async fn get(&self, key: &LookupKey) -> Result<Option<Vec<u8>>> {
        let ucmp = self.options.comparator.get_user_comparator().clone();
        let user_key = key.user_key();
        // The first file probed without answering pays for the wasted seek,
        // but only if the lookup had to consult a second file.
        let mut seek_file: Option<(usize, Arc<TableFile>)> = None;
        let mut charged = false;

        for level in 0..NUM_LEVELS {
            if level == 0 {
                // Level-0 files overlap; newest data wins, so probe in
                // descending file-number order.
                for f in &self.levels[0] {
                    if ucmp.compare_key(user_key, f.meta.smallest_user_key()) == Ordering::Less
                        || ucmp.compare_key(user_key, f.meta.largest_user_key())
                            == Ordering::Greater
                    {
                        continue;
                    }
                    match self.probe(&mut seek_file, &mut charged, 0, f, key).await? {
                        Some(found) => return Ok(found),
                        None => continue,
                    }
                }
            } else {
                let files = &self.levels[level];
                let idx = files.partition_point(|f| {
                    ucmp.compare_key(f.meta.largest_user_key(), user_key) == Ordering::Less
                });
                if idx >= files.len() {
                    continue;
                }
                let f = &files[idx];
                if ucmp.compare_key(user_key, f.meta.smallest_user_key()) == Ordering::Less {
                    continue;
                }
                if let Some(found) = self.probe(&mut seek_file, &mut charged, level, f, key).await?
                {
                    return Ok(found);
                }
            }
        }
        Ok(None)
    }

    /// Probes a single file. The outer `Option` says whether the search is
    /// over; the inner one is the result.
    async fn probe(
        &self,
        seek_file: &mut Option<(usize, Arc<TableFile>)>,
        charged: &mut bool,
        level: usize,
        f: &Arc<TableFile>,
        key: &LookupKey,
    ) -> Result<Option<Option<Vec<u8>>>> {
        if !*charged {
            match seek_file.clone() {
                Some((seek_level, seek_f)) => {
                    *charged = true;
                    if seek_f.charge_seek() {
                        *self.file_to_compact.lock().unwrap() = Some((seek_level, seek_f));
                    }
                }
                None => {
                    *seek_file = Some((level, f.clone()));
                }
            }
        }
        let found = self
            .table_cache
            .get(f.meta.number, f.meta.file_size, key.internal_key())
            .await?;
        if let Some((found_key, value)) = found {
            let ucmp = self.options.comparator.get_user_comparator();
            if ucmp.same_key(extract_user_key(&found_key), key.user_key()) {
                let tp = crate::common::format::extract_value_type(&found_key);
                if tp == crate::common::format::ValueType::TypeValue as u8 {
                    return Ok(Some(Some(value)));
                }
                // A tombstone ends the search.
                return Ok(Some(None));
            }
        }
        Ok(None)
    }

    /// Whether any file at `level` overlaps the user-key range. `None`
    /// bounds are unbounded.
    pub fn overlap_in_level(
        &self,
        level: usize,
        smallest_user_key: Option<&[u8]>,
        largest_user_key: Option<&[u8]>,
    ) -> bool {
        !self
            .overlapping_inputs(level, smallest_user_key, largest_user_key)
            .is_empty()
    }

    /// All files at `level` overlapping the range. At level 0 the range
    /// grows to cover overlapping files transitively, since level-0 files
    /// overlap each other.
    pub fn overlapping_inputs(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Vec<Arc<TableFile>> {
        let ucmp = self.options.comparator.get_user_comparator().clone();
        let mut user_begin = begin.map(|k| k.to_vec());
        let mut user_end = end.map(|k| k.to_vec());
        let mut inputs: Vec<Arc<TableFile>> = vec![];
        let mut i = 0;
        while i < self.levels[level].len() {
            let f = self.levels[level][i].clone();
            i += 1;
            let file_start = f.meta.smallest_user_key();
            let file_limit = f.meta.largest_user_key();
            if user_begin
                .as_ref()
                .map_or(false, |b| ucmp.compare_key(file_limit, b) == Ordering::Less)
            {
                continue;
            }
            if user_end
                .as_ref()
                .map_or(false, |e| ucmp.compare_key(file_start, e) == Ordering::Greater)
            {
                continue;
            }
            if level == 0 {
                // The file may widen the range; restart so every
                // transitively overlapping file is included.
                let mut restart = false;
                let widen_begin = user_begin
                    .as_ref()
                    .map_or(false, |b| ucmp.compare_key(file_start, b) == Ordering::Less);
                if widen_begin {
                    user_begin = Some(file_start.to_vec());
                    restart = true;
                }
                let widen_end = user_end
                    .as_ref()
                    .map_or(false, |e| ucmp.compare_key(file_limit, e) == Ordering::Greater);
                if widen_end {
                    user_end = Some(file_limit.to_vec());
                    restart = true;
                }
                if restart {
                    inputs.clear();
                    i = 0;
                    continue;
                }
            }
            inputs.push(f);
        }
        inputs
    }

    /// Chooses the level a fresh memtable flush lands on: level 0 when it
    /// overlaps there, otherwise as deep as it can go while the next level
    /// is clear and the grandparents do not overlap too much.
    pub fn pick_level_for_memtable_output(
        &self,
        smallest_user_key: &[u8],
        largest_user_key: &[u8],
    ) -> usize {
        let mut level = 0;
        if !self.overlap_in_level(0, Some(smallest_user_key), Some(largest_user_key)) {
            while level < MAX_MEM_COMPACT_LEVEL {
                if self.overlap_in_level(
                    level + 1,
                    Some(smallest_user_key),
                    Some(largest_user_key),
                ) {
                    break;
                }
                if level + 2 < NUM_LEVELS {
                    let overlaps = self.overlapping_inputs(
                        level + 2,
                        Some(smallest_user_key),
                        Some(largest_user_key),
                    );
                    if total_file_size(&overlaps) > self.options.max_grandparent_overlap_bytes() {
                        break;
                    }
                }
                level += 1;
            }
        }
        level
    }

    pub async fn add_iterators(&self, iters: &mut Vec<Box<dyn AsyncIterator>>) -> Result<()> {
        for f in &self.levels[0] {
            iters.push(
                self.table_cache
                    .new_iterator(f.meta.number, f.meta.file_size)
                    .await?,
            );
        }
        for files in self.levels.iter().skip(1) {
            if !files.is_empty() {
                iters.push(Box::new(LevelConcatIterator::new(
                    files.clone(),
                    self.table_cache.clone(),
                    self.options.comparator.clone(),
                )));
            }
        }
        Ok(())
    }

    pub fn table_cache(&self) -> &Arc<TableCache> {
        &self.table_cache
    }

    pub fn options(&self) -> &Arc<ImmutableDbOptions> {
        &self.options
    }
}

/// The read path's pinned view: active memtable, frozen memtables (oldest
/// first) and the current file layout.
pub struct SuperVersion {
    pub mem: Arc<Memtable>,
    pub imms: Vec<Arc<Memtable>>,
    pub current: Arc<Version>,
    pub version_number: u64,
}

impl SuperVersion {
    pub fn new(
        mem: Arc<Memtable>,
        imms: Vec<Arc<Memtable>>,
        current: Arc<Version>,
        version_number: u64,
    ) -> Self {
        Self {
            mem,
            imms,
            current,
            version_number,
        }
    }

    pub async fn get(&self, key: &LookupKey) -> Result<Option<Vec<u8>>> {
        if let Some(found) = self.mem.get(key) {
            return Ok(found);
        }
        for imm in self.imms.iter().rev() {
            if let Some(found) = imm.get(key) {
                return Ok(found);
            }
        }
        self.current.get(key).await
    }

    pub async fn new_merging_iterator(&self) -> Result<Box<dyn AsyncIterator>> {
        let mut iters: Vec<Box<dyn AsyncIterator>> = vec![];
        iters.push(Box::new(SyncIteratorAdapter::new(self.mem.new_iterator())));
        for imm in self.imms.iter().rev() {
            iters.push(Box::new(SyncIteratorAdapter::new(imm.new_iterator())));
        }
        self.current.add_iterators(&mut iters).await?;
        Ok(Box::new(MergingIterator::new(
            iters,
            self.current.options().comparator.clone(),
        )))
    }
}
