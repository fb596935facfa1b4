mod compaction_iter;
mod compaction_job;
mod flush_job;
mod picker;

pub use compaction_iter::CompactionIter;
pub use compaction_job::run_compaction_job;
pub use flush_job::{build_memtable_table, flush_edit, run_flush_job};
pub use picker::{pick_compaction, pick_range_compaction};

use crate::common::{InternalKeyComparator, KeyComparator};
use crate::options::NUM_LEVELS;
use crate::version::{TableFile, Version};
use std::cmp::Ordering;
use std::sync::Arc;

/// A picked compaction: the input files at `level` and `level + 1`, the
/// grandparent files used to bound output overlap, and the version the
/// inputs were chosen from (pinning them until the job finishes).
pub struct Compaction {
    pub level: usize,
    pub output_level: usize,
    pub inputs: [Vec<Arc<TableFile>>; 2],
    pub grandparents: Vec<Arc<TableFile>>,
    pub input_version: Arc<Version>,
    pub max_output_file_size: u64,
    pub max_grandparent_overlap_bytes: u64,
    /// Largest internal key of inputs[0]; recorded as the level's next
    /// compaction start.
    pub largest_input_key: Vec<u8>,

    grandparent_index: usize,
    seen_key: bool,
    overlapped_bytes: u64,
    level_ptrs: Vec<usize>,
}

impl Compaction {
    pub fn new(
        level: usize,
        output_level: usize,
        inputs: [Vec<Arc<TableFile>>; 2],
        grandparents: Vec<Arc<TableFile>>,
        input_version: Arc<Version>,
        max_output_file_size: u64,
        max_grandparent_overlap_bytes: u64,
        largest_input_key: Vec<u8>,
    ) -> Self {
        Self {
            level,
            output_level,
            inputs,
            grandparents,
            input_version,
            max_output_file_size,
            max_grandparent_overlap_bytes,
            largest_input_key,
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            level_ptrs: vec![0; NUM_LEVELS],
        }
    }

    /// A single file promoted without rewriting. Only above level 0 and only
    /// when nothing at the next level overlaps and the grandparents stay
    /// cheap.
    pub fn is_trivial_move(&self) -> bool {
        self.level > 0
            && self.inputs[0].len() == 1
            && self.inputs[1].is_empty()
            && crate::version::total_file_size(&self.grandparents)
                <= self.max_grandparent_overlap_bytes
    }

    /// True when the current output should be closed before `internal_key`
    /// is added, to keep later compactions of the output cheap.
    pub fn should_stop_before(
        &mut self,
        internal_key: &[u8],
        icmp: &InternalKeyComparator,
    ) -> bool {
        while self.grandparent_index < self.grandparents.len()
            && icmp.compare_key(
                internal_key,
                self.grandparents[self.grandparent_index].meta.largest.as_ref(),
            ) == Ordering::Greater
        {
            if self.seen_key {
                self.overlapped_bytes += self.grandparents[self.grandparent_index].meta.file_size;
            }
            self.grandparent_index += 1;
        }
        self.seen_key = true;
        if self.overlapped_bytes > self.max_grandparent_overlap_bytes {
            self.overlapped_bytes = 0;
            true
        } else {
            false
        }
    }

    /// Whether `user_key` cannot exist at any level deeper than the output
    /// level, so a sufficiently old tombstone for it may be dropped. The
    /// per-level cursors rely on compaction keys arriving in order.
    pub fn is_base_level_for_key(&mut self, user_key: &[u8]) -> bool {
        let ucmp = self.input_version.options().comparator.get_user_comparator().clone();
        for level in (self.output_level + 1)..NUM_LEVELS {
            let files = self.input_version.files(level);
            while self.level_ptrs[level] < files.len() {
                let f = &files[self.level_ptrs[level]];
                if ucmp.compare_key(user_key, f.meta.largest_user_key()) != Ordering::Greater {
                    if ucmp.compare_key(user_key, f.meta.smallest_user_key())
                        != Ordering::Less
                    {
                        return false;
                    }
                    break;
                }
                self.level_ptrs[level] += 1;
            }
        }
        true
    }

    pub fn add_input_deletions(&self, edit: &mut crate::version::VersionEdit) {
        for (which, input) in self.inputs.iter().enumerate() {
            let level = if which == 0 { self.level } else { self.level + 1 };
            for f in input {
                edit.delete_file(level as u32, f.meta.number);
            }
        }
    }

    pub fn total_input_bytes(&self) -> u64 {
        crate::version::total_file_size(&self.inputs[0])
            + crate::version::total_file_size(&self.inputs[1])
    }
}
