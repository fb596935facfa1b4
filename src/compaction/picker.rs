use crate::common::KeyComparator;
use crate::compaction::Compaction;
use crate::options::NUM_LEVELS;
use crate::version::{total_file_size, TableFile, VersionSet};
use std::cmp::Ordering;
use std::sync::Arc;

/// Chooses the next compaction, preferring levels over their size budget and
/// falling back to a file whose seek budget ran dry. Returns `None` when the
/// tree is in shape.
pub fn pick_compaction(vs: &mut VersionSet) -> Option<Compaction> {
    let version = vs.current();
    let size_compaction = version.compaction_score() >= 1.0;
    let seek_compaction = version.file_to_compact();

    let (level, mut inputs0): (usize, Vec<Arc<TableFile>>) = if size_compaction {
        let level = version.compaction_level();
        // Round-robin across the key space: start right after where the
        // previous compaction of this level ended.
        let pointer = vs.compact_pointer(level).to_vec();
        let icmp = vs.comparator();
        let mut chosen = None;
        for f in version.files(level) {
            if pointer.is_empty()
                || icmp.compare_key(f.meta.largest.as_ref(), &pointer) == Ordering::Greater
            {
                chosen = Some(f.clone());
                break;
            }
        }
        let chosen = match chosen {
            Some(f) => f,
            // Wrap around to the beginning of the level.
            None => version.files(level).first()?.clone(),
        };
        (level, vec![chosen])
    } else if let Some((level, f)) = seek_compaction {
        // The read path only charges a file when a deeper one was also
        // consulted, so the last level never shows up here.
        if level + 1 >= NUM_LEVELS {
            return None;
        }
        (level, vec![f])
    } else {
        return None;
    };

    if level == 0 {
        // Level-0 files overlap each other; widen to the full closure.
        let (smallest, largest) = key_range(vs, &inputs0);
        inputs0 = version.overlapping_inputs(
            0,
            Some(crate::util::extract_user_key(&smallest)),
            Some(crate::util::extract_user_key(&largest)),
        );
        debug_assert!(!inputs0.is_empty());
    }
    Some(setup_other_inputs(vs, level, inputs0))
}

/// A compaction covering every file at `level` overlapping the user-key
/// range, for manual range compaction.
pub fn pick_range_compaction(
    vs: &mut VersionSet,
    level: usize,
    begin: Option<&[u8]>,
    end: Option<&[u8]>,
) -> Option<Compaction> {
    let version = vs.current();
    let inputs0 = version.overlapping_inputs(level, begin, end);
    if inputs0.is_empty() {
        return None;
    }
    Some(setup_other_inputs(vs, level, inputs0))
}

fn setup_other_inputs(
    vs: &mut VersionSet,
    level: usize,
    mut inputs0: Vec<Arc<TableFile>>,
) -> Compaction {
    let version = vs.current();
    let options = vs.options();
    let icmp = vs.comparator();

    let (mut smallest, mut largest) = key_range(vs, &inputs0);
    let mut inputs1 = version.overlapping_inputs(
        level + 1,
        Some(crate::util::extract_user_key(&smallest)),
        Some(crate::util::extract_user_key(&largest)),
    );

    // See whether level-`level` files can ride along without pulling more
    // files into level+1.
    if !inputs1.is_empty() {
        let (all_smallest, all_largest) = {
            let mut files = inputs0.clone();
            files.extend(inputs1.iter().cloned());
            key_range(vs, &files)
        };
        let expanded0 = version.overlapping_inputs(
            level,
            Some(crate::util::extract_user_key(&all_smallest)),
            Some(crate::util::extract_user_key(&all_largest)),
        );
        let inputs0_size = total_file_size(&inputs0);
        let expanded0_size = total_file_size(&expanded0);
        let inputs1_size = total_file_size(&inputs1);
        if expanded0.len() > inputs0.len()
            && inputs1_size + expanded0_size
                < options.expanded_compaction_byte_size_limit()
        {
            let (new_smallest, new_largest) = key_range(vs, &expanded0);
            let expanded1 = version.overlapping_inputs(
                level + 1,
                Some(crate::util::extract_user_key(&new_smallest)),
                Some(crate::util::extract_user_key(&new_largest)),
            );
            if expanded1.len() == inputs1.len() {
                log::info!(
                    "expanding compaction at level {}: {}+{} ({}+{} bytes) into {}+{} ({}+{} bytes)",
                    level,
                    inputs0.len(),
                    inputs1.len(),
                    inputs0_size,
                    inputs1_size,
                    expanded0.len(),
                    expanded1.len(),
                    expanded0_size,
                    inputs1_size,
                );
                inputs0 = expanded0;
                inputs1 = expanded1;
                smallest = new_smallest;
                largest = new_largest;
            }
        }
    }

    let grandparents = if level + 2 < NUM_LEVELS {
        version.overlapping_inputs(
            level + 2,
            Some(crate::util::extract_user_key(&smallest)),
            Some(crate::util::extract_user_key(&largest)),
        )
    } else {
        vec![]
    };

    // Remember the upper bound of this compaction even before it finishes;
    // a failed compaction retries the same range, which is harmless.
    let largest_input_key: Vec<u8> = inputs0
        .iter()
        .map(|f| f.meta.largest.as_ref())
        .fold(vec![], |acc: Vec<u8>, k| {
            if acc.is_empty() || icmp.compare_key(k, &acc) == Ordering::Greater {
                k.to_vec()
            } else {
                acc
            }
        });
    vs.set_compact_pointer(level, largest_input_key.clone());

    Compaction::new(
        level,
        level + 1,
        [inputs0, inputs1],
        grandparents,
        version,
        options.max_file_size as u64,
        options.max_grandparent_overlap_bytes(),
        largest_input_key,
    )
}

/// Smallest and largest internal keys across the files.
fn key_range(vs: &VersionSet, files: &[Arc<TableFile>]) -> (Vec<u8>, Vec<u8>) {
    let icmp = vs.comparator();
    let mut smallest: Vec<u8> = vec![];
    let mut largest: Vec<u8> = vec![];
    for f in files {
        if smallest.is_empty()
            || icmp.compare_key(f.meta.smallest.as_ref(), &smallest) == Ordering::Less
        {
            smallest = f.meta.smallest.to_vec();
        }
        if largest.is_empty()
            || icmp.compare_key(f.meta.largest.as_ref(), &largest) == Ordering::Greater
        {
            largest = f.meta.largest.to_vec();
        }
    }
    (smallest, largest)
}
