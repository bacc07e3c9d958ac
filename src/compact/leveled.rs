use super::{level_target_size, Compaction};
use crate::version::Version;

/// Leveling: Level 0 holds overlapping runs, every deeper level exactly one
/// run of disjoint tables. L0 compacts wholesale into L1; deeper levels
/// push one table at a time into the overlapping part of the next level.
pub struct LeveledCompactionPicker {
    /// per-level growth factor
    ratio: u64,
    /// size target of Level 1
    base_level_size: u64,
    /// run count that triggers a Level 0 merge
    level0_compaction_trigger: usize,
}

impl LeveledCompactionPicker {
    pub fn new(ratio: u64, base_level_size: u64, level0_compaction_trigger: usize) -> Self {
        Self {
            ratio,
            base_level_size,
            level0_compaction_trigger,
        }
    }

    pub fn pick(&self, version: &Version) -> Option<Compaction> {
        let levels = version.levels();

        // Level 0: merge all runs, together with the L1 run, into a new L1 run.
        if let Some(l0) = levels.first() {
            if l0.run_count() >= self.level0_compaction_trigger {
                let target_run = levels.get(1).and_then(|l1| l1.runs().first().cloned());
                let target_overlap = target_run
                    .as_ref()
                    .map(|r| r.ssts().to_vec())
                    .unwrap_or_default();
                let is_trivial_move = l0.run_count() == 1 && target_run.is_none();
                return Some(Compaction {
                    input_runs: l0.runs().to_vec(),
                    input_ssts: Vec::new(),
                    target_run,
                    target_overlap,
                    src_level: 0,
                    target_level: 1,
                    is_trivial_move,
                });
            }
        }

        // Deeper levels: push the oldest table into the next level.
        for level in levels.iter().skip(1) {
            let l = level.level_id();
            if level.size() <= level_target_size(self.base_level_size, self.ratio, (l - 1) as u32)
            {
                continue;
            }
            let Some(run) = level.runs().first() else {
                continue;
            };
            let Some(sst) = run.ssts().iter().min_by_key(|s| s.sst_id()).cloned() else {
                continue;
            };
            let target_run = levels.get(l + 1).and_then(|t| t.runs().first().cloned());
            let target_overlap: Vec<_> = target_run
                .as_ref()
                .map(|r| {
                    r.ssts()
                        .iter()
                        .filter(|t| {
                            t.largest().user_key() >= sst.smallest().user_key()
                                && t.smallest().user_key() <= sst.largest().user_key()
                        })
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            let is_trivial_move = target_overlap.is_empty();
            return Some(Compaction {
                input_runs: Vec::new(),
                input_ssts: vec![sst],
                target_run,
                target_overlap,
                src_level: l,
                target_level: l + 1,
                is_trivial_move,
            });
        }
        None
    }
}
