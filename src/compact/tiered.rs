use super::{level_target_size, Compaction};
use crate::version::Version;

/// Tiering: every level may hold several sorted runs. When a level
/// overflows, all of its runs merge into one new run at the next level.
pub struct TieredCompactionPicker {
    /// per-level growth factor
    ratio: u64,
    /// size target of Level 1
    base_level_size: u64,
    /// run count that triggers a Level 0 merge
    level0_compaction_trigger: usize,
}

impl TieredCompactionPicker {
    pub fn new(ratio: u64, base_level_size: u64, level0_compaction_trigger: usize) -> Self {
        Self {
            ratio,
            base_level_size,
            level0_compaction_trigger,
        }
    }

    pub fn pick(&self, version: &Version) -> Option<Compaction> {
        // smaller levels first
        for level in version.levels() {
            let l = level.level_id();
            if level.run_count() == 0 {
                continue;
            }
            let need = if l == 0 {
                level.run_count() >= self.level0_compaction_trigger
            } else {
                level.size() > level_target_size(self.base_level_size, self.ratio, l as u32)
            };
            if !need {
                continue;
            }
            let target_level = l + 1;
            let target_empty = version
                .levels()
                .get(target_level)
                .map(|t| t.run_count() == 0)
                .unwrap_or(true);
            let is_trivial_move = level.run_count() == 1 && target_empty;
            return Some(Compaction {
                input_runs: level.runs().to_vec(),
                input_ssts: Vec::new(),
                target_run: None,
                target_overlap: Vec::new(),
                src_level: l,
                target_level,
                is_trivial_move,
            });
        }
        None
    }
}
