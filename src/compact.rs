pub mod leveled;
pub mod tiered;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};

pub use leveled::LeveledCompactionPicker;
pub use tiered::TieredCompactionPicker;

use crate::error::StorageError;
use crate::file::FileNameGenerator;
use crate::iterators::StorageIterator;
use crate::key::KeySlice;
use crate::level::{Level, SortedRun};
use crate::lsm_storage::LsmStorageOptions;
use crate::table::builder::SsTableBuilder;
use crate::table::{SsTable, SstInfo};
use crate::version::Version;

/// A unit of compaction work chosen by a picker.
pub struct Compaction {
    /// whole runs consumed from the source level
    pub input_runs: Vec<Arc<SortedRun>>,
    /// individual tables consumed from the source run (leveled, L >= 1)
    pub input_ssts: Vec<Arc<SsTable>>,
    /// the target-level run being merged with, if any
    pub target_run: Option<Arc<SortedRun>>,
    /// tables of `target_run` that get rewritten; the rest keep their identity
    pub target_overlap: Vec<Arc<SsTable>>,
    pub src_level: usize,
    pub target_level: usize,
    /// inputs can be reassigned to the target level without rewriting files
    pub is_trivial_move: bool,
}

impl Compaction {
    /// Every table whose file becomes obsolete once this compaction installs.
    pub fn obsolete_ssts(&self) -> impl Iterator<Item = &Arc<SsTable>> {
        self.input_runs
            .iter()
            .flat_map(|r| r.ssts().iter())
            .chain(self.input_ssts.iter())
            .chain(self.target_overlap.iter())
    }

    /// Build the version reflecting this compaction. `new_ssts` is the job
    /// output, empty for a trivial move.
    pub fn apply(&self, base: &Version, new_ssts: Vec<Arc<SsTable>>) -> Version {
        let mut levels: Vec<Level> = base.levels().to_vec();
        while levels.len() <= self.target_level {
            levels.push(Level::empty(levels.len()));
        }

        // drop consumed runs from the source level
        if !self.input_runs.is_empty() {
            let remaining: Vec<_> = levels[self.src_level]
                .runs()
                .iter()
                .filter(|r| !self.input_runs.iter().any(|i| Arc::ptr_eq(i, *r)))
                .cloned()
                .collect();
            levels[self.src_level] = Level::new(self.src_level, remaining);
        }

        // drop consumed tables from their source run
        if !self.input_ssts.is_empty() {
            let runs: Vec<Arc<SortedRun>> = levels[self.src_level]
                .runs()
                .iter()
                .map(|r| {
                    let picked = |s: &Arc<SsTable>| {
                        self.input_ssts.iter().any(|i| Arc::ptr_eq(i, s))
                    };
                    if r.ssts().iter().any(picked) {
                        Arc::new(SortedRun::new(
                            r.ssts().iter().filter(|s| !picked(*s)).cloned().collect(),
                        ))
                    } else {
                        r.clone()
                    }
                })
                .filter(|r| r.sst_count() > 0)
                .collect();
            levels[self.src_level] = Level::new(self.src_level, runs);
        }

        // compose the target level
        if self.is_trivial_move && !self.input_runs.is_empty() {
            // whole runs change level, keeping their identity
            let mut runs = self.input_runs.clone();
            runs.extend(levels[self.target_level].runs().iter().cloned());
            levels[self.target_level] = Level::new(self.target_level, runs);
        } else {
            // ordered union of the untouched target tables, the merge output
            // and (for a trivial sst move) the moved inputs
            let mut merged: Vec<Arc<SsTable>> = Vec::new();
            if let Some(target_run) = &self.target_run {
                merged.extend(
                    target_run
                        .ssts()
                        .iter()
                        .filter(|s| !self.target_overlap.iter().any(|o| Arc::ptr_eq(o, *s)))
                        .cloned(),
                );
            }
            if self.is_trivial_move {
                merged.extend(self.input_ssts.iter().cloned());
            } else {
                merged.extend(new_ssts);
            }
            merged.sort_by(|a, b| a.smallest().as_key_slice().cmp(&b.smallest().as_key_slice()));

            let mut runs: Vec<Arc<SortedRun>> = levels[self.target_level]
                .runs()
                .iter()
                .filter(|r| {
                    self.target_run
                        .as_ref()
                        .map(|t| !Arc::ptr_eq(t, *r))
                        .unwrap_or(true)
                })
                .cloned()
                .collect();
            if !merged.is_empty() {
                runs.insert(0, Arc::new(SortedRun::new(merged)));
            }
            levels[self.target_level] = Level::new(self.target_level, runs);
        }

        Version::with_levels(levels)
    }
}

/// Strategy dispatch for choosing the next compaction.
pub(crate) enum CompactionPicker {
    Leveled(LeveledCompactionPicker),
    Tiered(TieredCompactionPicker),
}

impl CompactionPicker {
    pub fn from_options(options: &LsmStorageOptions) -> Result<Self> {
        let base_level_size = options.level0_compaction_trigger as u64 * options.sst_file_size;
        match options.compaction_strategy_name.as_str() {
            "leveled" => Ok(CompactionPicker::Leveled(LeveledCompactionPicker::new(
                options.compaction_size_ratio,
                base_level_size,
                options.level0_compaction_trigger,
            ))),
            "tiered" => Ok(CompactionPicker::Tiered(TieredCompactionPicker::new(
                options.compaction_size_ratio,
                base_level_size,
                options.level0_compaction_trigger,
            ))),
            other => bail!(StorageError::InvalidArgument(format!(
                "unknown compaction strategy {:?}",
                other
            ))),
        }
    }

    pub fn pick(&self, version: &Version) -> Option<Compaction> {
        match self {
            CompactionPicker::Leveled(picker) => picker.pick(version),
            CompactionPicker::Tiered(picker) => picker.pick(version),
        }
    }
}

/// `base * ratio^exp`, saturating; level targets grow geometrically.
pub(crate) fn level_target_size(base: u64, ratio: u64, exp: u32) -> u64 {
    ratio
        .checked_pow(exp)
        .and_then(|m| base.checked_mul(m))
        .unwrap_or(u64::MAX)
}

/// Runs a merged record stream into one or more SSTables. Output files are
/// cut at `sst_file_size`, but never between two versions of the same user
/// key, so a key's version chain stays within one table of the run.
pub struct CompactionJob<'a> {
    filename_gen: &'a FileNameGenerator,
    options: &'a LsmStorageOptions,
}

impl<'a> CompactionJob<'a> {
    pub fn new(filename_gen: &'a FileNameGenerator, options: &'a LsmStorageOptions) -> Self {
        Self {
            filename_gen,
            options,
        }
    }

    pub fn run<I>(&self, mut iter: I) -> Result<Vec<SstInfo>>
    where
        I: for<'k> StorageIterator<KeyType<'k> = KeySlice<'k>>,
    {
        let mut created: Vec<PathBuf> = Vec::new();
        // on any failure the whole job failed; none of its output may survive
        macro_rules! try_or_cleanup {
            ($e:expr) => {
                match $e {
                    Ok(v) => v,
                    Err(e) => {
                        for path in &created {
                            let _ = std::fs::remove_file(path);
                        }
                        return Err(e.into());
                    }
                }
            };
        }

        let mut outputs = Vec::new();
        let mut builder: Option<SsTableBuilder> = None;
        let mut last_user_key: Vec<u8> = Vec::new();
        let mut any_written = false;

        while iter.is_valid() {
            let same_as_last = any_written && iter.key().user_key() == last_user_key;

            if let Some(b) = &builder {
                if b.estimated_size() >= self.options.sst_file_size && !same_as_last {
                    outputs.push(try_or_cleanup!(builder.take().unwrap().finish()));
                }
            }
            if builder.is_none() {
                let (sst_id, path) = self.filename_gen.next();
                created.push(path.clone());
                builder = Some(try_or_cleanup!(SsTableBuilder::new(
                    sst_id,
                    &path,
                    self.options
                )));
            }

            let b = builder.as_mut().unwrap();
            try_or_cleanup!(b.add(iter.key(), iter.value()));
            if !same_as_last {
                last_user_key.clear();
                last_user_key.extend_from_slice(iter.key().user_key());
                any_written = true;
            }
            try_or_cleanup!(iter.next());
        }
        if let Some(b) = builder {
            if b.count() > 0 {
                outputs.push(try_or_cleanup!(b.finish()));
            }
        }
        Ok(outputs)
    }
}
