use std::fmt::Write as _;
use std::ops::Bound;
use std::sync::Arc;

use anyhow::Result;

use crate::error::GetResult;
use crate::iterators::concat_iterator::SstConcatIterator;
use crate::iterators::merge_iterator::MergeIterator;
use crate::iterators::two_merge_iterator::TwoMergeIterator;
use crate::iterators::StorageIterator;
use crate::key::{KeySlice, RecordType};
use crate::level::{Level, SortedRun};
use crate::mem_table::{MemTable, MemTableIterator};

/// An immutable snapshot of the whole level tree. New versions are built by
/// flush and compaction installs; levels share their sorted runs by `Arc`.
pub struct Version {
    levels: Vec<Level>,
}

impl Version {
    pub fn new_empty() -> Self {
        Self { levels: Vec::new() }
    }

    pub fn with_levels(levels: Vec<Level>) -> Self {
        Self { levels }
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    /// A copy of this version with `runs` placed at the front (newest side)
    /// of level `level_id`, creating intermediate empty levels if needed.
    pub fn prepend_runs(&self, level_id: usize, runs: Vec<Arc<SortedRun>>) -> Version {
        let mut levels = self.levels.clone();
        while levels.len() <= level_id {
            levels.push(Level::empty(levels.len()));
        }
        let mut new_runs = runs;
        new_runs.extend(levels[level_id].runs().iter().cloned());
        levels[level_id] = Level::new(level_id, new_runs);
        Version { levels }
    }

    /// Consult levels in ascending order; the first hit wins.
    pub fn get(&self, user_key: &[u8], seq: u64) -> Result<GetResult> {
        for level in &self.levels {
            match level.get(user_key, seq)? {
                GetResult::NotFound => continue,
                hit => return Ok(hit),
            }
        }
        Ok(GetResult::NotFound)
    }
}

/// The read snapshot: the mutable memtable, the immutable memtables (newest
/// first) and the level tree. Immutable; shared by atomic handle swap.
/// Holding a SuperVersion keeps every referenced memtable, sorted run and
/// SSTable alive.
pub struct SuperVersion {
    pub mt: Arc<MemTable>,
    pub imms: Vec<Arc<MemTable>>,
    pub version: Arc<Version>,
}

impl SuperVersion {
    pub fn new(mt: Arc<MemTable>, imms: Vec<Arc<MemTable>>, version: Arc<Version>) -> Self {
        Self { mt, imms, version }
    }

    /// Point lookup in recency order: mutable memtable, immutables newest
    /// first, then the levels.
    pub fn get(&self, user_key: &[u8], seq: u64) -> Result<GetResult> {
        match self.mt.get(user_key, seq) {
            GetResult::NotFound => {}
            hit => return Ok(hit),
        }
        for imm in &self.imms {
            match imm.get(user_key, seq) {
                GetResult::NotFound => continue,
                hit => return Ok(hit),
            }
        }
        self.version.get(user_key, seq)
    }

    pub fn describe(&self) -> String {
        let mut out = String::new();
        let _ = write!(
            &mut out,
            "memtable: {} bytes, immutables: {}, tree: [",
            self.mt.approximate_size(),
            self.imms.len()
        );
        for level in self.version.levels() {
            let num_sst: usize = level.runs().iter().map(|r| r.sst_count()).sum();
            let _ = write!(&mut out, " L{}:{}r/{}t", level.level_id(), level.run_count(), num_sst);
        }
        out.push_str(" ]");
        out
    }
}

type SuperVersionIterInner =
    TwoMergeIterator<MergeIterator<MemTableIterator>, MergeIterator<SstConcatIterator>>;

/// Merges every component of a SuperVersion into one stream in internal-key
/// order. Memtable records shadow SSTable records of the same key because
/// the memtable side wins ties and carries the larger sequence numbers.
pub struct SuperVersionIterator {
    // pins the memtables and the level tree for the iterator's lifetime
    _sv: Arc<SuperVersion>,
    inner: SuperVersionIterInner,
}

impl SuperVersionIterator {
    pub fn create_and_seek_to_first(sv: Arc<SuperVersion>) -> Result<Self> {
        let mut mem_iters = Vec::with_capacity(1 + sv.imms.len());
        mem_iters.push(Box::new(sv.mt.iter()));
        for imm in &sv.imms {
            mem_iters.push(Box::new(imm.iter()));
        }
        let mut run_iters = Vec::new();
        for level in sv.version.levels() {
            for run in level.runs() {
                run_iters.push(Box::new(run.iter()?));
            }
        }
        let inner = TwoMergeIterator::create(
            MergeIterator::create(mem_iters),
            MergeIterator::create(run_iters),
        )?;
        Ok(Self { _sv: sv, inner })
    }

    /// Position at the first record not smaller than `(user_key, seq, Value)`.
    pub fn create_and_seek_to_key(
        sv: Arc<SuperVersion>,
        user_key: &[u8],
        seq: u64,
    ) -> Result<Self> {
        let lower = Bound::Included(KeySlice::new(user_key, seq, RecordType::Value));
        let mut mem_iters = Vec::with_capacity(1 + sv.imms.len());
        mem_iters.push(Box::new(sv.mt.scan(lower, Bound::Unbounded)));
        for imm in &sv.imms {
            mem_iters.push(Box::new(imm.scan(lower, Bound::Unbounded)));
        }
        let mut run_iters = Vec::new();
        for level in sv.version.levels() {
            for run in level.runs() {
                run_iters.push(Box::new(run.seek(user_key, seq)?));
            }
        }
        let inner = TwoMergeIterator::create(
            MergeIterator::create(mem_iters),
            MergeIterator::create(run_iters),
        )?;
        Ok(Self { _sv: sv, inner })
    }
}

impl StorageIterator for SuperVersionIterator {
    type KeyType<'a> = KeySlice<'a>;

    fn key(&self) -> KeySlice {
        self.inner.key()
    }

    fn value(&self) -> &[u8] {
        self.inner.value()
    }

    fn is_valid(&self) -> bool {
        self.inner.is_valid()
    }

    fn next(&mut self) -> Result<()> {
        self.inner.next()
    }

    fn number_of_iterators(&self) -> usize {
        self.inner.number_of_iterators()
    }
}
