use std::sync::Arc;

use anyhow::Result;

use crate::cache::BlockCache;
use crate::error::GetResult;
use crate::iterators::concat_iterator::SstConcatIterator;
use crate::key::{KeyBytes, KeySlice, RecordType};
use crate::table::{SsTable, SstInfo};

/// An ordered sequence of SSTables covering disjoint key ranges; logically
/// one sorted stream of records.
pub struct SortedRun {
    ssts: Vec<Arc<SsTable>>,
    size: u64,
}

impl SortedRun {
    pub fn new(ssts: Vec<Arc<SsTable>>) -> Self {
        debug_assert!(ssts
            .windows(2)
            .all(|w| w[0].largest().as_key_slice() < w[1].smallest().as_key_slice()));
        let size = ssts.iter().map(|sst| sst.size()).sum();
        Self { ssts, size }
    }

    /// Open every SSTable described by `infos`; used when loading metadata
    /// and when installing compaction output.
    pub fn open(
        infos: Vec<SstInfo>,
        block_cache: Option<Arc<BlockCache>>,
        use_direct_io: bool,
    ) -> Result<Self> {
        let mut ssts = Vec::with_capacity(infos.len());
        for info in infos {
            ssts.push(Arc::new(SsTable::open(
                info,
                block_cache.clone(),
                use_direct_io,
            )?));
        }
        Ok(Self::new(ssts))
    }

    /// Point lookup: binary search the table whose range may hold the key.
    pub fn get(&self, user_key: &[u8], seq: u64) -> Result<GetResult> {
        let target = KeySlice::new(user_key, seq, RecordType::Value);
        let idx = self
            .ssts
            .partition_point(|sst| sst.largest().as_key_slice() < target);
        if idx >= self.ssts.len() {
            return Ok(GetResult::NotFound);
        }
        let sst = &self.ssts[idx];
        if user_key < sst.smallest().user_key() {
            // the target falls in the gap before this table
            return Ok(GetResult::NotFound);
        }
        sst.get(user_key, seq)
    }

    pub fn iter(&self) -> Result<SstConcatIterator> {
        SstConcatIterator::create_and_seek_to_first(self.ssts.clone())
    }

    pub fn seek(&self, user_key: &[u8], seq: u64) -> Result<SstConcatIterator> {
        SstConcatIterator::create_and_seek_to_key(self.ssts.clone(), user_key, seq)
    }

    pub fn ssts(&self) -> &[Arc<SsTable>] {
        &self.ssts
    }

    pub fn sst_count(&self) -> usize {
        self.ssts.len()
    }

    /// Total size of the SSTables in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn smallest(&self) -> &KeyBytes {
        self.ssts.first().map(|s| s.smallest()).unwrap()
    }

    pub fn largest(&self) -> &KeyBytes {
        self.ssts.last().map(|s| s.largest()).unwrap()
    }

    /// Mark every table of this run for file removal once unreferenced.
    pub fn set_remove_on_drop(&self, remove: bool) {
        for sst in &self.ssts {
            sst.set_remove_on_drop(remove);
        }
    }
}

/// One level of the tree: an ordered list of sorted runs, newest first.
/// Level 0 may hold many overlapping runs; deeper levels hold one under
/// leveling and several under tiering.
#[derive(Clone)]
pub struct Level {
    level_id: usize,
    runs: Vec<Arc<SortedRun>>,
    size: u64,
}

impl Level {
    pub fn new(level_id: usize, runs: Vec<Arc<SortedRun>>) -> Self {
        let size = runs.iter().map(|r| r.size()).sum();
        Self {
            level_id,
            runs,
            size,
        }
    }

    pub fn empty(level_id: usize) -> Self {
        Self::new(level_id, Vec::new())
    }

    pub fn get(&self, user_key: &[u8], seq: u64) -> Result<GetResult> {
        for run in &self.runs {
            match run.get(user_key, seq)? {
                GetResult::NotFound => continue,
                hit => return Ok(hit),
            }
        }
        Ok(GetResult::NotFound)
    }

    pub fn level_id(&self) -> usize {
        self.level_id
    }

    pub fn runs(&self) -> &[Arc<SortedRun>] {
        &self.runs
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}
