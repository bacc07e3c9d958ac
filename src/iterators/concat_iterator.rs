use std::sync::Arc;

use anyhow::Result;

use super::StorageIterator;
use crate::key::{KeySlice, RecordType};
use crate::table::iterator::SsTableIterator;
use crate::table::SsTable;

/// Chains iterators over SSTables whose key ranges do not overlap, i.e. one
/// sorted run. Only one table iterator is open at a time.
pub struct SstConcatIterator {
    current: Option<SsTableIterator>,
    next_sst_idx: usize,
    sstables: Vec<Arc<SsTable>>,
}

impl SstConcatIterator {
    pub fn create_and_seek_to_first(sstables: Vec<Arc<SsTable>>) -> Result<Self> {
        Self::check_sst_valid(&sstables);
        if sstables.is_empty() {
            return Ok(Self {
                current: None,
                next_sst_idx: 0,
                sstables,
            });
        }
        let mut iter = Self {
            current: Some(SsTableIterator::create_and_seek_to_first(
                sstables[0].clone(),
            )?),
            next_sst_idx: 1,
            sstables,
        };
        iter.move_until_valid()?;
        Ok(iter)
    }

    pub fn create_and_seek_to_key(
        sstables: Vec<Arc<SsTable>>,
        user_key: &[u8],
        seq: u64,
    ) -> Result<Self> {
        Self::check_sst_valid(&sstables);
        let target = KeySlice::new(user_key, seq, RecordType::Value);
        // first table whose largest key reaches the target
        let idx = sstables.partition_point(|table| table.largest().as_key_slice() < target);
        if idx >= sstables.len() {
            return Ok(Self {
                current: None,
                next_sst_idx: sstables.len(),
                sstables,
            });
        }
        let mut iter = Self {
            current: Some(SsTableIterator::create_and_seek_to_key(
                sstables[idx].clone(),
                user_key,
                seq,
            )?),
            next_sst_idx: idx + 1,
            sstables,
        };
        iter.move_until_valid()?;
        Ok(iter)
    }

    fn check_sst_valid(sstables: &[Arc<SsTable>]) {
        debug_assert!(sstables.windows(2).all(|w| {
            w[0].largest().as_key_slice() < w[1].smallest().as_key_slice()
        }));
    }

    fn move_until_valid(&mut self) -> Result<()> {
        while let Some(iter) = self.current.as_ref() {
            if iter.is_valid() {
                break;
            }
            if self.next_sst_idx >= self.sstables.len() {
                self.current = None;
            } else {
                self.current = Some(SsTableIterator::create_and_seek_to_first(
                    self.sstables[self.next_sst_idx].clone(),
                )?);
                self.next_sst_idx += 1;
            }
        }
        Ok(())
    }
}

impl StorageIterator for SstConcatIterator {
    type KeyType<'a> = KeySlice<'a>;

    fn is_valid(&self) -> bool {
        self.current
            .as_ref()
            .map(|iter| iter.is_valid())
            .unwrap_or(false)
    }

    fn key(&self) -> KeySlice {
        self.current.as_ref().unwrap().key()
    }

    fn value(&self) -> &[u8] {
        self.current.as_ref().unwrap().value()
    }

    fn next(&mut self) -> Result<()> {
        if let Some(iter) = self.current.as_mut() {
            iter.next()?;
        }
        self.move_until_valid()?;
        Ok(())
    }

    fn number_of_iterators(&self) -> usize {
        1
    }
}
