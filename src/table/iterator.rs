use std::sync::Arc;

use anyhow::Result;

use super::SsTable;
use crate::block::iterator::BlockIterator;
use crate::iterators::StorageIterator;
use crate::key::KeySlice;

/// An iterator over the contents of an SSTable. Crosses block boundaries by
/// opening the next data block through the cache.
pub struct SsTableIterator {
    table: Arc<SsTable>,
    block_iter: BlockIterator,
    block_idx: usize,
}

impl SsTableIterator {
    pub fn create_and_seek_to_first(table: Arc<SsTable>) -> Result<Self> {
        let (block_idx, block_iter) = Self::seek_to_first_inner(&table)?;
        Ok(Self {
            block_iter,
            block_idx,
            table,
        })
    }

    fn seek_to_first_inner(table: &Arc<SsTable>) -> Result<(usize, BlockIterator)> {
        Ok((
            0,
            BlockIterator::create_and_seek_to_first(table.read_block_cached(0)?),
        ))
    }

    /// Position at the first record that is not smaller than
    /// `(user_key, seq, Value)`.
    pub fn create_and_seek_to_key(table: Arc<SsTable>, user_key: &[u8], seq: u64) -> Result<Self> {
        let (block_idx, block_iter) = Self::seek_to_key_inner(&table, user_key, seq)?;
        Ok(Self {
            block_idx,
            block_iter,
            table,
        })
    }

    fn seek_to_key_inner(
        table: &Arc<SsTable>,
        user_key: &[u8],
        seq: u64,
    ) -> Result<(usize, BlockIterator)> {
        let mut block_idx = table.find_block_idx(user_key, seq);
        if block_idx >= table.num_blocks() {
            // past the last key; leave the cursor invalid on the last block
            block_idx = table.num_blocks() - 1;
            let mut iter =
                BlockIterator::create_and_seek_to_first(table.read_block_cached(block_idx)?);
            iter.seek_to_key(user_key, seq);
            return Ok((block_idx, iter));
        }
        let mut block_iter =
            BlockIterator::create_and_seek_to_key(table.read_block_cached(block_idx)?, user_key, seq);
        if !block_iter.is_valid() {
            block_idx += 1;
            if block_idx < table.num_blocks() {
                block_iter =
                    BlockIterator::create_and_seek_to_first(table.read_block_cached(block_idx)?);
            }
        }
        Ok((block_idx, block_iter))
    }
}

impl StorageIterator for SsTableIterator {
    type KeyType<'a> = KeySlice<'a>;

    fn value(&self) -> &[u8] {
        self.block_iter.value()
    }

    fn key(&self) -> KeySlice {
        self.block_iter.key()
    }

    fn is_valid(&self) -> bool {
        self.block_iter.is_valid()
    }

    fn next(&mut self) -> Result<()> {
        self.block_iter.next();
        if !self.block_iter.is_valid() {
            self.block_idx += 1;
            if self.block_idx < self.table.num_blocks() {
                self.block_iter =
                    BlockIterator::create_and_seek_to_first(self.table.read_block_cached(self.block_idx)?);
            }
        }
        Ok(())
    }
}
