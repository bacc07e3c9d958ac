use bytes::Buf;

use super::SIZEOF_U32;
use crate::cache::BlockRef;
use crate::key::{KeySlice, KeyVec, RecordType};

/// Cursor over one data block. Values are zero-copy slices into the pinned
/// block; the iterator keeps the block alive through its [`BlockRef`].
pub struct BlockIterator {
    block: BlockRef,
    /// copy of the current internal key
    key: KeyVec,
    /// value position inside the block data
    value_range: (usize, usize),
    /// current record index
    idx: usize,
}

impl BlockIterator {
    fn new(block: BlockRef) -> Self {
        Self {
            block,
            key: KeyVec::new(),
            value_range: (0, 0),
            idx: 0,
        }
    }

    pub fn create_and_seek_to_first(block: BlockRef) -> Self {
        let mut iter = Self::new(block);
        iter.seek_to_first();
        iter
    }

    pub fn create_and_seek_to_key(block: BlockRef, user_key: &[u8], seq: u64) -> Self {
        let mut iter = Self::new(block);
        iter.seek_to_key(user_key, seq);
        iter
    }

    pub fn key(&self) -> KeySlice {
        self.key.as_key_slice()
    }

    pub fn value(&self) -> &[u8] {
        &self.block.data[self.value_range.0..self.value_range.1]
    }

    pub fn is_valid(&self) -> bool {
        self.idx < self.block.offsets.len()
    }

    pub fn seek_to_first(&mut self) {
        self.seek_to(0);
    }

    /// Position at the first record whose internal key is not smaller than
    /// `(user_key, seq, Value)`. Binary search over the offset array.
    pub fn seek_to_key(&mut self, user_key: &[u8], seq: u64) {
        let target = KeySlice::new(user_key, seq, RecordType::Value);
        let mut lo = 0;
        let mut hi = self.block.offsets.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.key_at(mid) < target {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        self.seek_to(lo);
    }

    pub fn next(&mut self) {
        let idx = self.idx + 1;
        self.seek_to(idx);
    }

    fn seek_to(&mut self, idx: usize) {
        self.idx = idx;
        if idx >= self.block.offsets.len() {
            return;
        }
        let offset = self.block.offsets[idx] as usize;
        let mut buf = &self.block.data[offset..];
        let klen = buf.get_u32_le() as usize;
        self.key.set_from_slice(KeySlice::decode(&buf[..klen]));
        buf.advance(klen);
        let vlen = buf.get_u32_le() as usize;
        let value_start = offset + 2 * SIZEOF_U32 + klen;
        self.value_range = (value_start, value_start + vlen);
    }

    fn key_at(&self, idx: usize) -> KeySlice {
        let offset = self.block.offsets[idx] as usize;
        let mut buf = &self.block.data[offset..];
        let klen = buf.get_u32_le() as usize;
        KeySlice::decode(&buf[..klen])
    }
}
