use bytes::BufMut;

use super::{Block, SIZEOF_U32};
use crate::key::KeySlice;

/// Builds a block
pub struct BlockBuilder {
    /// serialized records
    data: Vec<u8>,
    /// start offset of each record
    offsets: Vec<u32>,
    /// the configured block size
    block_size: usize,
    /// the last key added, kept for the index entry
    last_key: Vec<u8>,
}

impl BlockBuilder {
    pub fn new(block_size: usize) -> Self {
        Self {
            data: Vec::new(),
            offsets: Vec::new(),
            block_size,
            last_key: Vec::new(),
        }
    }

    /// Exact encoded size of the block built so far.
    pub fn size(&self) -> usize {
        self.data.len() + self.offsets.len() * SIZEOF_U32 + SIZEOF_U32
    }

    pub fn count(&self) -> usize {
        self.offsets.len()
    }

    /// Adds a record, returning false when the block is full. A record that
    /// alone exceeds the block size is still accepted into an empty block.
    #[must_use]
    pub fn add(&mut self, key: KeySlice, value: &[u8]) -> bool {
        let add_on = SIZEOF_U32 * 3 + key.raw_len() + value.len();
        if self.size() + add_on > self.block_size && !self.is_empty() {
            return false;
        }

        self.offsets.push(self.data.len() as u32);
        self.data.put_u32_le(key.raw_len() as u32);
        key.encode_into(&mut self.data);
        self.data.put_u32_le(value.len() as u32);
        self.data.put_slice(value);

        self.last_key.clear();
        key.encode_into(&mut self.last_key);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// The last internal key added, encoded; the index entry for this block.
    pub fn last_key(&self) -> KeySlice {
        KeySlice::decode(&self.last_key)
    }

    pub fn build(self) -> Block {
        assert!(!self.is_empty(), "block should not be empty");
        Block {
            data: self.data.into(),
            offsets: self.offsets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::RecordType;

    fn key(k: &[u8], seq: u64) -> KeySlice {
        KeySlice::new(k, seq, RecordType::Value)
    }

    #[test]
    fn test_block_build_refuses_when_full() {
        let mut builder = BlockBuilder::new(64);
        assert!(builder.add(key(b"a", 1), b"11"));
        // fill until refusal, then verify the refused record fits a new block
        let mut added = 1;
        while builder.add(key(b"b", 1), b"22") {
            added += 1;
        }
        assert!(added >= 1);
        let block = builder.build();
        assert_eq!(block.count(), added);
    }

    #[test]
    fn test_oversized_record_fits_alone() {
        let mut builder = BlockBuilder::new(32);
        let big = vec![7u8; 256];
        assert!(builder.add(key(b"huge", 1), &big));
        assert!(!builder.add(key(b"next", 2), b"x"));
        let block = builder.build();
        assert_eq!(block.count(), 1);
    }

    #[test]
    fn test_exactly_sized_block() {
        // one record sized so the block lands exactly on the threshold
        let mut builder = BlockBuilder::new(4096);
        let record_payload = 4096 - builder.size() - 3 * SIZEOF_U32;
        let k = b"key-0";
        let value = vec![0u8; record_payload - (k.len() + 9)];
        assert!(builder.add(key(k, 1), &value));
        assert_eq!(builder.size(), 4096);
        // the next record must be refused, never split mid-record
        assert!(!builder.add(key(b"key-1", 2), b"v"));
        let block = builder.build();
        assert_eq!(block.size(), 4096);
    }

    #[test]
    fn test_encode_decode() {
        let mut builder = BlockBuilder::new(4096);
        for i in 0..10u32 {
            let k = format!("key-{:03}", i);
            let v = format!("value-{:03}", i);
            assert!(builder.add(key(k.as_bytes(), i as u64 + 1), v.as_bytes()));
        }
        let block = builder.build();
        let decoded = Block::decode(block.encode());
        assert_eq!(decoded.count(), 10);
        assert_eq!(decoded.offsets, block.offsets);
        assert_eq!(decoded.data, block.data);
    }
}
