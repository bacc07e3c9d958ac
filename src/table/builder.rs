use std::path::Path;

use anyhow::Result;
use bytes::BufMut;

use super::{bloom::Bloom, BlockHandle, IndexEntry, SstInfo, FOOTER_MAGIC};
use crate::block::builder::BlockBuilder;
use crate::file::FileWriter;
use crate::key::{KeySlice, KeyVec};
use crate::lsm_storage::LsmStorageOptions;

/// Streams an SSTable to disk: finished data blocks go through the buffered
/// writer immediately, so only one block is ever held in memory. `finish`
/// emits index, bloom filter, boundary keys and footer.
pub struct SsTableBuilder {
    writer: FileWriter,
    block_builder: BlockBuilder,
    index: Vec<IndexEntry>,
    key_hashes: Vec<u32>,
    count: u64,
    smallest: KeyVec,
    largest: KeyVec,
    block_size: usize,
    bloom_bits_per_key: usize,
    enable_bloom_filter: bool,
    info: SstInfo,
}

impl SsTableBuilder {
    pub fn new(sst_id: u64, path: &Path, options: &LsmStorageOptions) -> Result<Self> {
        let writer = FileWriter::create(path, options.write_buffer_size, options.use_direct_io)?;
        Ok(Self {
            writer,
            block_builder: BlockBuilder::new(options.block_size),
            index: Vec::new(),
            key_hashes: Vec::new(),
            count: 0,
            smallest: KeyVec::new(),
            largest: KeyVec::new(),
            block_size: options.block_size,
            bloom_bits_per_key: options.bloom_bits_per_key,
            enable_bloom_filter: options.enable_bloom_filter,
            info: SstInfo {
                size: 0,
                count: 0,
                sst_id,
                index_offset: 0,
                bloom_offset: 0,
                filename: path.to_path_buf(),
            },
        })
    }

    /// Append a record. Records MUST arrive in strictly increasing
    /// internal-key order.
    pub fn add(&mut self, key: KeySlice, value: &[u8]) -> Result<()> {
        if self.count == 0 {
            self.smallest.set_from_slice(key);
        }
        self.key_hashes.push(farmhash::fingerprint32(key.user_key()));
        if !self.block_builder.add(key, value) {
            self.finish_block()?;
            assert!(self.block_builder.add(key, value));
        }
        self.largest.set_from_slice(key);
        self.count += 1;
        Ok(())
    }

    /// Bytes this table would occupy if finished now, ignoring index and
    /// bloom overhead; used for output splitting during compaction.
    pub fn estimated_size(&self) -> u64 {
        self.writer.size() + self.block_builder.size() as u64
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Flush the trailing block, write index, bloom filter, boundary keys
    /// and footer, then sync.
    pub fn finish(mut self) -> Result<SstInfo> {
        if !self.block_builder.is_empty() {
            self.finish_block()?;
        }

        let index_offset = self.writer.size();
        let mut buf = Vec::new();
        IndexEntry::encode_index(&self.index, &mut buf);
        self.writer.append(&buf)?;

        let bloom_offset = self.writer.size();
        if self.enable_bloom_filter {
            let bloom = Bloom::build_from_key_hashes(&self.key_hashes, self.bloom_bits_per_key);
            let mut buf = Vec::new();
            bloom.encode(&mut buf);
            self.writer.append(&buf)?;
        }

        let mut buf = Vec::new();
        self.smallest.encode_into(&mut buf);
        self.largest.encode_into(&mut buf);
        buf.put_u64_le(index_offset);
        buf.put_u64_le(bloom_offset);
        buf.put_u64_le(self.count);
        buf.put_u64_le(self.smallest.raw_len() as u64);
        buf.put_u64_le(self.largest.raw_len() as u64);
        buf.put_u64_le(FOOTER_MAGIC);
        self.writer.append(&buf)?;
        self.writer.sync()?;

        Ok(SstInfo {
            size: self.writer.size(),
            count: self.count,
            index_offset,
            bloom_offset,
            ..self.info
        })
    }

    fn finish_block(&mut self) -> Result<()> {
        let builder = std::mem::replace(&mut self.block_builder, BlockBuilder::new(self.block_size));
        let last_key = builder.last_key().to_key_bytes();
        let block = builder.build();
        let offset = self.writer.size() as u32;
        let encoded = block.encode();
        let checksum = crc32fast::hash(&encoded);
        self.writer.append(&encoded)?;
        self.writer.append(&checksum.to_le_bytes())?;
        self.index.push(IndexEntry {
            key: last_key,
            handle: BlockHandle {
                offset,
                size: encoded.len() as u32 + 4,
                count: block.count() as u32,
            },
        });
        Ok(())
    }
}
