pub(crate) mod bloom;
pub mod builder;
pub mod iterator;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use bytes::{Buf, BufMut, Bytes};

use self::bloom::Bloom;
use crate::block::Block;
use crate::cache::{BlockCache, BlockRef, CacheKey};
use crate::error::{GetResult, StorageError};
use crate::file::FileObject;
use crate::key::{KeyBytes, KeySlice, RecordType};
use crate::stats;

/// Fixed footer: index offset, bloom offset, record count, smallest key
/// length, largest key length, magic. The boundary keys sit right before it.
pub(crate) const FOOTER_LEN: u64 = 48;
pub(crate) const FOOTER_MAGIC: u64 = u64::from_le_bytes(*b"lsmsst01");

/// Locates one data block inside its file. `size` covers the encoded block
/// plus its trailing crc32.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u32,
    pub size: u32,
    pub count: u32,
}

/// One index record: the largest internal key of a data block and where the
/// block lives.
#[derive(Clone, Debug)]
pub struct IndexEntry {
    pub key: KeyBytes,
    pub handle: BlockHandle,
}

impl IndexEntry {
    pub fn encode_index(entries: &[IndexEntry], buf: &mut Vec<u8>) {
        let original_len = buf.len();
        buf.put_u32_le(entries.len() as u32);
        for entry in entries {
            buf.put_u32_le(entry.key.raw_len() as u32);
            entry.key.encode_into(buf);
            buf.put_u32_le(entry.handle.offset);
            buf.put_u32_le(entry.handle.size);
            buf.put_u32_le(entry.handle.count);
        }
        buf.put_u32_le(crc32fast::hash(&buf[original_len..]));
    }

    pub fn decode_index(mut buf: &[u8]) -> Result<Vec<IndexEntry>> {
        if buf.len() < 8 {
            bail!(StorageError::Corruption("index block too short".into()));
        }
        let checksum = crc32fast::hash(&buf[..buf.len() - 4]);
        if (&buf[buf.len() - 4..]).get_u32_le() != checksum {
            bail!(StorageError::Corruption("index checksum mismatched".into()));
        }
        let num = buf.get_u32_le() as usize;
        let mut entries = Vec::with_capacity(num);
        for _ in 0..num {
            let klen = buf.get_u32_le() as usize;
            let key = KeySlice::decode(&buf[..klen]).to_key_bytes();
            buf.advance(klen);
            let offset = buf.get_u32_le();
            let size = buf.get_u32_le();
            let count = buf.get_u32_le();
            entries.push(IndexEntry {
                key,
                handle: BlockHandle {
                    offset,
                    size,
                    count,
                },
            });
        }
        Ok(entries)
    }
}

/// The durable description of one SSTable, persisted in the metadata file.
#[derive(Clone, Debug)]
pub struct SstInfo {
    pub size: u64,
    pub count: u64,
    pub sst_id: u64,
    pub index_offset: u64,
    pub bloom_offset: u64,
    pub filename: PathBuf,
}

/// An immutable sorted table on disk: data blocks, an index block, a bloom
/// filter over user keys, the boundary keys and a fixed footer.
pub struct SsTable {
    pub(crate) file: FileObject,
    info: SstInfo,
    index: Vec<IndexEntry>,
    pub(crate) bloom: Option<Bloom>,
    block_cache: Option<Arc<BlockCache>>,
    smallest: KeyBytes,
    largest: KeyBytes,
    /// when set, the file is unlinked once the last shared owner drops
    remove_on_drop: AtomicBool,
}

impl std::fmt::Debug for SsTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SsTable").field("info", &self.info).finish()
    }
}

impl SsTable {
    /// Open the table described by `info`, reading index, bloom filter and
    /// boundary keys from the file tail.
    pub fn open(
        info: SstInfo,
        block_cache: Option<Arc<BlockCache>>,
        use_direct_io: bool,
    ) -> Result<Self> {
        let file = FileObject::open(&info.filename, use_direct_io)?;
        let len = file.size();
        if len < FOOTER_LEN {
            bail!(StorageError::Corruption(format!(
                "{}: file shorter than footer",
                info.filename.display()
            )));
        }
        let footer = file.read(len - FOOTER_LEN, FOOTER_LEN)?;
        let mut footer = &footer[..];
        let index_offset = footer.get_u64_le();
        let bloom_offset = footer.get_u64_le();
        let count = footer.get_u64_le();
        let smallest_len = footer.get_u64_le();
        let largest_len = footer.get_u64_le();
        if footer.get_u64_le() != FOOTER_MAGIC {
            bail!(StorageError::Corruption(format!(
                "{}: bad footer magic",
                info.filename.display()
            )));
        }
        let keys_offset = smallest_len
            .checked_add(largest_len)
            .and_then(|keys_len| (len - FOOTER_LEN).checked_sub(keys_len))
            .filter(|&keys_offset| index_offset <= bloom_offset && bloom_offset <= keys_offset)
            .ok_or_else(|| {
                StorageError::Corruption(format!(
                    "{}: implausible footer offsets",
                    info.filename.display()
                ))
            })?;
        let raw_keys = file.read(keys_offset, smallest_len + largest_len)?;
        let smallest = KeySlice::decode(&raw_keys[..smallest_len as usize]).to_key_bytes();
        let largest = KeySlice::decode(&raw_keys[smallest_len as usize..]).to_key_bytes();
        let raw_index = file.read(index_offset, bloom_offset - index_offset)?;
        let index = IndexEntry::decode_index(&raw_index)?;
        let bloom_len = keys_offset - bloom_offset;
        let bloom = if bloom_len > 0 {
            Some(Bloom::decode(&file.read(bloom_offset, bloom_len)?)?)
        } else {
            None
        };
        Ok(Self {
            file,
            info: SstInfo { count, ..info },
            index,
            bloom,
            block_cache,
            smallest,
            largest,
            remove_on_drop: AtomicBool::new(false),
        })
    }

    /// Point lookup: bloom probe, index binary search, one cached block read.
    pub fn get(&self, user_key: &[u8], seq: u64) -> Result<GetResult> {
        if let Some(bloom) = &self.bloom {
            if !bloom.may_contain(farmhash::fingerprint32(user_key)) {
                stats::add_bloom_negative();
                return Ok(GetResult::NotFound);
            }
        }
        let idx = self.find_block_idx(user_key, seq);
        if idx >= self.index.len() {
            return Ok(GetResult::NotFound);
        }
        let block = self.read_block_cached(idx)?;
        let iter = crate::block::iterator::BlockIterator::create_and_seek_to_key(
            block, user_key, seq,
        );
        if iter.is_valid() && iter.key().user_key() == user_key {
            return Ok(match iter.key().record_type() {
                RecordType::Value => GetResult::Found(Bytes::copy_from_slice(iter.value())),
                RecordType::Deletion => GetResult::Deleted,
            });
        }
        Ok(GetResult::NotFound)
    }

    /// Index of the first block whose largest key is not smaller than
    /// `(user_key, seq, Value)`; the only block that can hold that key.
    pub(crate) fn find_block_idx(&self, user_key: &[u8], seq: u64) -> usize {
        let target = KeySlice::new(user_key, seq, RecordType::Value);
        self.index
            .partition_point(|entry| entry.key.as_key_slice() < target)
    }

    /// Fetch a data block through the cache, reading and checksumming it on
    /// a miss.
    pub(crate) fn read_block_cached(&self, block_idx: usize) -> Result<BlockRef> {
        let handle = self.index[block_idx].handle;
        let cache_key = CacheKey {
            sst_id: self.info.sst_id,
            offset: handle.offset,
        };
        if let Some(cache) = &self.block_cache {
            if let Some(hit) = cache.get(cache_key) {
                return Ok(BlockRef::Cached(hit));
            }
        }
        let raw = self
            .file
            .read(handle.offset as u64, handle.size as u64)?;
        stats::add_block_fetch();
        let data_len = raw.len() - 4;
        let checksum = (&raw[data_len..]).get_u32_le();
        if checksum != crc32fast::hash(&raw[..data_len]) {
            bail!(StorageError::Corruption(format!(
                "{}: block checksum mismatched at offset {}",
                self.info.filename.display(),
                handle.offset
            )));
        }
        let block = Arc::new(Block::decode(Bytes::from(raw).slice(..data_len)));
        match &self.block_cache {
            Some(cache) => Ok(BlockRef::Cached(cache.insert(cache_key, block)?)),
            None => Ok(BlockRef::Uncached(block)),
        }
    }

    pub fn smallest(&self) -> &KeyBytes {
        &self.smallest
    }

    pub fn largest(&self) -> &KeyBytes {
        &self.largest
    }

    pub fn info(&self) -> &SstInfo {
        &self.info
    }

    pub fn sst_id(&self) -> u64 {
        self.info.sst_id
    }

    pub fn size(&self) -> u64 {
        self.info.size
    }

    pub fn count(&self) -> u64 {
        self.info.count
    }

    pub fn num_blocks(&self) -> usize {
        self.index.len()
    }

    pub fn set_remove_on_drop(&self, remove: bool) {
        self.remove_on_drop.store(remove, Ordering::SeqCst);
    }
}

impl Drop for SsTable {
    fn drop(&mut self) {
        if self.remove_on_drop.load(Ordering::SeqCst) {
            if let Err(e) = std::fs::remove_file(&self.info.filename) {
                tracing::warn!(
                    "failed to remove obsolete sstable {}: {}",
                    self.info.filename.display(),
                    e
                );
            }
        }
    }
}
