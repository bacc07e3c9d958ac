use std::collections::{BTreeMap, HashMap};
use std::ops::Deref;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;

use crate::block::Block;
use crate::error::StorageError;

#[derive(Clone, Debug)]
pub struct CacheOptions {
    /// Total block bytes the cache may hold.
    pub capacity: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            capacity: 8 * 1024 * 1024,
        }
    }
}

/// A cached block is addressed by the SSTable it came from and its offset
/// within that file.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct CacheKey {
    pub sst_id: u64,
    pub offset: u32,
}

struct CacheEntry {
    block: Arc<Block>,
    charge: usize,
    refs: usize,
    /// Position in the LRU order while unreferenced.
    lru_tick: Option<u64>,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<CacheKey, CacheEntry>,
    /// tick -> key; the smallest tick is the eviction candidate. Only
    /// entries with refs == 0 appear here.
    lru: BTreeMap<u64, CacheKey>,
    size: usize,
    next_tick: u64,
}

/// Bounded LRU block cache. Lookups pin entries through [`CacheHandle`]; a
/// pinned entry is never evicted. Dropping the last handle moves the entry
/// to the LRU tail. All mutations run under one mutex.
pub struct BlockCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl BlockCache {
    pub fn new(options: CacheOptions) -> Self {
        Self {
            capacity: options.capacity,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn get(self: &Arc<Self>, key: CacheKey) -> Option<CacheHandle> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.get_mut(&key)?;
        entry.refs += 1;
        let block = entry.block.clone();
        if let Some(tick) = entry.lru_tick.take() {
            inner.lru.remove(&tick);
        }
        Some(CacheHandle {
            cache: self.clone(),
            key,
            block,
        })
    }

    /// Insert a block, returning a pinned handle to it. If the key was
    /// inserted concurrently the existing entry wins.
    pub fn insert(self: &Arc<Self>, key: CacheKey, block: Arc<Block>) -> Result<CacheHandle> {
        let charge = block.size();
        if charge > self.capacity {
            return Err(StorageError::OutOfSpace(format!(
                "block of {} bytes exceeds cache capacity {}",
                charge, self.capacity
            ))
            .into());
        }
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.refs += 1;
            let block = entry.block.clone();
            if let Some(tick) = entry.lru_tick.take() {
                inner.lru.remove(&tick);
            }
            return Ok(CacheHandle {
                cache: self.clone(),
                key,
                block,
            });
        }
        inner.entries.insert(
            key,
            CacheEntry {
                block: block.clone(),
                charge,
                refs: 1,
                lru_tick: None,
            },
        );
        inner.size += charge;
        Self::evict(&mut inner, self.capacity);
        Ok(CacheHandle {
            cache: self.clone(),
            key,
            block,
        })
    }

    fn evict(inner: &mut CacheInner, capacity: usize) {
        while inner.size > capacity {
            let Some((&tick, &key)) = inner.lru.iter().next() else {
                // everything left is pinned
                break;
            };
            inner.lru.remove(&tick);
            if let Some(entry) = inner.entries.remove(&key) {
                debug_assert_eq!(entry.refs, 0);
                inner.size -= entry.charge;
            }
        }
    }

    fn unref(&self, key: CacheKey) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(entry) = inner.entries.get_mut(&key) else {
            return;
        };
        entry.refs -= 1;
        if entry.refs == 0 {
            let tick = inner.next_tick;
            inner.next_tick += 1;
            entry.lru_tick = Some(tick);
            inner.lru.insert(tick, key);
        }
    }

    /// Current resident bytes.
    pub fn size(&self) -> usize {
        self.inner.lock().size
    }
}

/// RAII pin on a cache entry. The referenced block stays resident until the
/// handle drops.
pub struct CacheHandle {
    cache: Arc<BlockCache>,
    key: CacheKey,
    block: Arc<Block>,
}

impl CacheHandle {
    pub fn block(&self) -> &Block {
        &self.block
    }
}

impl Drop for CacheHandle {
    fn drop(&mut self) {
        self.cache.unref(self.key);
    }
}

impl std::fmt::Debug for CacheHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheHandle").finish()
    }
}

/// A pinned block reference: through the cache when one is configured,
/// otherwise a plain shared block.
pub enum BlockRef {
    Cached(CacheHandle),
    Uncached(Arc<Block>),
}

impl Deref for BlockRef {
    type Target = Block;

    fn deref(&self) -> &Block {
        match self {
            BlockRef::Cached(handle) => handle.block(),
            BlockRef::Uncached(block) => block,
        }
    }
}
