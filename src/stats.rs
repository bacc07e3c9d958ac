use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide I/O counters, updated with relaxed atomics from the file
/// layer and the table read path. Cheap enough to leave always on; tests use
/// them to observe bloom-filter effectiveness.
#[derive(Debug, Default)]
pub struct Stats {
    pub total_read_bytes: AtomicU64,
    pub total_write_bytes: AtomicU64,
    /// Data blocks fetched from disk (cache misses).
    pub block_fetches: AtomicU64,
    /// Point lookups answered negatively by a bloom probe alone.
    pub bloom_negatives: AtomicU64,
}

impl Stats {
    pub fn block_fetches(&self) -> u64 {
        self.block_fetches.load(Ordering::Relaxed)
    }

    pub fn bloom_negatives(&self) -> u64 {
        self.bloom_negatives.load(Ordering::Relaxed)
    }
}

static STATS: Stats = Stats {
    total_read_bytes: AtomicU64::new(0),
    total_write_bytes: AtomicU64::new(0),
    block_fetches: AtomicU64::new(0),
    bloom_negatives: AtomicU64::new(0),
};

pub fn stats() -> &'static Stats {
    &STATS
}

pub(crate) fn add_read_bytes(n: u64) {
    STATS.total_read_bytes.fetch_add(n, Ordering::Relaxed);
}

pub(crate) fn add_write_bytes(n: u64) {
    STATS.total_write_bytes.fetch_add(n, Ordering::Relaxed);
}

pub(crate) fn add_block_fetch() {
    STATS.block_fetches.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn add_bloom_negative() {
    STATS.bloom_negatives.fetch_add(1, Ordering::Relaxed);
}
