use bytes::Bytes;
use thiserror::Error;

/// Typed storage failures. These travel inside `anyhow::Error` so call sites
/// keep the usual `?` plumbing while tests and callers can still
/// `downcast_ref` on the category.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Footer, checksum or metadata mismatch. Opening a database over a
    /// damaged directory surfaces this.
    #[error("corruption: {0}")]
    Corruption(String),
    /// A resource limit that cannot be satisfied, e.g. a block larger than
    /// the whole cache capacity.
    #[error("out of space: {0}")]
    OutOfSpace(String),
    /// Bad caller input: unknown compaction strategy, opening a missing
    /// directory without `create_new`, ...
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Outcome of a point lookup against a memtable, SSTable, sorted run or
/// version. `Deleted` means a tombstone was the newest visible record; it is
/// distinguished from `NotFound` so upper layers stop probing older data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetResult {
    Found(Bytes),
    Deleted,
    NotFound,
}

impl GetResult {
    /// Collapse to the public read result: tombstones and absence both read
    /// as `None`.
    pub fn into_option(self) -> Option<Bytes> {
        match self {
            GetResult::Found(v) => Some(v),
            GetResult::Deleted | GetResult::NotFound => None,
        }
    }
}
