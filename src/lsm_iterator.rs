use std::sync::Arc;

use anyhow::Result;

use crate::iterators::StorageIterator;
use crate::key::KeyVec;
use crate::version::{SuperVersion, SuperVersionIterator};

/// The user-facing iterator: filters the raw SuperVersion stream down to the
/// snapshot taken at creation. Records with seq above the snapshot are
/// invisible, the newest visible version of each user key is authoritative,
/// tombstones hide their key, and older versions are skipped.
pub struct DbIterator {
    inner: SuperVersionIterator,
    /// the snapshot sequence number
    seq: u64,
    /// internal key of the record the cursor last settled on
    current_key: KeyVec,
}

impl DbIterator {
    pub(crate) fn create_and_seek_to_first(sv: Arc<SuperVersion>, seq: u64) -> Result<Self> {
        let inner = SuperVersionIterator::create_and_seek_to_first(sv)?;
        let mut iter = Self {
            inner,
            seq,
            current_key: KeyVec::new(),
        };
        iter.settle()?;
        Ok(iter)
    }

    pub(crate) fn create_and_seek_to_key(
        sv: Arc<SuperVersion>,
        seq: u64,
        user_key: &[u8],
    ) -> Result<Self> {
        let inner = SuperVersionIterator::create_and_seek_to_key(sv, user_key, seq)?;
        let mut iter = Self {
            inner,
            seq,
            current_key: KeyVec::new(),
        };
        iter.settle()?;
        Ok(iter)
    }

    /// Accept the entry under the cursor if it is visible and live,
    /// otherwise run the skip loop.
    fn settle(&mut self) -> Result<()> {
        if self.inner.is_valid() {
            self.current_key.set_from_slice(self.inner.key());
            if self.current_key.is_tombstone() || self.current_key.seq() > self.seq {
                self.advance()?;
            }
        }
        Ok(())
    }

    fn advance(&mut self) -> Result<()> {
        self.inner.next()?;
        loop {
            // skip records above the snapshot, and every older version of a
            // user key that already produced a visible record
            while self.inner.is_valid() {
                let entry = self.inner.key();
                let invisible = entry.seq() > self.seq;
                let shadowed = self.current_key.seq() <= self.seq
                    && entry.user_key() == self.current_key.user_key();
                if invisible || shadowed {
                    self.inner.next()?;
                } else {
                    break;
                }
            }
            if self.inner.is_valid() {
                self.current_key.set_from_slice(self.inner.key());
                if self.current_key.is_tombstone() {
                    self.inner.next()?;
                    continue;
                }
            }
            break;
        }
        Ok(())
    }
}

impl StorageIterator for DbIterator {
    type KeyType<'a> = &'a [u8];

    fn is_valid(&self) -> bool {
        self.inner.is_valid()
    }

    /// The user key of the current entry.
    fn key(&self) -> &[u8] {
        self.current_key.user_key()
    }

    fn value(&self) -> &[u8] {
        self.inner.value()
    }

    fn next(&mut self) -> Result<()> {
        self.advance()
    }

    fn number_of_iterators(&self) -> usize {
        self.inner.number_of_iterators()
    }
}
