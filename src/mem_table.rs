use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use crossbeam_skiplist::map::Entry;
use crossbeam_skiplist::SkipMap;
use ouroboros::self_referencing;

use crate::error::GetResult;
use crate::iterators::StorageIterator;
use crate::key::{KeyBytes, KeySlice, RecordType};

/// Create a bound of `KeyBytes` from a bound of `KeySlice`.
pub(crate) fn map_key_bound(bound: Bound<KeySlice>) -> Bound<KeyBytes> {
    match bound {
        Bound::Included(x) => Bound::Included(x.to_key_bytes()),
        Bound::Excluded(x) => Bound::Excluded(x.to_key_bytes()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// The in-memory write buffer: a lock-free ordered map from internal key to
/// value. Inserted keys and values are copied into `Bytes` owned by the map,
/// so readers holding the memtable may use them for its whole lifetime.
/// Writers are serialized by the engine's write mutex; readers iterate
/// concurrently with further inserts.
pub struct MemTable {
    pub(crate) map: Arc<SkipMap<KeyBytes, Bytes>>,
    approximate_size: AtomicUsize,
    flush_in_progress: AtomicBool,
    flush_complete: AtomicBool,
}

impl MemTable {
    pub fn create() -> Self {
        Self {
            map: Arc::new(SkipMap::new()),
            approximate_size: AtomicUsize::new(0),
            flush_in_progress: AtomicBool::new(false),
            flush_complete: AtomicBool::new(false),
        }
    }

    pub fn put(&self, user_key: &[u8], seq: u64, value: &[u8]) {
        self.add(
            KeySlice::new(user_key, seq, RecordType::Value).to_key_bytes(),
            Bytes::copy_from_slice(value),
        );
    }

    pub fn del(&self, user_key: &[u8], seq: u64) {
        self.add(
            KeySlice::new(user_key, seq, RecordType::Deletion).to_key_bytes(),
            Bytes::new(),
        );
    }

    fn add(&self, key: KeyBytes, value: Bytes) {
        let charged = key.raw_len() + value.len();
        self.map.insert(key, value);
        self.approximate_size.fetch_add(charged, Ordering::Relaxed);
    }

    /// Find the newest record of `user_key` with sequence number <= `seq`.
    pub fn get(&self, user_key: &[u8], seq: u64) -> GetResult {
        let sentinel = KeySlice::new(user_key, seq, RecordType::Value).to_key_bytes();
        let Some(entry) = self
            .map
            .range((Bound::Included(sentinel), Bound::Unbounded))
            .next()
        else {
            return GetResult::NotFound;
        };
        if entry.key().user_key() != user_key {
            return GetResult::NotFound;
        }
        match entry.key().record_type() {
            RecordType::Value => GetResult::Found(entry.value().clone()),
            RecordType::Deletion => GetResult::Deleted,
        }
    }

    pub fn scan(&self, lower: Bound<KeySlice>, upper: Bound<KeySlice>) -> MemTableIterator {
        let (lower, upper) = (map_key_bound(lower), map_key_bound(upper));
        let mut iter = MemTableIteratorBuilder {
            map: self.map.clone(),
            iter_builder: |map| map.range((lower, upper)),
            item: None,
        }
        .build();
        iter.load_next();
        iter
    }

    /// Iterator over the whole table, in internal-key order.
    pub fn iter(&self) -> MemTableIterator {
        self.scan(Bound::Unbounded, Bound::Unbounded)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Logically charged bytes, used for the flush trigger.
    pub fn approximate_size(&self) -> usize {
        self.approximate_size.load(Ordering::Relaxed)
    }

    pub fn set_flush_in_progress(&self, v: bool) {
        self.flush_in_progress.store(v, Ordering::SeqCst);
    }

    pub fn flush_in_progress(&self) -> bool {
        self.flush_in_progress.load(Ordering::SeqCst)
    }

    pub fn set_flush_complete(&self, v: bool) {
        self.flush_complete.store(v, Ordering::SeqCst);
    }

    pub fn flush_complete(&self) -> bool {
        self.flush_complete.load(Ordering::SeqCst)
    }
}

type SkipMapRangeIter<'a> = crossbeam_skiplist::map::Range<
    'a,
    KeyBytes,
    (Bound<KeyBytes>, Bound<KeyBytes>),
    KeyBytes,
    Bytes,
>;

// self-referential: the range iterator borrows the map the struct owns.
#[self_referencing]
pub struct MemTableIterator {
    map: Arc<SkipMap<KeyBytes, Bytes>>,

    #[borrows(map)]
    #[not_covariant]
    iter: SkipMapRangeIter<'this>,
    /// the current entry, None once exhausted
    item: Option<(KeyBytes, Bytes)>,
}

impl MemTableIterator {
    fn entry_to_item(entry: Option<Entry<'_, KeyBytes, Bytes>>) -> Option<(KeyBytes, Bytes)> {
        entry.map(|x| (x.key().clone(), x.value().clone()))
    }

    fn load_next(&mut self) {
        let entry = self.with_iter_mut(|iter| MemTableIterator::entry_to_item(iter.next()));
        self.with_mut(|x| *x.item = entry);
    }
}

impl StorageIterator for MemTableIterator {
    type KeyType<'a> = KeySlice<'a>;

    fn key(&self) -> KeySlice {
        self.borrow_item().as_ref().unwrap().0.as_key_slice()
    }

    fn value(&self) -> &[u8] {
        &self.borrow_item().as_ref().unwrap().1[..]
    }

    fn is_valid(&self) -> bool {
        self.borrow_item().is_some()
    }

    fn next(&mut self) -> Result<()> {
        self.load_next();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use rand::prelude::*;

    use super::*;

    #[test]
    fn test_put_get_del() {
        let mt = MemTable::create();
        mt.put(b"k", 1, b"v1");
        assert_eq!(mt.get(b"k", 1), GetResult::Found(Bytes::from_static(b"v1")));
        mt.put(b"k", 3, b"v2");
        assert_eq!(mt.get(b"k", 3), GetResult::Found(Bytes::from_static(b"v2")));
        // a snapshot between the two writes still reads the old version
        assert_eq!(mt.get(b"k", 2), GetResult::Found(Bytes::from_static(b"v1")));
        mt.del(b"k", 4);
        assert_eq!(mt.get(b"k", 4), GetResult::Deleted);
        assert_eq!(mt.get(b"k", 3), GetResult::Found(Bytes::from_static(b"v2")));
        assert_eq!(mt.get(b"other", 10), GetResult::NotFound);
    }

    #[test]
    fn test_seq_zero_before_first_write() {
        let mt = MemTable::create();
        mt.put(b"k", 1, b"v");
        assert_eq!(mt.get(b"k", 0), GetResult::NotFound);
    }

    #[test]
    fn test_iterator_order() {
        let mt = MemTable::create();
        mt.put(b"b", 1, b"1");
        mt.put(b"a", 2, b"2");
        mt.put(b"b", 3, b"3");
        let mut iter = mt.iter();
        let mut seen = Vec::new();
        while iter.is_valid() {
            seen.push((iter.key().user_key().to_vec(), iter.key().seq()));
            iter.next().unwrap();
        }
        // user key ascending, seq descending within one key
        assert_eq!(
            seen,
            vec![(b"a".to_vec(), 2), (b"b".to_vec(), 3), (b"b".to_vec(), 1)]
        );
    }

    #[test]
    fn test_matches_reference_model() {
        let mt = MemTable::create();
        let mut model: BTreeMap<Vec<u8>, Option<Vec<u8>>> = BTreeMap::new();
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for seq in 1..=5000u64 {
            let key = format!("key-{:03}", rng.gen_range(0..200)).into_bytes();
            if rng.gen_bool(0.25) {
                mt.del(&key, seq);
                model.insert(key, None);
            } else {
                let value = format!("value-{}", seq).into_bytes();
                mt.put(&key, seq, &value);
                model.insert(key, Some(value));
            }
        }
        for (key, expected) in model {
            match mt.get(&key, u64::MAX) {
                GetResult::Found(v) => assert_eq!(Some(v.to_vec()), expected),
                GetResult::Deleted => assert_eq!(None, expected),
                GetResult::NotFound => panic!("key {:?} missing", key),
            }
        }
    }
}
