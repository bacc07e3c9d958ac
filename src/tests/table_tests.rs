use std::sync::Arc;

use bytes::Bytes;
use tempfile::tempdir;

use crate::cache::{BlockCache, CacheOptions};
use crate::error::{GetResult, StorageError};
use crate::iterators::StorageIterator;
use crate::key::{KeySlice, RecordType};
use crate::lsm_storage::LsmStorageOptions;
use crate::stats;
use crate::table::builder::SsTableBuilder;
use crate::table::iterator::SsTableIterator;
use crate::table::SsTable;

fn small_options(path: &std::path::Path) -> LsmStorageOptions {
    let mut options = LsmStorageOptions::new(path);
    options.block_size = 256;
    options
}

/// Records: (key-000, seq 3, v3), (key-000, seq 1, del), (key-001..), ...
fn build_table(path: &std::path::Path, options: &LsmStorageOptions, n: u32) -> SsTable {
    let file = path.join("1.sst");
    let mut builder = SsTableBuilder::new(1, &file, options).unwrap();
    for i in 0..n {
        let key = format!("key-{:03}", i);
        builder
            .add(
                KeySlice::new(key.as_bytes(), 3, RecordType::Value),
                format!("v3-{:03}", i).as_bytes(),
            )
            .unwrap();
        builder
            .add(KeySlice::new(key.as_bytes(), 1, RecordType::Deletion), b"")
            .unwrap();
    }
    let info = builder.finish().unwrap();
    assert_eq!(info.count, 2 * n as u64);
    SsTable::open(info, None, false).unwrap()
}

#[test]
fn test_build_and_full_scan() {
    let dir = tempdir().unwrap();
    let options = small_options(dir.path());
    let table = Arc::new(build_table(dir.path(), &options, 100));
    assert!(table.num_blocks() > 1);
    assert_eq!(table.smallest().user_key(), b"key-000");
    assert_eq!(table.largest().user_key(), b"key-099");

    let mut iter = SsTableIterator::create_and_seek_to_first(table).unwrap();
    for i in 0..100 {
        let key = format!("key-{:03}", i);
        assert!(iter.is_valid());
        assert_eq!(iter.key().user_key(), key.as_bytes());
        assert_eq!(iter.key().seq(), 3);
        assert_eq!(iter.value(), format!("v3-{:03}", i).as_bytes());
        iter.next().unwrap();
        assert_eq!(iter.key().user_key(), key.as_bytes());
        assert_eq!(iter.key().seq(), 1);
        assert!(iter.key().is_tombstone());
        iter.next().unwrap();
    }
    assert!(!iter.is_valid());
}

#[test]
fn test_point_get_semantics() {
    let dir = tempdir().unwrap();
    let options = small_options(dir.path());
    let table = build_table(dir.path(), &options, 100);

    // newest visible version at seq 3 is the value
    assert_eq!(
        table.get(b"key-042", 5).unwrap(),
        GetResult::Found(Bytes::from_static(b"v3-042"))
    );
    assert_eq!(
        table.get(b"key-042", 3).unwrap(),
        GetResult::Found(Bytes::from_static(b"v3-042"))
    );
    // at seq 2 only the tombstone is visible
    assert_eq!(table.get(b"key-042", 2).unwrap(), GetResult::Deleted);
    // nothing visible below the tombstone's seq... the tombstone itself is
    assert_eq!(table.get(b"key-042", 1).unwrap(), GetResult::Deleted);
    assert_eq!(table.get(b"key-042", 0).unwrap(), GetResult::NotFound);
    assert_eq!(table.get(b"absent", 5).unwrap(), GetResult::NotFound);
}

#[test]
fn test_seek_into_table() {
    let dir = tempdir().unwrap();
    let options = small_options(dir.path());
    let table = Arc::new(build_table(dir.path(), &options, 100));
    let iter = SsTableIterator::create_and_seek_to_key(table.clone(), b"key-050", u64::MAX).unwrap();
    assert!(iter.is_valid());
    assert_eq!(iter.key().user_key(), b"key-050");
    assert_eq!(iter.key().seq(), 3);
    // between keys lands on the next one
    let iter = SsTableIterator::create_and_seek_to_key(table.clone(), b"key-050a", u64::MAX).unwrap();
    assert_eq!(iter.key().user_key(), b"key-051");
    // past the end is invalid
    let iter = SsTableIterator::create_and_seek_to_key(table, b"zzz", u64::MAX).unwrap();
    assert!(!iter.is_valid());
}

#[test]
fn test_reopen_from_info() {
    let dir = tempdir().unwrap();
    let options = small_options(dir.path());
    let info = {
        let table = build_table(dir.path(), &options, 50);
        table.info().clone()
    };
    // reopen the same file from its durable description
    let table = SsTable::open(info, None, false).unwrap();
    assert_eq!(table.count(), 100);
    assert_eq!(
        table.get(b"key-007", 10).unwrap(),
        GetResult::Found(Bytes::from_static(b"v3-007"))
    );
}

#[test]
fn test_truncated_file_is_corruption() {
    let dir = tempdir().unwrap();
    let options = small_options(dir.path());
    let info = build_table(dir.path(), &options, 50).info().clone();
    let file = dir.path().join("1.sst");
    let len = std::fs::metadata(&file).unwrap().len();
    let raw = std::fs::read(&file).unwrap();
    std::fs::write(&file, &raw[..len as usize / 2]).unwrap();
    // either a short read or a bad footer; both must refuse to open
    SsTable::open(info, None, false).unwrap_err();
}

#[test]
fn test_bad_footer_magic_is_corruption() {
    let dir = tempdir().unwrap();
    let options = small_options(dir.path());
    let info = build_table(dir.path(), &options, 50).info().clone();
    let file = dir.path().join("1.sst");
    let mut raw = std::fs::read(&file).unwrap();
    let len = raw.len();
    raw[len - 1] ^= 0xff;
    std::fs::write(&file, &raw).unwrap();
    let err = SsTable::open(info, None, false).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StorageError>(),
        Some(StorageError::Corruption(_))
    ));
}

#[test]
fn test_cached_reads_hit_cache() {
    let dir = tempdir().unwrap();
    let options = small_options(dir.path());
    let cache = Arc::new(BlockCache::new(CacheOptions { capacity: 1 << 20 }));
    let info = build_table(dir.path(), &options, 100).info().clone();
    let table = SsTable::open(info, Some(cache.clone()), false).unwrap();
    assert!(cache.size() == 0);
    table.get(b"key-000", 5).unwrap();
    let resident = cache.size();
    assert!(resident > 0);
    // the same lookup again loads no new block
    table.get(b"key-000", 5).unwrap();
    assert_eq!(cache.size(), resident);
}

#[test]
fn test_bloom_prunes_absent_lookups() {
    let dir = tempdir().unwrap();
    let options = small_options(dir.path());
    let table = build_table(dir.path(), &options, 200);
    let probes = 20_000u64;
    let negatives_before = stats::stats().bloom_negatives();
    for i in 0..probes {
        let key = format!("absent-{:06}", i);
        assert_eq!(table.get(key.as_bytes(), 5).unwrap(), GetResult::NotFound);
    }
    let negatives = stats::stats().bloom_negatives() - negatives_before;
    // at 10 bits per key well over 95% of absent probes stop at the filter,
    // never touching a data block
    assert!(
        negatives >= probes * 95 / 100,
        "only {} of {} absent probes were answered by the bloom filter",
        negatives,
        probes
    );
}

#[test]
fn test_disabled_bloom_still_answers() {
    let dir = tempdir().unwrap();
    let mut options = small_options(dir.path());
    options.enable_bloom_filter = false;
    let table = build_table(dir.path(), &options, 50);
    assert!(table.bloom.is_none());
    assert_eq!(
        table.get(b"key-010", 5).unwrap(),
        GetResult::Found(Bytes::from_static(b"v3-010"))
    );
    assert_eq!(table.get(b"absent", 5).unwrap(), GetResult::NotFound);
}
