use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use rand::prelude::*;
use tempfile::tempdir;

use super::harness::{check_iter_result, init_tracing, kv, test_options};
use crate::error::StorageError;
use crate::iterators::StorageIterator;
use crate::lsm_storage::Db;

#[test]
fn test_basic_lifecycle() {
    let dir = tempdir().unwrap();
    let db = Db::open(test_options(dir.path())).unwrap();
    db.put(b"abc", b"v1").unwrap();
    assert_eq!(db.get(b"abc").unwrap(), Some(Bytes::from_static(b"v1")));
    db.del(b"abc").unwrap();
    assert_eq!(db.get(b"abc").unwrap(), None);
    db.put(b"abc", b"v2").unwrap();
    assert_eq!(db.get(b"abc").unwrap(), Some(Bytes::from_static(b"v2")));
    assert_eq!(db.get(b"never-written").unwrap(), None);
}

#[test]
fn test_empty_user_key() {
    let dir = tempdir().unwrap();
    let db = Db::open(test_options(dir.path())).unwrap();
    db.put(b"", b"empty").unwrap();
    db.put(b"a", b"va").unwrap();
    assert_eq!(db.get(b"").unwrap(), Some(Bytes::from_static(b"empty")));
    // the empty key sorts first
    let mut iter = db.begin().unwrap();
    check_iter_result(
        &mut iter,
        &[
            (Bytes::from(""), Bytes::from("empty")),
            (Bytes::from("a"), Bytes::from("va")),
        ],
    );
}

#[test]
fn test_overwrite_visibility() {
    let dir = tempdir().unwrap();
    let db = Db::open(test_options(dir.path())).unwrap();
    for round in 0..5u32 {
        for i in 0..100u32 {
            let (key, _) = kv(i);
            db.put(&key, format!("round-{}", round).as_bytes()).unwrap();
        }
    }
    for i in 0..100u32 {
        let (key, _) = kv(i);
        assert_eq!(db.get(&key).unwrap(), Some(Bytes::from_static(b"round-4")));
    }
}

#[test]
fn test_snapshot_isolation_iterator_survives_deletes() {
    let dir = tempdir().unwrap();
    let db = Db::open(test_options(dir.path())).unwrap();
    let n = 2000u32;
    let mut expected = Vec::new();
    for i in 0..n {
        let (key, value) = kv(i);
        db.put(&key, &value).unwrap();
        expected.push((key, value));
    }
    let mut snapshot_iter = db.begin().unwrap();
    // delete everything after the snapshot was taken
    for i in 0..n {
        let (key, _) = kv(i);
        db.del(&key).unwrap();
    }
    // the old iterator still sees all n pairs in order
    check_iter_result(&mut snapshot_iter, &expected);
    // a fresh iterator sees nothing
    let mut fresh = db.begin().unwrap();
    check_iter_result(&mut fresh, &[]);
}

#[test]
fn test_get_snapshot_ignores_later_writes() {
    let dir = tempdir().unwrap();
    let db = Db::open(test_options(dir.path())).unwrap();
    db.put(b"k", b"old").unwrap();
    let iter = db.begin().unwrap();
    db.put(b"k", b"new").unwrap();
    // the iterator's snapshot predates the second write
    assert!(iter.is_valid());
    assert_eq!(iter.value(), b"old");
    assert_eq!(db.get(b"k").unwrap(), Some(Bytes::from_static(b"new")));
}

#[test]
fn test_flush_creates_l0_and_survives_reopen() {
    init_tracing();
    let dir = tempdir().unwrap();
    let mut model = BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(7);
    {
        let db = Db::open(test_options(dir.path())).unwrap();
        for _ in 0..20_000 {
            let key = format!("key-{:05}", rng.gen_range(0..5000));
            let value = format!("value-{:010}", rng.gen::<u32>());
            db.put(key.as_bytes(), value.as_bytes()).unwrap();
            model.insert(Bytes::from(key), Bytes::from(value));
        }
        db.flush_all().unwrap();
        db.wait_for_flush_and_compaction().unwrap();
        {
            let sv = db.inner.current_sv();
            assert!(sv.mt.is_empty());
            assert!(sv.imms.is_empty());
            assert!(!sv.version.levels().is_empty());
        }
        let expected: Vec<_> = model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        check_iter_result(&mut db.begin().unwrap(), &expected);
    }
    // reopen from the persisted metadata
    let mut options = test_options(dir.path());
    options.create_new = false;
    let db = Db::open(options).unwrap();
    let expected: Vec<_> = model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    check_iter_result(&mut db.begin().unwrap(), &expected);
    for (key, value) in model.iter().take(100) {
        assert_eq!(db.get(key).unwrap().as_ref(), Some(value));
    }
}

#[test]
fn test_seq_preserved_across_reopen() {
    let dir = tempdir().unwrap();
    let seq_before = {
        let db = Db::open(test_options(dir.path())).unwrap();
        for i in 0..500u32 {
            let (key, value) = kv(i);
            db.put(&key, &value).unwrap();
        }
        db.save().unwrap();
        db.current_seq()
    };
    let mut options = test_options(dir.path());
    options.create_new = false;
    let db = Db::open(options).unwrap();
    assert!(db.current_seq() >= seq_before);
    // new writes keep sequencing upward
    db.put(b"post-reopen", b"v").unwrap();
    assert!(db.current_seq() > seq_before);
}

#[test]
fn test_flush_all_empties_memtables() {
    let dir = tempdir().unwrap();
    let db = Db::open(test_options(dir.path())).unwrap();
    for i in 0..1000u32 {
        let (key, value) = kv(i);
        db.put(&key, &value).unwrap();
    }
    db.flush_all().unwrap();
    db.wait_for_flush_and_compaction().unwrap();
    let sv = db.inner.current_sv();
    assert!(sv.mt.is_empty());
    assert!(sv.imms.is_empty());
}

#[test]
fn test_stop_write_bounds_immutables() {
    let dir = tempdir().unwrap();
    let mut options = test_options(dir.path());
    options.max_immutable_count = 1;
    options.sst_file_size = 2 * 1024;
    let db = Arc::new(Db::open(options).unwrap());

    let writer = {
        let db = db.clone();
        std::thread::spawn(move || {
            for i in 0..4000u32 {
                let (key, value) = kv(i);
                db.put(&key, &value).unwrap();
            }
        })
    };
    let mut max_imms = 0;
    while !writer.is_finished() {
        max_imms = max_imms.max(db.inner.current_sv().imms.len());
        std::thread::yield_now();
    }
    writer.join().unwrap();
    assert!(
        max_imms <= 1,
        "writers outran the stall: {} immutables",
        max_imms
    );
    // every write made it in
    db.wait_for_flush_and_compaction().unwrap();
    for i in (0..4000u32).step_by(397) {
        let (key, value) = kv(i);
        assert_eq!(db.get(&key).unwrap(), Some(value));
    }
}

#[test]
fn test_large_value_exceeding_write_buffer() {
    let dir = tempdir().unwrap();
    let db = Db::open(test_options(dir.path())).unwrap();
    // value larger than write_buffer_size and block_size
    let big = vec![0xabu8; 64 * 1024];
    db.put(b"big", &big).unwrap();
    db.flush_all().unwrap();
    assert_eq!(db.get(b"big").unwrap(), Some(Bytes::from(big)));
}

#[test]
fn test_seek_positions_at_first_visible() {
    let dir = tempdir().unwrap();
    let db = Db::open(test_options(dir.path())).unwrap();
    for i in (0..100u32).step_by(2) {
        let (key, value) = kv(i);
        db.put(&key, &value).unwrap();
    }
    db.del(&kv(50).0).unwrap();
    // seek to an absent odd key lands on the next even one
    let mut iter = db.seek(&kv(49).0).unwrap();
    let expected: Vec<_> = (0..100u32)
        .step_by(2)
        .filter(|&i| i >= 50 && i != 50)
        .map(kv)
        .collect();
    check_iter_result(&mut iter, &expected);
}

#[test]
fn test_open_missing_without_create_new() {
    let dir = tempdir().unwrap();
    let mut options = test_options(&dir.path().join("nope"));
    options.create_new = false;
    let err = Db::open(options).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StorageError>(),
        Some(StorageError::InvalidArgument(_))
    ));
}

#[test]
fn test_corrupt_metadata_refuses_open() {
    let dir = tempdir().unwrap();
    {
        let db = Db::open(test_options(dir.path())).unwrap();
        for i in 0..100u32 {
            let (key, value) = kv(i);
            db.put(&key, &value).unwrap();
        }
    }
    // truncate the metadata file to a stale prefix
    let metadata = dir.path().join("metadata");
    let raw = std::fs::read(&metadata).unwrap();
    std::fs::write(&metadata, &raw[..raw.len() / 2]).unwrap();
    let mut options = test_options(dir.path());
    options.create_new = false;
    let err = Db::open(options).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StorageError>(),
        Some(StorageError::Corruption(_))
    ));
}

#[test]
fn test_unknown_compaction_strategy() {
    let dir = tempdir().unwrap();
    let mut options = test_options(dir.path());
    options.compaction_strategy_name = "flexible".to_string();
    let err = Db::open(options).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StorageError>(),
        Some(StorageError::InvalidArgument(_))
    ));
}
