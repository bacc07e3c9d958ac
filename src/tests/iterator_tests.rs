use std::sync::Arc;

use bytes::Bytes;
use tempfile::tempdir;

use crate::iterators::concat_iterator::SstConcatIterator;
use crate::iterators::merge_iterator::MergeIterator;
use crate::iterators::StorageIterator;
use crate::key::{KeySlice, RecordType};
use crate::lsm_storage::LsmStorageOptions;
use crate::mem_table::MemTable;
use crate::table::builder::SsTableBuilder;
use crate::table::SsTable;

#[test]
fn test_merge_iterator_newest_source_wins() {
    // two memtables covering the same keys at different seqs; the iterator
    // must interleave them in internal-key order (seq descending per key)
    let newer = MemTable::create();
    newer.put(b"a", 10, b"a10");
    newer.put(b"c", 12, b"c12");
    let older = MemTable::create();
    older.put(b"a", 2, b"a2");
    older.put(b"b", 3, b"b3");

    let mut iter = MergeIterator::create(vec![Box::new(newer.iter()), Box::new(older.iter())]);
    let mut seen = Vec::new();
    while iter.is_valid() {
        seen.push((
            Bytes::copy_from_slice(iter.key().user_key()),
            iter.key().seq(),
            Bytes::copy_from_slice(iter.value()),
        ));
        iter.next().unwrap();
    }
    assert_eq!(
        seen,
        vec![
            (Bytes::from("a"), 10, Bytes::from("a10")),
            (Bytes::from("a"), 2, Bytes::from("a2")),
            (Bytes::from("b"), 3, Bytes::from("b3")),
            (Bytes::from("c"), 12, Bytes::from("c12")),
        ]
    );
}

#[test]
fn test_merge_iterator_empty_children() {
    let empty_a = MemTable::create();
    let empty_b = MemTable::create();
    let iter = MergeIterator::create(vec![Box::new(empty_a.iter()), Box::new(empty_b.iter())]);
    assert!(!iter.is_valid());
}

fn build_sst(
    path: &std::path::Path,
    sst_id: u64,
    records: &[(&[u8], u64, &[u8])],
) -> Arc<SsTable> {
    let mut options = LsmStorageOptions::new(path);
    options.block_size = 256;
    let file = path.join(format!("{}.sst", sst_id));
    let mut builder = SsTableBuilder::new(sst_id, &file, &options).unwrap();
    for (key, seq, value) in records {
        builder
            .add(KeySlice::new(key, *seq, RecordType::Value), value)
            .unwrap();
    }
    Arc::new(SsTable::open(builder.finish().unwrap(), None, false).unwrap())
}

#[test]
fn test_concat_iterator_crosses_tables() {
    let dir = tempdir().unwrap();
    let a = build_sst(dir.path(), 1, &[(b"a", 1, b"va"), (b"b", 2, b"vb")]);
    let b = build_sst(dir.path(), 2, &[(b"c", 3, b"vc"), (b"d", 4, b"vd")]);
    let c = build_sst(dir.path(), 3, &[(b"e", 5, b"ve")]);

    let mut iter =
        SstConcatIterator::create_and_seek_to_first(vec![a.clone(), b.clone(), c.clone()]).unwrap();
    let mut keys = Vec::new();
    while iter.is_valid() {
        keys.push(Bytes::copy_from_slice(iter.key().user_key()));
        iter.next().unwrap();
    }
    assert_eq!(keys, vec!["a", "b", "c", "d", "e"]);

    // seek into the middle table
    let iter = SstConcatIterator::create_and_seek_to_key(
        vec![a.clone(), b.clone(), c.clone()],
        b"c",
        u64::MAX,
    )
    .unwrap();
    assert!(iter.is_valid());
    assert_eq!(iter.key().user_key(), b"c");

    // seek into a gap lands on the next table's first key
    let iter =
        SstConcatIterator::create_and_seek_to_key(vec![a.clone(), b.clone(), c.clone()], b"bb", 1)
            .unwrap();
    assert!(iter.is_valid());
    assert_eq!(iter.key().user_key(), b"c");

    // seek past everything is invalid
    let iter = SstConcatIterator::create_and_seek_to_key(vec![a, b, c], b"zz", 1).unwrap();
    assert!(!iter.is_valid());
}
