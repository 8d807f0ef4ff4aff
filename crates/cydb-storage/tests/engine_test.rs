//! End-to-end engine scenarios through the key-value facade.

use cydb_common::{CydbError, ErrorKind, StorageConfig};
use cydb_storage::Db;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use tempfile::tempdir;

fn test_config() -> StorageConfig {
    StorageConfig {
        buffer_pool_pages: 32,
        fsync_enabled: false,
    }
}

fn open_db(path: &std::path::Path) -> Db {
    let mut db = Db::new();
    db.open_with_config(path, test_config()).unwrap();
    db
}

#[test]
fn empty_get() {
    let dir = tempdir().unwrap();
    let mut db = open_db(dir.path());

    let err = db.get(b"hello").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyNotFound);
}

#[test]
fn set_then_get() {
    let dir = tempdir().unwrap();
    let mut db = open_db(dir.path());

    db.set(b"hello", b"world").unwrap();
    assert_eq!(db.get(b"hello").unwrap(), b"world");
}

#[test]
fn overwrite_shrink() {
    let dir = tempdir().unwrap();
    let mut db = open_db(dir.path());

    db.set(b"k", b"XXXXX").unwrap();
    db.set(b"k", b"Y").unwrap();
    assert_eq!(db.get(b"k").unwrap(), b"Y");
    assert_eq!(db.metadata().unwrap().data_num, 1);
}

#[test]
fn overwrite_grow() {
    let dir = tempdir().unwrap();
    let mut db = open_db(dir.path());

    db.set(b"k", b"Y").unwrap();
    db.set(b"k", b"ZZZZZ").unwrap();
    assert_eq!(db.get(b"k").unwrap(), b"ZZZZZ");
    assert_eq!(db.metadata().unwrap().data_num, 1);
}

#[test]
fn split_trigger() {
    let dir = tempdir().unwrap();
    let mut db = open_db(dir.path());

    let mut inserted = 0u32;
    loop {
        let key = inserted.to_string();
        db.set(key.as_bytes(), key.as_bytes()).unwrap();
        inserted += 1;
        if db.metadata().unwrap().node_num > 1 {
            break;
        }
    }

    let metadata = *db.metadata().unwrap();
    assert_eq!(metadata.node_num, 3);
    assert_eq!(metadata.root_id.0, 2);
    assert_eq!(metadata.data_num, inserted as u64);

    for i in 0..inserted {
        let key = i.to_string();
        assert_eq!(db.get(key.as_bytes()).unwrap(), key.as_bytes());
    }

    for i in 0..inserted {
        db.remove(i.to_string().as_bytes()).unwrap();
    }
    assert_eq!(db.metadata().unwrap().data_num, 0);

    for i in 0..inserted {
        let err = db.get(i.to_string().as_bytes()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KeyNotFound);
    }
}

#[test]
fn reopen() {
    let dir = tempdir().unwrap();

    let mut db = open_db(dir.path());
    db.set(b"cyber", b"yah2er0ne").unwrap();
    db.close().unwrap();

    let mut db = open_db(dir.path());
    assert_eq!(db.get(b"cyber").unwrap(), b"yah2er0ne");
}

#[test]
fn remove_present_and_absent() {
    let dir = tempdir().unwrap();
    let mut db = open_db(dir.path());

    db.set(b"a", b"1").unwrap();
    db.remove(b"a").unwrap();

    let err = db.remove(b"a").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyNotFound);
}

#[test]
fn set_get_remove_cycles() {
    let dir = tempdir().unwrap();
    let mut db = open_db(dir.path());

    for i in 0..1000u32 {
        let key = i.to_string();
        db.set(key.as_bytes(), key.as_bytes()).unwrap();
        assert_eq!(db.get(key.as_bytes()).unwrap(), key.as_bytes());
        db.remove(key.as_bytes()).unwrap();
        assert!(matches!(db.get(key.as_bytes()), Err(CydbError::KeyNotFound)));
    }
    assert_eq!(db.metadata().unwrap().data_num, 0);
}

#[test]
fn binary_keys_and_values() {
    let dir = tempdir().unwrap();
    let mut db = open_db(dir.path());

    let key = [0u8, 255, 1, 0, 128];
    let value = [0u8, 0, 0, 7];
    db.set(&key, &value).unwrap();
    db.set(b"text", b"").unwrap();

    assert_eq!(db.get(&key).unwrap(), value);
    assert_eq!(db.get(b"text").unwrap(), b"");
}

#[test]
fn keys_order_lexicographically() {
    let dir = tempdir().unwrap();
    let mut db = open_db(dir.path());

    // Unsigned byte comparison: 0xFF sorts above ASCII, prefixes sort first.
    db.set(&[0xFF], b"high").unwrap();
    db.set(b"a", b"1").unwrap();
    db.set(b"ab", b"2").unwrap();
    db.set(b"b", b"3").unwrap();

    let keys: Vec<Vec<u8>> = db.scan(&[], &[0xFF]).unwrap().map(|(k, _)| k).collect();
    assert_eq!(
        keys,
        vec![b"a".to_vec(), b"ab".to_vec(), b"b".to_vec(), vec![0xFF]]
    );
}

#[test]
fn scan_spans_leaves() {
    let dir = tempdir().unwrap();
    let mut db = open_db(dir.path());

    let count = 3000u32;
    for i in 0..count {
        let key = format!("key{:06}", i);
        db.set(key.as_bytes(), &i.to_le_bytes()).unwrap();
    }
    assert!(db.metadata().unwrap().node_num > 1);

    // A middle slice, exact bounds inclusive.
    let start = format!("key{:06}", 1000);
    let end = format!("key{:06}", 1999);
    let pairs: Vec<_> = db.scan(start.as_bytes(), end.as_bytes()).unwrap().collect();
    assert_eq!(pairs.len(), 1000);
    assert_eq!(pairs[0].0, start.as_bytes());
    assert_eq!(pairs[999].0, end.as_bytes());
    for window in pairs.windows(2) {
        assert!(window[0].0 < window[1].0);
    }

    // Bounds that match no stored key still bracket correctly.
    let pairs: Vec<_> = db.scan(b"key000999x", b"key001002x").unwrap().collect();
    assert_eq!(pairs.len(), 3);
}

#[test]
fn random_workload_matches_model() {
    let dir = tempdir().unwrap();
    let mut db = open_db(dir.path());
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(0xC4DB);

    for _ in 0..5000 {
        let key = format!("key{:03}", rng.gen_range(0..400)).into_bytes();
        match rng.gen_range(0..10) {
            0..=5 => {
                let value = vec![rng.gen::<u8>(); rng.gen_range(0..200)];
                db.set(&key, &value).unwrap();
                model.insert(key, value);
            }
            6..=7 => {
                let expected = model.remove(&key);
                let got = db.remove(&key);
                match expected {
                    Some(_) => got.unwrap(),
                    None => assert!(matches!(got, Err(CydbError::KeyNotFound))),
                }
            }
            _ => {
                let got = db.get(&key);
                match model.get(&key) {
                    Some(value) => assert_eq!(&got.unwrap(), value),
                    None => assert!(matches!(got, Err(CydbError::KeyNotFound))),
                }
            }
        }
    }

    assert_eq!(db.metadata().unwrap().data_num, model.len() as u64);

    // The engine and the model agree on the full ordered contents.
    let engine: Vec<_> = db.scan(&[], &[0xFF]).unwrap().collect();
    let expected: Vec<_> = model
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    assert_eq!(engine, expected);

    // And still agree after a shutdown round trip.
    db.close().unwrap();
    let mut db = open_db(dir.path());
    let engine: Vec<_> = db.scan(&[], &[0xFF]).unwrap().collect();
    assert_eq!(engine, expected);
}
