//! Durability and crash-recovery round trips.
//!
//! "Crash" here means leaking the engine with `mem::forget`, so nothing
//! is flushed or closed and only the write-ahead log survives.

use cydb_common::StorageConfig;
use cydb_storage::Db;
use std::path::Path;
use tempfile::tempdir;

fn test_config() -> StorageConfig {
    StorageConfig {
        buffer_pool_pages: 32,
        fsync_enabled: false,
    }
}

fn open_db(path: &Path) -> Db {
    let mut db = Db::new();
    db.open_with_config(path, test_config()).unwrap();
    db
}

fn crash(db: Db) {
    std::mem::forget(db);
}

fn wal_path(dir: &Path) -> std::path::PathBuf {
    dir.join(cydb_wal::WAL_FILE_NAME)
}

#[test]
fn clean_shutdown_roundtrip() {
    let dir = tempdir().unwrap();

    let mut db = open_db(dir.path());
    for i in 0..2000u32 {
        let key = format!("key{:05}", i);
        db.set(key.as_bytes(), key.to_uppercase().as_bytes()).unwrap();
    }
    for i in (0..2000u32).step_by(3) {
        db.remove(format!("key{:05}", i).as_bytes()).unwrap();
    }
    let metadata = *db.metadata().unwrap();
    db.close().unwrap();
    assert!(!wal_path(dir.path()).exists());

    let mut db = open_db(dir.path());
    assert_eq!(*db.metadata().unwrap(), metadata);
    for i in 0..2000u32 {
        let key = format!("key{:05}", i);
        let got = db.get(key.as_bytes());
        if i % 3 == 0 {
            assert!(got.is_err(), "removed {} resurfaced", key);
        } else {
            assert_eq!(got.unwrap(), key.to_uppercase().as_bytes());
        }
    }
}

#[test]
fn crash_replays_wal() {
    let dir = tempdir().unwrap();

    let mut db = open_db(dir.path());
    db.set(b"hello", b"world").unwrap();
    db.set(b"cyber", b"yah2er0ne").unwrap();
    db.set(b"hello", b"again").unwrap();
    db.remove(b"cyber").unwrap();
    crash(db);

    assert!(wal_path(dir.path()).exists());

    let mut db = open_db(dir.path());
    assert_eq!(db.get(b"hello").unwrap(), b"again");
    assert!(db.get(b"cyber").is_err());
    assert_eq!(db.metadata().unwrap().data_num, 1);
}

#[test]
fn crash_after_splits_recovers_the_whole_tree() {
    let dir = tempdir().unwrap();

    let mut db = open_db(dir.path());
    let count = 3000u32;
    for i in 0..count {
        let key = format!("key{:06}", i);
        db.set(key.as_bytes(), key.as_bytes()).unwrap();
    }
    assert!(db.metadata().unwrap().node_num > 3);
    crash(db);

    let mut db = open_db(dir.path());
    assert_eq!(db.metadata().unwrap().data_num, count as u64);
    for i in 0..count {
        let key = format!("key{:06}", i);
        assert_eq!(db.get(key.as_bytes()).unwrap(), key.as_bytes());
    }
}

#[test]
fn crash_after_eviction_pressure_recovers() {
    let dir = tempdir().unwrap();

    // A tiny pool forces dirty pages out to disk mid-session, so recovery
    // sees a mix of flushed and unflushed pages.
    let mut db = Db::new();
    db.open_with_config(
        dir.path(),
        StorageConfig {
            buffer_pool_pages: 2,
            fsync_enabled: false,
        },
    )
    .unwrap();

    let count = 1500u32;
    for i in 0..count {
        let key = format!("key{:06}", i);
        db.set(key.as_bytes(), b"v").unwrap();
    }
    crash(db);

    let mut db = open_db(dir.path());
    assert_eq!(db.metadata().unwrap().data_num, count as u64);
    for i in (0..count).step_by(13) {
        let key = format!("key{:06}", i);
        assert_eq!(db.get(key.as_bytes()).unwrap(), b"v");
    }
}

#[test]
fn torn_wal_tail_recovers_the_prefix() {
    let dir = tempdir().unwrap();

    let mut db = open_db(dir.path());
    db.set(b"first", b"1").unwrap();
    db.set(b"second", b"2").unwrap();
    crash(db);

    // Tear the tail of the log as a crash mid-append would.
    let path = wal_path(dir.path());
    let len = std::fs::metadata(&path).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len - 3).unwrap();

    let mut db = open_db(dir.path());
    assert_eq!(db.get(b"first").unwrap(), b"1");
    assert!(db.get(b"second").is_err());
    assert_eq!(db.metadata().unwrap().data_num, 1);
}

#[test]
fn crash_then_clean_cycle() {
    let dir = tempdir().unwrap();

    let mut db = open_db(dir.path());
    db.set(b"a", b"1").unwrap();
    crash(db);

    // Recover, write more, shut down cleanly.
    let mut db = open_db(dir.path());
    db.set(b"b", b"2").unwrap();
    db.close().unwrap();
    assert!(!wal_path(dir.path()).exists());

    // One more crash on top of the clean state.
    let mut db = open_db(dir.path());
    db.set(b"c", b"3").unwrap();
    crash(db);

    let mut db = open_db(dir.path());
    assert_eq!(db.get(b"a").unwrap(), b"1");
    assert_eq!(db.get(b"b").unwrap(), b"2");
    assert_eq!(db.get(b"c").unwrap(), b"3");
    assert_eq!(db.metadata().unwrap().data_num, 3);
}

#[test]
fn dropping_an_open_handle_flushes() {
    let dir = tempdir().unwrap();

    {
        let mut db = open_db(dir.path());
        db.set(b"k", b"v").unwrap();
        // Dropped without an explicit close.
    }
    assert!(!wal_path(dir.path()).exists());

    let mut db = open_db(dir.path());
    assert_eq!(db.get(b"k").unwrap(), b"v");
}
