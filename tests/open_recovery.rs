//! End-to-end open, corruption, and recovery scenarios against real files.

use std::path::PathBuf;

use burrow::config::default_page_size;
use burrow::storage::{meta_from_page, PAGE_HEADER_SIZE};
use burrow::{Db, Error};

fn tempdb() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.db");
    (dir, path)
}

/// Offset of the meta record's `version` field within meta page `i`.
fn version_offset(page_size: usize, i: usize) -> usize {
    i * page_size + PAGE_HEADER_SIZE
}

/// Offset of the meta record's `pgid` field within meta page `i`.
fn pgid_offset(page_size: usize, i: usize) -> usize {
    i * page_size + PAGE_HEADER_SIZE + 8
}

#[test]
fn open_creates_a_four_page_file_with_valid_metas() {
    let (_dir, path) = tempdb();
    let db = Db::open(&path).unwrap();
    let page_size = db.page_size();
    assert_eq!(page_size, default_page_size());

    let len = std::fs::metadata(&path).unwrap().len();
    assert_eq!(len, (page_size * 4) as u64);

    // The second meta page validates on its own and carries its page id.
    let bytes = std::fs::read(&path).unwrap();
    let meta = meta_from_page(&bytes[page_size..]).unwrap();
    assert!(meta.validate().is_ok());
    assert_eq!(meta.version(), 1);
    assert_eq!(meta.page_size() as usize, page_size);
    assert_eq!(meta.pgid(), 1);
    assert_eq!(meta.checksum(), meta.sum64());
}

#[test]
fn open_accepts_an_existing_file() {
    let (_dir, path) = tempdb();
    drop(Db::open(&path).unwrap());
    assert!(Db::open(&path).is_ok());
}

#[test]
fn open_rejects_a_file_that_is_not_a_database() {
    let (_dir, path) = tempdb();
    std::fs::write(&path, b"this is not a burrow database\n").unwrap();

    let err = Db::open(&path).unwrap_err();
    assert_eq!(err.downcast_ref::<Error>(), Some(&Error::Invalid));
}

#[test]
fn open_reports_a_version_mismatch() {
    let (_dir, path) = tempdb();
    let page_size;
    {
        let db = Db::open(&path).unwrap();
        page_size = db.page_size();
    }

    // Bump the version in both meta copies and refresh nothing else; the
    // version check fires before the checksum check.
    let mut bytes = std::fs::read(&path).unwrap();
    for i in 0..2 {
        bytes[version_offset(page_size, i)] += 1;
    }
    std::fs::write(&path, &bytes).unwrap();

    let err = Db::open(&path).unwrap_err();
    assert_eq!(err.downcast_ref::<Error>(), Some(&Error::VersionMismatch));
}

#[test]
fn open_reports_a_checksum_error() {
    let (_dir, path) = tempdb();
    let page_size;
    {
        let db = Db::open(&path).unwrap();
        page_size = db.page_size();
    }

    // Corrupt the recorded high-water mark in both meta copies.
    let mut bytes = std::fs::read(&path).unwrap();
    for i in 0..2 {
        bytes[pgid_offset(page_size, i)] += 1;
    }
    std::fs::write(&path, &bytes).unwrap();

    let err = Db::open(&path).unwrap_err();
    assert_eq!(err.downcast_ref::<Error>(), Some(&Error::Checksum));
}

#[test]
fn open_recovers_when_only_one_meta_is_corrupt() {
    let (_dir, path) = tempdb();
    let page_size;
    {
        let db = Db::open(&path).unwrap();
        page_size = db.page_size();
    }

    let mut bytes = std::fs::read(&path).unwrap();
    bytes[pgid_offset(page_size, 0)] += 1;
    std::fs::write(&path, &bytes).unwrap();
    assert!(Db::open(&path).is_ok(), "meta 1 should heal a bad meta 0");

    let mut bytes = std::fs::read(&path).unwrap();
    bytes[pgid_offset(page_size, 0)] -= 1;
    bytes[pgid_offset(page_size, 1)] += 1;
    std::fs::write(&path, &bytes).unwrap();
    assert!(Db::open(&path).is_ok(), "meta 0 should heal a bad meta 1");
}

#[test]
fn a_commit_survives_in_the_file_metas() {
    let (_dir, path) = tempdb();
    let page_size;
    {
        let mut db = Db::open(&path).unwrap();
        page_size = db.page_size();
        db.update(|tx| tx.put(b"k", b"v")).unwrap();
    }

    // txid 1 lands in meta page 1; meta page 0 still holds txid 0.
    let bytes = std::fs::read(&path).unwrap();
    let meta0 = meta_from_page(&bytes[..page_size]).unwrap();
    let meta1 = meta_from_page(&bytes[page_size..2 * page_size]).unwrap();
    assert_eq!(meta0.txid(), 0);
    assert_eq!(meta1.txid(), 1);
    assert!(meta1.validate().is_ok());
    assert!(meta1.pgid() > 4);

    // Reopen adopts the newer meta.
    let db = Db::open(&path).unwrap();
    assert_eq!(db.meta().txid(), 1);
}

#[test]
fn alternating_commits_ping_pong_between_meta_pages() {
    let (_dir, path) = tempdb();
    let page_size;
    {
        let mut db = Db::open(&path).unwrap();
        page_size = db.page_size();
        db.update(|tx| tx.put(b"a", b"1")).unwrap();
        db.update(|tx| tx.put(b"b", b"2")).unwrap();
        db.update(|tx| tx.put(b"c", b"3")).unwrap();
    }

    let bytes = std::fs::read(&path).unwrap();
    let meta0 = meta_from_page(&bytes[..page_size]).unwrap();
    let meta1 = meta_from_page(&bytes[page_size..2 * page_size]).unwrap();
    assert_eq!(meta0.txid(), 2);
    assert_eq!(meta1.txid(), 3);
}

#[test]
fn a_multi_level_workload_reads_back_after_commit() {
    let (_dir, path) = tempdb();
    let mut db = Db::open(&path).unwrap();

    let mut tx = db.begin_rw().unwrap();
    for i in 0..1000u32 {
        let key = format!("user:{:06}", i);
        let value = format!("record-{}", i);
        tx.put(key.as_bytes(), value.as_bytes()).unwrap();
    }
    let stats = tx.commit().unwrap();
    assert!(stats.split > 0);
    drop(tx);

    let mut tx = db.begin_rw().unwrap();
    for i in (0..1000u32).step_by(3) {
        let key = format!("user:{:06}", i);
        tx.delete(key.as_bytes()).unwrap();
    }
    tx.commit().unwrap();
    drop(tx);

    let tx = db.begin_rw().unwrap();
    for i in 0..1000u32 {
        let key = format!("user:{:06}", i);
        let got = tx.get(key.as_bytes()).unwrap();
        if i % 3 == 0 {
            assert_eq!(got, None, "{} should be deleted", key);
        } else {
            assert_eq!(
                got,
                Some(format!("record-{}", i).into_bytes()),
                "{} should survive",
                key
            );
        }
    }
}
