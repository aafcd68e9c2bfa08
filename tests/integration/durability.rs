//! On-disk lifecycle: reopen, crash recovery via the double-buffered
//! header, file locking, and compaction.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};

use strata::{ColumnKind, Database, ReadAccess, StrataError};
use tempfile::TempDir;

fn populate(db: &Database, rows: i64) -> (u64, u64) {
    let mut txn = db.begin_write().unwrap();
    let t = txn.add_table("t").unwrap();
    let c = txn.add_column(t, "v", ColumnKind::Int).unwrap();
    for i in 0..rows {
        let row = txn.add_row(t).unwrap();
        txn.set_int(t, c, row, i).unwrap();
    }
    txn.commit().unwrap();
    (t, c)
}

#[test]
fn committed_data_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db.strata");
    let (t, c) = {
        let db = Database::open(&path).unwrap();
        populate(&db, 100)
    };
    let db = Database::open(&path).unwrap();
    let read = db.begin_read().unwrap();
    assert_eq!(read.row_count(t).unwrap(), 100);
    for i in 0..100u64 {
        assert_eq!(read.get_int(t, c, i).unwrap(), i as i64);
    }
}

#[test]
fn version_numbers_continue_across_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db.strata");
    {
        let db = Database::open(&path).unwrap();
        populate(&db, 1);
        assert_eq!(db.current_version(), 2);
    }
    let db = Database::open(&path).unwrap();
    assert_eq!(db.current_version(), 2);
    let mut txn = db.begin_write().unwrap();
    txn.set_int(0, 0, 0, 7).unwrap();
    txn.commit().unwrap();
    assert_eq!(db.current_version(), 3);
}

#[test]
fn uncommitted_changes_do_not_reach_disk() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db.strata");
    {
        let db = Database::open(&path).unwrap();
        populate(&db, 1);
        let mut txn = db.begin_write().unwrap();
        txn.set_int(0, 0, 0, 999).unwrap();
        // Dropped uncommitted.
    }
    let db = Database::open(&path).unwrap();
    assert_eq!(db.begin_read().unwrap().get_int(0, 0, 0).unwrap(), 0);
}

#[test]
fn torn_header_slot_falls_back_to_previous_version() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db.strata");
    {
        let db = Database::open(&path).unwrap();
        populate(&db, 1);
        let mut txn = db.begin_write().unwrap();
        txn.set_int(0, 0, 0, 42).unwrap();
        txn.commit().unwrap();
        // version 3 lives in slot 1 (3 % 2), version 2 in slot 0
    }
    // Corrupt the newest slot, simulating a crash mid header write.
    {
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(16 + 48)).unwrap();
        file.write_all(&[0xFF; 8]).unwrap();
    }
    let db = Database::open(&path).unwrap();
    assert_eq!(db.current_version(), 2);
    assert_eq!(db.begin_read().unwrap().get_int(0, 0, 0).unwrap(), 0);
}

#[test]
fn second_process_is_locked_out() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db.strata");
    let _db = Database::open(&path).unwrap();
    let err = Database::open(&path).unwrap_err();
    assert!(matches!(err, StrataError::IncompatibleLockFile));
}

#[test]
fn lock_is_released_on_close() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db.strata");
    {
        let _db = Database::open(&path).unwrap();
    }
    Database::open(&path).unwrap();
}

#[test]
fn compaction_shrinks_the_file_and_preserves_data() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db.strata");
    let db = Database::open(&path).unwrap();
    let (t, c) = populate(&db, 200);
    // Churn the same cells to pile up dead generations.
    for i in 0..50 {
        let mut txn = db.begin_write().unwrap();
        txn.set_int(t, c, 0, i).unwrap();
        txn.commit().unwrap();
    }
    let before = std::fs::metadata(&path).unwrap().len();
    assert!(db.compact().unwrap());
    let after = std::fs::metadata(&path).unwrap().len();
    assert!(after < before, "compaction did not shrink {before} -> {after}");

    let read = db.begin_read().unwrap();
    assert_eq!(read.row_count(t).unwrap(), 200);
    assert_eq!(read.get_int(t, c, 0).unwrap(), 49);
    assert_eq!(read.get_int(t, c, 199).unwrap(), 199);

    // And the compacted file reopens cleanly.
    drop(read);
    drop(db);
    let db = Database::open(&path).unwrap();
    assert_eq!(db.begin_read().unwrap().get_int(t, c, 123).unwrap(), 123);
}

#[test]
fn commits_after_compaction_append_normally() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db.strata");
    let db = Database::open(&path).unwrap();
    let (t, c) = populate(&db, 10);
    assert!(db.compact().unwrap());
    let mut txn = db.begin_write().unwrap();
    txn.set_int(t, c, 5, -5).unwrap();
    txn.commit().unwrap();
    let read = db.begin_read().unwrap();
    assert_eq!(read.get_int(t, c, 5).unwrap(), -5);
    assert_eq!(read.get_int(t, c, 4).unwrap(), 4);
}

#[test]
fn strings_and_links_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db.strata");
    {
        let db = Database::open(&path).unwrap();
        let mut txn = db.begin_write().unwrap();
        let a = txn.add_table("a").unwrap();
        let b = txn.add_table("b").unwrap();
        let name = txn.add_column(a, "name", ColumnKind::String).unwrap();
        let link = txn
            .add_link_column(a, "b_ref", ColumnKind::Link, b, false)
            .unwrap();
        let row = txn.add_row(a).unwrap();
        txn.add_row(b).unwrap();
        txn.set_string(a, name, row, &"x".repeat(2000)).unwrap();
        txn.set_link(a, link, row, Some(0)).unwrap();
        txn.commit().unwrap();
    }
    let db = Database::open(&path).unwrap();
    let read = db.begin_read().unwrap();
    assert_eq!(read.get_string(0, 0, 0).unwrap(), "x".repeat(2000));
    assert_eq!(read.get_link(0, 1, 0).unwrap(), Some(0));
    assert_eq!(read.backlinks(1, 0, 0, 1).unwrap(), [0]);
}
