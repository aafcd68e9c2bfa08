//! Logical operation logs and replica convergence.
//!
//! The origin records one operation log per commit; feeding the logs to a
//! replica in commit order re-derives links, backlinks, and cascades
//! through the same engine code, so the replica converges byte-for-byte on
//! logical contents.

use strata::{apply_transact_log, ColumnKind, Database, Options, ReadAccess};

fn origin() -> Database {
    Options::in_memory().replicate(true).open().unwrap()
}

/// Applies every log committed on `origin` after `since` to `replica`,
/// one transaction per log. Returns the new origin version.
fn sync(origin: &Database, replica: &Database, since: u64) -> u64 {
    let upto = origin.current_version();
    for log in origin.commit_entries(since, upto) {
        let mut txn = replica.begin_write().unwrap();
        apply_transact_log(&log, &mut txn).unwrap();
        txn.commit().unwrap();
    }
    upto
}

/// Logical equality of two snapshots, deep enough for these tests.
fn assert_same_contents(a: &impl ReadAccess, b: &impl ReadAccess) {
    assert_eq!(a.table_count().unwrap(), b.table_count().unwrap());
    for t in 0..a.table_count().unwrap() {
        assert_eq!(a.table_name(t).unwrap(), b.table_name(t).unwrap());
        assert_eq!(a.column_count(t).unwrap(), b.column_count(t).unwrap());
        assert_eq!(a.row_count(t).unwrap(), b.row_count(t).unwrap());
        for c in 0..a.column_count(t).unwrap() {
            let spec = a.column_spec(t, c).unwrap();
            assert_eq!(spec, b.column_spec(t, c).unwrap());
            assert_eq!(a.column_name(t, c).unwrap(), b.column_name(t, c).unwrap());
            for r in 0..a.row_count(t).unwrap() {
                match spec.kind {
                    ColumnKind::Int => {
                        assert_eq!(a.get_int(t, c, r).unwrap(), b.get_int(t, c, r).unwrap())
                    }
                    ColumnKind::Float => assert_eq!(
                        a.get_float(t, c, r).unwrap().to_bits(),
                        b.get_float(t, c, r).unwrap().to_bits()
                    ),
                    ColumnKind::Double => assert_eq!(
                        a.get_double(t, c, r).unwrap().to_bits(),
                        b.get_double(t, c, r).unwrap().to_bits()
                    ),
                    ColumnKind::String => assert_eq!(
                        a.get_string(t, c, r).unwrap(),
                        b.get_string(t, c, r).unwrap()
                    ),
                    ColumnKind::Binary => assert_eq!(
                        a.get_bytes(t, c, r).unwrap(),
                        b.get_bytes(t, c, r).unwrap()
                    ),
                    ColumnKind::Link => {
                        assert_eq!(a.get_link(t, c, r).unwrap(), b.get_link(t, c, r).unwrap())
                    }
                    ColumnKind::LinkList => assert_eq!(
                        a.link_targets(t, c, r).unwrap(),
                        b.link_targets(t, c, r).unwrap()
                    ),
                    ColumnKind::Backlink => {}
                }
            }
        }
    }
}

#[test]
fn schema_and_data_replicate() {
    let origin = origin();
    let replica = Database::open_in_memory().unwrap();
    let mut txn = origin.begin_write().unwrap();
    let t = txn.add_table("people").unwrap();
    let name = txn.add_column(t, "name", ColumnKind::String).unwrap();
    let age = txn.add_column(t, "age", ColumnKind::Int).unwrap();
    for (n, a) in [("ada", 36), ("grace", 85), ("edsger", 72)] {
        let row = txn.add_row(t).unwrap();
        txn.set_string(t, name, row, n).unwrap();
        txn.set_int(t, age, row, a).unwrap();
    }
    txn.commit().unwrap();

    sync(&origin, &replica, 1);
    assert_same_contents(
        &origin.begin_read().unwrap(),
        &replica.begin_read().unwrap(),
    );
}

#[test]
fn logs_are_only_recorded_when_enabled() {
    let plain = Database::open_in_memory().unwrap();
    let mut txn = plain.begin_write().unwrap();
    txn.add_table("t").unwrap();
    txn.commit().unwrap();
    assert!(plain.commit_entries(0, plain.current_version()).is_empty());
}

#[test]
fn row_churn_replicates_through_move_last_over() {
    let origin = origin();
    let replica = Database::open_in_memory().unwrap();
    let mut txn = origin.begin_write().unwrap();
    let t = txn.add_table("t").unwrap();
    let c = txn.add_column(t, "v", ColumnKind::Int).unwrap();
    for i in 0..100 {
        let row = txn.add_row(t).unwrap();
        txn.set_int(t, c, row, i).unwrap();
    }
    txn.commit().unwrap();
    let mut synced = sync(&origin, &replica, 1);

    // Deletions and insertions in separate commits, replayed in order.
    let mut txn = origin.begin_write().unwrap();
    for _ in 0..30 {
        txn.remove_row(t, 3).unwrap();
    }
    txn.commit().unwrap();
    let mut txn = origin.begin_write().unwrap();
    for i in 0..10 {
        txn.insert_row(t, i * 2).unwrap();
        txn.set_int(t, c, i * 2, -(i as i64)).unwrap();
    }
    txn.commit().unwrap();
    synced = sync(&origin, &replica, synced);
    let _ = synced;
    assert_same_contents(
        &origin.begin_read().unwrap(),
        &replica.begin_read().unwrap(),
    );
}

#[test]
fn links_and_cascades_replicate() {
    let origin = origin();
    let replica = Database::open_in_memory().unwrap();
    let mut txn = origin.begin_write().unwrap();
    let a = txn.add_table("a").unwrap();
    let b = txn.add_table("b").unwrap();
    let strong = txn
        .add_link_column(a, "owns", ColumnKind::Link, b, true)
        .unwrap();
    let lists = txn
        .add_link_column(a, "sees", ColumnKind::LinkList, b, false)
        .unwrap();
    for _ in 0..5 {
        txn.add_row(a).unwrap();
        txn.add_row(b).unwrap();
    }
    txn.set_link(a, strong, 0, Some(0)).unwrap();
    txn.set_link(a, strong, 1, Some(1)).unwrap();
    let list = txn.linklist(a, lists, 0).unwrap();
    for target in [4, 2, 4] {
        txn.linklist_push(&list, target).unwrap();
    }
    txn.linklist_erase(&list, 1).unwrap();
    drop(list);
    txn.commit().unwrap();
    let synced = sync(&origin, &replica, 1);

    // The cascade is logged as a single logical op; the replica re-derives
    // the transitive removals itself.
    let mut txn = origin.begin_write().unwrap();
    txn.cascade_remove_row(a, 0).unwrap();
    txn.commit().unwrap();
    sync(&origin, &replica, synced);
    assert_same_contents(
        &origin.begin_read().unwrap(),
        &replica.begin_read().unwrap(),
    );
    let read = replica.begin_read().unwrap();
    assert_eq!(read.row_count(b).unwrap(), 4);
}

#[test]
fn float_cells_and_insert_link_replicate() {
    let origin = origin();
    let replica = Database::open_in_memory().unwrap();
    let mut txn = origin.begin_write().unwrap();
    let a = txn.add_table("a").unwrap();
    let b = txn.add_table("b").unwrap();
    let f = txn.add_column(a, "ratio", ColumnKind::Float).unwrap();
    let d = txn.add_column(a, "mass", ColumnKind::Double).unwrap();
    let link = txn.add_link_column(a, "to", ColumnKind::Link, b, false).unwrap();
    txn.add_row(a).unwrap();
    txn.add_row(b).unwrap();
    txn.add_row(b).unwrap();
    txn.set_float(a, f, 0, -1.25).unwrap();
    txn.set_double(a, d, 0, 6.02214076e23).unwrap();
    txn.insert_link(a, link, 0, 1).unwrap();
    txn.commit().unwrap();

    sync(&origin, &replica, 1);
    assert_same_contents(
        &origin.begin_read().unwrap(),
        &replica.begin_read().unwrap(),
    );
    let read = replica.begin_read().unwrap();
    assert_eq!(read.row_count(a).unwrap(), 2);
    assert_eq!(read.get_link(a, link, 0).unwrap(), Some(1));
}

#[test]
fn commit_entries_are_ranged_and_trimmable() {
    let origin = origin();
    let mut versions = Vec::new();
    for i in 0..4 {
        let mut txn = origin.begin_write().unwrap();
        if i == 0 {
            txn.add_table("t").unwrap();
            txn.add_column(0, "v", ColumnKind::Int).unwrap();
            txn.add_row(0).unwrap();
        }
        txn.set_int(0, 0, 0, i).unwrap();
        versions.push(txn.commit().unwrap());
    }
    assert_eq!(origin.commit_entries(1, versions[3]).len(), 4);
    assert_eq!(origin.commit_entries(versions[1], versions[2]).len(), 1);
    origin.trim_commit_entries(versions[1]);
    assert_eq!(origin.commit_entries(1, versions[3]).len(), 2);
}

#[test]
fn randomized_history_replays_to_convergence() {
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    let mut rng = ChaCha8Rng::seed_from_u64(0x5EED);
    let origin = origin();
    let replica = Database::open_in_memory().unwrap();

    let mut txn = origin.begin_write().unwrap();
    let t = txn.add_table("t").unwrap();
    let v = txn.add_column(t, "v", ColumnKind::Int).unwrap();
    let s = txn.add_column(t, "s", ColumnKind::String).unwrap();
    txn.commit().unwrap();

    let mut rows: u64 = 0;
    for _ in 0..20 {
        let mut txn = origin.begin_write().unwrap();
        for _ in 0..10 {
            match rng.gen_range(0..5) {
                0 => {
                    txn.add_row(t).unwrap();
                    rows += 1;
                }
                1 if rows > 0 => {
                    let r = rng.gen_range(0..rows);
                    txn.set_int(t, v, r, rng.gen()).unwrap();
                }
                2 if rows > 0 => {
                    let r = rng.gen_range(0..rows);
                    let text = "x".repeat(rng.gen_range(0..100));
                    txn.set_string(t, s, r, &text).unwrap();
                }
                3 if rows > 0 => {
                    let r = rng.gen_range(0..rows);
                    txn.remove_row(t, r).unwrap();
                    rows -= 1;
                }
                4 if rows > 0 => {
                    let r = rng.gen_range(0..=rows);
                    txn.insert_row(t, r).unwrap();
                    rows += 1;
                }
                _ => {}
            }
        }
        txn.commit().unwrap();
    }

    sync(&origin, &replica, 1);
    assert_same_contents(
        &origin.begin_read().unwrap(),
        &replica.begin_read().unwrap(),
    );
}

#[test]
fn replica_of_a_replica_converges() {
    let origin = origin();
    let middle = Options::in_memory().replicate(true).open().unwrap();
    let leaf = Database::open_in_memory().unwrap();

    let mut txn = origin.begin_write().unwrap();
    let t = txn.add_table("t").unwrap();
    let c = txn.add_column(t, "v", ColumnKind::Int).unwrap();
    let row = txn.add_row(t).unwrap();
    txn.set_int(t, c, row, 11).unwrap();
    txn.commit().unwrap();

    // Relay: origin -> middle -> leaf. The middle re-records the replayed
    // operations in its own logs.
    sync(&origin, &middle, 1);
    sync(&middle, &leaf, 1);
    assert_same_contents(
        &origin.begin_read().unwrap(),
        &leaf.begin_read().unwrap(),
    );
}
