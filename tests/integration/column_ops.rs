//! Table, column, and row operations through the public transaction API.

use proptest::prelude::*;
use strata::{ColumnKind, Database, LogicError, ReadAccess, StrataError};

fn db() -> Database {
    Database::open_in_memory().unwrap()
}

#[test]
fn fresh_database_is_empty() {
    let db = db();
    let read = db.begin_read().unwrap();
    assert_eq!(read.table_count().unwrap(), 0);
    assert_eq!(read.version(), 1);
}

#[test]
fn tables_and_columns_are_named_and_findable() {
    let db = db();
    let mut txn = db.begin_write().unwrap();
    let people = txn.add_table("people").unwrap();
    let pets = txn.add_table("pets").unwrap();
    assert_eq!((people, pets), (0, 1));
    let age = txn.add_column(people, "age", ColumnKind::Int).unwrap();
    let name = txn.add_column(people, "name", ColumnKind::String).unwrap();
    txn.commit().unwrap();

    let read = db.begin_read().unwrap();
    assert_eq!(read.table_count().unwrap(), 2);
    assert_eq!(read.table_name(people).unwrap(), "people");
    assert_eq!(read.find_table("pets").unwrap(), Some(pets));
    assert_eq!(read.find_table("plants").unwrap(), None);
    assert_eq!(read.column_count(people).unwrap(), 2);
    assert_eq!(read.column_name(people, name).unwrap(), "name");
    assert_eq!(read.find_column(people, "age").unwrap(), Some(age));
    assert_eq!(read.column_spec(people, age).unwrap().kind, ColumnKind::Int);
    assert_eq!(read.row_count(people).unwrap(), 0);
}

#[test]
fn int_cells_roundtrip() {
    let db = db();
    let mut txn = db.begin_write().unwrap();
    let t = txn.add_table("t").unwrap();
    let c = txn.add_column(t, "v", ColumnKind::Int).unwrap();
    for i in 0..100i64 {
        let row = txn.add_row(t).unwrap();
        txn.set_int(t, c, row, i * 1_000_003).unwrap();
    }
    txn.commit().unwrap();

    let read = db.begin_read().unwrap();
    assert_eq!(read.row_count(t).unwrap(), 100);
    for i in 0..100u64 {
        assert_eq!(read.get_int(t, c, i).unwrap(), i as i64 * 1_000_003);
    }
    assert_eq!(read.find_first_int(t, c, 42 * 1_000_003).unwrap(), Some(42));
    assert_eq!(read.find_first_int(t, c, -1).unwrap(), None);
}

#[test]
fn count_int_counts_matching_rows() {
    let db = db();
    let mut txn = db.begin_write().unwrap();
    let t = txn.add_table("t").unwrap();
    let c = txn.add_column(t, "v", ColumnKind::Int).unwrap();
    let s = txn.add_column(t, "s", ColumnKind::String).unwrap();
    for i in 0..30i64 {
        let row = txn.add_row(t).unwrap();
        txn.set_int(t, c, row, i % 4).unwrap();
    }
    txn.commit().unwrap();

    let read = db.begin_read().unwrap();
    assert_eq!(read.count_int(t, c, 0).unwrap(), 8);
    assert_eq!(read.count_int(t, c, 3).unwrap(), 7);
    assert_eq!(read.count_int(t, c, 9).unwrap(), 0);
    assert!(matches!(
        read.count_int(t, s, 0).unwrap_err(),
        StrataError::Logic(LogicError::TypeMismatch)
    ));
}

#[test]
fn float_and_double_cells_roundtrip() {
    let db = db();
    let mut txn = db.begin_write().unwrap();
    let t = txn.add_table("t").unwrap();
    let f = txn.add_column(t, "ratio", ColumnKind::Float).unwrap();
    let d = txn.add_column(t, "mass", ColumnKind::Double).unwrap();
    let row = txn.add_row(t).unwrap();
    assert_eq!(txn.get_float(t, f, row).unwrap(), 0.0);
    assert_eq!(txn.get_double(t, d, row).unwrap(), 0.0);
    txn.set_float(t, f, row, -7.125).unwrap();
    txn.set_double(t, d, row, 1.0 / 3.0).unwrap();
    // Bit patterns survive exactly, not just approximately.
    let nan_row = txn.add_row(t).unwrap();
    txn.set_float(t, f, nan_row, f32::NAN).unwrap();
    txn.commit().unwrap();

    let read = db.begin_read().unwrap();
    assert_eq!(read.get_float(t, f, 0).unwrap(), -7.125);
    assert_eq!(read.get_double(t, d, 0).unwrap(), 1.0 / 3.0);
    assert_eq!(read.get_float(t, f, 1).unwrap().to_bits(), f32::NAN.to_bits());
    assert!(matches!(
        read.get_float(t, d, 0).unwrap_err(),
        StrataError::Logic(LogicError::TypeMismatch)
    ));
    assert!(matches!(
        read.get_double(t, f, 0).unwrap_err(),
        StrataError::Logic(LogicError::TypeMismatch)
    ));
}

#[test]
fn new_rows_default_to_zero_and_empty() {
    let db = db();
    let mut txn = db.begin_write().unwrap();
    let t = txn.add_table("t").unwrap();
    let i = txn.add_column(t, "i", ColumnKind::Int).unwrap();
    let s = txn.add_column(t, "s", ColumnKind::String).unwrap();
    let b = txn.add_column(t, "b", ColumnKind::Binary).unwrap();
    let row = txn.add_row(t).unwrap();
    assert_eq!(txn.get_int(t, i, row).unwrap(), 0);
    assert_eq!(txn.get_string(t, s, row).unwrap(), "");
    assert_eq!(txn.get_bytes(t, b, row).unwrap(), Vec::<u8>::new());
    txn.commit().unwrap();
}

#[test]
fn adding_a_column_backfills_existing_rows() {
    let db = db();
    let mut txn = db.begin_write().unwrap();
    let t = txn.add_table("t").unwrap();
    let a = txn.add_column(t, "a", ColumnKind::Int).unwrap();
    for _ in 0..10 {
        txn.add_row(t).unwrap();
    }
    let late = txn.add_column(t, "late", ColumnKind::String).unwrap();
    assert_eq!(txn.row_count(t).unwrap(), 10);
    assert_eq!(txn.get_string(t, late, 9).unwrap(), "");
    txn.set_int(t, a, 9, 7).unwrap();
    txn.commit().unwrap();
}

#[test]
fn string_column_widens_through_all_representations() {
    let db = db();
    let mut txn = db.begin_write().unwrap();
    let t = txn.add_table("t").unwrap();
    let c = txn.add_column(t, "s", ColumnKind::String).unwrap();
    let r0 = txn.add_row(t).unwrap();
    let r1 = txn.add_row(t).unwrap();
    let r2 = txn.add_row(t).unwrap();
    txn.set_string(t, c, r0, "short").unwrap();
    // Past the 15-byte inline bound.
    let medium = "m".repeat(300);
    txn.set_string(t, c, r1, &medium).unwrap();
    // Past the 1024-byte medium bound.
    let big = "b".repeat(5000);
    txn.set_string(t, c, r2, &big).unwrap();
    txn.commit().unwrap();

    let read = db.begin_read().unwrap();
    // Widening rewrites the column but keeps every existing value.
    assert_eq!(read.get_string(t, c, r0).unwrap(), "short");
    assert_eq!(read.get_string(t, c, r1).unwrap(), medium);
    assert_eq!(read.get_string(t, c, r2).unwrap(), big);
    assert_eq!(read.find_first_string(t, c, "short").unwrap(), Some(r0));
}

#[test]
fn binary_cells_hold_arbitrary_bytes() {
    let db = db();
    let mut txn = db.begin_write().unwrap();
    let t = txn.add_table("t").unwrap();
    let c = txn.add_column(t, "blob", ColumnKind::Binary).unwrap();
    let row = txn.add_row(t).unwrap();
    let payload: Vec<u8> = (0..=255u8).cycle().take(3000).collect();
    txn.set_bytes(t, c, row, &payload).unwrap();
    assert_eq!(txn.get_bytes(t, c, row).unwrap(), payload);
    txn.commit().unwrap();
}

#[test]
fn insert_row_shifts_rows_up() {
    let db = db();
    let mut txn = db.begin_write().unwrap();
    let t = txn.add_table("t").unwrap();
    let c = txn.add_column(t, "v", ColumnKind::Int).unwrap();
    for i in [10, 20, 30] {
        let row = txn.add_row(t).unwrap();
        txn.set_int(t, c, row, i).unwrap();
    }
    txn.insert_row(t, 1).unwrap();
    assert_eq!(txn.row_count(t).unwrap(), 4);
    let values: Vec<i64> = (0..4).map(|r| txn.get_int(t, c, r).unwrap()).collect();
    assert_eq!(values, [10, 0, 20, 30]);
    txn.commit().unwrap();
}

#[test]
fn remove_row_moves_last_over() {
    let db = db();
    let mut txn = db.begin_write().unwrap();
    let t = txn.add_table("t").unwrap();
    let c = txn.add_column(t, "v", ColumnKind::Int).unwrap();
    for i in [10, 20, 30] {
        let row = txn.add_row(t).unwrap();
        txn.set_int(t, c, row, i).unwrap();
    }
    // The last row takes the freed slot.
    txn.remove_row(t, 1).unwrap();
    assert_eq!(txn.row_count(t).unwrap(), 2);
    assert_eq!(txn.get_int(t, c, 0).unwrap(), 10);
    assert_eq!(txn.get_int(t, c, 1).unwrap(), 30);
    txn.remove_row(t, 0).unwrap();
    assert_eq!(txn.row_count(t).unwrap(), 1);
    assert_eq!(txn.get_int(t, c, 0).unwrap(), 30);
    txn.commit().unwrap();
}

#[test]
fn clear_table_removes_every_row() {
    let db = db();
    let mut txn = db.begin_write().unwrap();
    let t = txn.add_table("t").unwrap();
    let c = txn.add_column(t, "v", ColumnKind::Int).unwrap();
    for i in 0..50 {
        let row = txn.add_row(t).unwrap();
        txn.set_int(t, c, row, i).unwrap();
    }
    txn.clear_table(t).unwrap();
    assert_eq!(txn.row_count(t).unwrap(), 0);
    // The table and schema survive.
    assert_eq!(txn.column_count(t).unwrap(), 1);
    let row = txn.add_row(t).unwrap();
    assert_eq!(txn.get_int(t, c, row).unwrap(), 0);
    txn.commit().unwrap();
}

#[test]
fn remove_table_shifts_following_tables_down() {
    let db = db();
    let mut txn = db.begin_write().unwrap();
    txn.add_table("a").unwrap();
    let b = txn.add_table("b").unwrap();
    txn.add_table("c").unwrap();
    txn.remove_table(b).unwrap();
    assert_eq!(txn.table_count().unwrap(), 2);
    assert_eq!(txn.table_name(0).unwrap(), "a");
    assert_eq!(txn.table_name(1).unwrap(), "c");
    txn.commit().unwrap();
}

#[test]
fn type_and_range_violations_are_logic_errors() {
    let db = db();
    let mut txn = db.begin_write().unwrap();
    let t = txn.add_table("t").unwrap();
    let c = txn.add_column(t, "v", ColumnKind::Int).unwrap();
    let row = txn.add_row(t).unwrap();

    let err = txn.set_string(t, c, row, "nope").unwrap_err();
    assert!(matches!(
        err,
        StrataError::Logic(LogicError::TypeMismatch)
    ));
    let err = txn.set_int(t, c, row + 1, 0).unwrap_err();
    assert!(matches!(
        err,
        StrataError::Logic(LogicError::IndexOutOfRange)
    ));
    let err = txn.set_int(t, c + 1, row, 0).unwrap_err();
    assert!(matches!(
        err,
        StrataError::Logic(LogicError::ColumnOutOfRange)
    ));
    let err = txn.add_row(t + 1).unwrap_err();
    assert!(matches!(
        err,
        StrataError::Logic(LogicError::TableOutOfRange)
    ));
    // Logic errors never poison the transaction.
    txn.set_int(t, c, row, 3).unwrap();
    txn.commit().unwrap();
    assert_eq!(db.begin_read().unwrap().get_int(t, c, row).unwrap(), 3);
}

#[test]
fn large_table_survives_many_structural_edits() {
    let db = db();
    let mut txn = db.begin_write().unwrap();
    let t = txn.add_table("t").unwrap();
    let c = txn.add_column(t, "v", ColumnKind::Int).unwrap();
    for i in 0..2000 {
        let row = txn.add_row(t).unwrap();
        txn.set_int(t, c, row, i).unwrap();
    }
    // Delete every other row from the front; move-last-over keeps the
    // column dense throughout.
    for _ in 0..500 {
        txn.remove_row(t, 0).unwrap();
    }
    assert_eq!(txn.row_count(t).unwrap(), 1500);
    let mut seen: Vec<i64> = (0..1500).map(|r| txn.get_int(t, c, r).unwrap()).collect();
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), 1500);
    txn.commit().unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Random sequences of row operations on an int column behave exactly
    /// like a `Vec<i64>` with move-last-over deletion.
    #[test]
    fn random_row_ops_match_vec_model(
        ops in proptest::collection::vec((0u8..4, any::<u16>(), any::<i64>()), 1..200),
    ) {
        let db = db();
        let mut txn = db.begin_write().unwrap();
        let t = txn.add_table("t").unwrap();
        let c = txn.add_column(t, "v", ColumnKind::Int).unwrap();
        let mut model: Vec<i64> = Vec::new();
        for (kind, raw, value) in ops {
            match kind {
                0 => {
                    let row = txn.add_row(t).unwrap();
                    txn.set_int(t, c, row, value).unwrap();
                    model.push(value);
                }
                1 if !model.is_empty() => {
                    let i = raw as usize % model.len();
                    txn.set_int(t, c, i as u64, value).unwrap();
                    model[i] = value;
                }
                2 => {
                    let i = raw as usize % (model.len() + 1);
                    txn.insert_row(t, i as u64).unwrap();
                    model.insert(i, 0);
                }
                3 if !model.is_empty() => {
                    let i = raw as usize % model.len();
                    txn.remove_row(t, i as u64).unwrap();
                    let last = model.pop().unwrap();
                    if i < model.len() {
                        model[i] = last;
                    }
                }
                _ => {}
            }
        }
        prop_assert_eq!(txn.row_count(t).unwrap(), model.len() as u64);
        let actual: Vec<i64> =
            (0..model.len() as u64).map(|r| txn.get_int(t, c, r).unwrap()).collect();
        prop_assert_eq!(actual, model);
        txn.commit().unwrap();
    }
}
