//! Links, link lists, backlinks, and cascading deletes.

use strata::{ColumnKind, Database, LogicError, ReadAccess, StrataError};

fn db() -> Database {
    Database::open_in_memory().unwrap()
}

/// Two tables, a link column from the first to the second, and `rows` rows
/// in each. Returns (origin table, target table, link column).
fn linked_pair(txn: &mut strata::WriteTransaction, strong: bool, rows: u64) -> (u64, u64, u64) {
    let origin = txn.add_table("origin").unwrap();
    let target = txn.add_table("target").unwrap();
    let link = txn
        .add_link_column(origin, "link", ColumnKind::Link, target, strong)
        .unwrap();
    for _ in 0..rows {
        txn.add_row(origin).unwrap();
        txn.add_row(target).unwrap();
    }
    (origin, target, link)
}

#[test]
fn link_cells_default_to_null() {
    let db = db();
    let mut txn = db.begin_write().unwrap();
    let (origin, _, link) = linked_pair(&mut txn, false, 3);
    for row in 0..3 {
        assert_eq!(txn.get_link(origin, link, row).unwrap(), None);
    }
    txn.commit().unwrap();
}

#[test]
fn set_link_maintains_backlinks_both_ways() {
    let db = db();
    let mut txn = db.begin_write().unwrap();
    let (origin, target, link) = linked_pair(&mut txn, false, 3);
    txn.set_link(origin, link, 0, Some(2)).unwrap();
    txn.set_link(origin, link, 1, Some(2)).unwrap();
    assert_eq!(txn.get_link(origin, link, 0).unwrap(), Some(2));
    assert_eq!(txn.backlinks(target, 2, origin, link).unwrap(), [0, 1]);

    // Repointing moves the backlink entry.
    txn.set_link(origin, link, 1, Some(0)).unwrap();
    assert_eq!(txn.backlinks(target, 2, origin, link).unwrap(), [0]);
    assert_eq!(txn.backlinks(target, 0, origin, link).unwrap(), [1]);

    // Nulling removes it.
    txn.nullify_link(origin, link, 0).unwrap();
    assert_eq!(txn.backlink_count(target, 2, origin, link).unwrap(), 0);
    txn.commit().unwrap();
}

#[test]
fn insert_link_adds_a_linked_row_in_one_step() {
    let db = db();
    let mut txn = db.begin_write().unwrap();
    let (origin, target, link) = linked_pair(&mut txn, false, 3);
    txn.set_link(origin, link, 2, Some(1)).unwrap();

    // Inserts before row 1; existing rows 1 and 2 shift up.
    txn.insert_link(origin, link, 1, 2).unwrap();
    assert_eq!(txn.row_count(origin).unwrap(), 4);
    assert_eq!(txn.get_link(origin, link, 1).unwrap(), Some(2));
    assert_eq!(txn.backlinks(target, 2, origin, link).unwrap(), [1]);
    // The link set before the insertion survived the shift.
    assert_eq!(txn.get_link(origin, link, 3).unwrap(), Some(1));
    assert_eq!(txn.backlinks(target, 1, origin, link).unwrap(), [3]);

    // An out-of-range target is rejected before any row is added.
    assert!(matches!(
        txn.insert_link(origin, link, 0, 99).unwrap_err(),
        StrataError::Logic(LogicError::IndexOutOfRange)
    ));
    assert_eq!(txn.row_count(origin).unwrap(), 4);
    txn.commit().unwrap();
}

#[test]
fn insert_link_into_a_self_referencing_table() {
    let db = db();
    let mut txn = db.begin_write().unwrap();
    let t = txn.add_table("nodes").unwrap();
    let next = txn
        .add_link_column(t, "next", ColumnKind::Link, t, false)
        .unwrap();
    txn.add_row(t).unwrap();
    txn.add_row(t).unwrap();
    txn.set_link(t, next, 0, Some(1)).unwrap();

    // The target index is interpreted after the insertion, so the new row
    // at 1 may name the row that just shifted to 2.
    txn.insert_link(t, next, 1, 2).unwrap();
    assert_eq!(txn.row_count(t).unwrap(), 3);
    assert_eq!(txn.get_link(t, next, 1).unwrap(), Some(2));
    // The pre-existing link's target shifted from 1 to 2 with its row.
    assert_eq!(txn.get_link(t, next, 0).unwrap(), Some(2));
    assert_eq!(txn.backlinks(t, 2, t, next).unwrap(), [0, 1]);
    txn.commit().unwrap();
}

#[test]
fn link_target_must_be_in_range() {
    let db = db();
    let mut txn = db.begin_write().unwrap();
    let (origin, _, link) = linked_pair(&mut txn, false, 2);
    let err = txn.set_link(origin, link, 0, Some(2)).unwrap_err();
    assert!(matches!(
        err,
        StrataError::Logic(LogicError::IndexOutOfRange)
    ));
}

#[test]
fn linklist_insert_erase_clear() {
    let db = db();
    let mut txn = db.begin_write().unwrap();
    let origin = txn.add_table("origin").unwrap();
    let target = txn.add_table("target").unwrap();
    let lists = txn
        .add_link_column(origin, "lists", ColumnKind::LinkList, target, false)
        .unwrap();
    let row = txn.add_row(origin).unwrap();
    for _ in 0..4 {
        txn.add_row(target).unwrap();
    }

    let list = txn.linklist(origin, lists, row).unwrap();
    txn.linklist_push(&list, 0).unwrap();
    txn.linklist_push(&list, 2).unwrap();
    txn.linklist_insert(&list, 1, 3).unwrap();
    // Duplicates are allowed.
    txn.linklist_push(&list, 0).unwrap();
    assert_eq!(txn.linklist_targets(&list).unwrap(), [0, 3, 2, 0]);
    assert_eq!(txn.linklist_len(&list).unwrap(), 4);
    assert_eq!(txn.linklist_get(&list, 1).unwrap(), 3);
    assert_eq!(txn.backlinks(target, 0, origin, lists).unwrap(), [row, row]);

    txn.linklist_erase(&list, 0).unwrap();
    assert_eq!(txn.linklist_targets(&list).unwrap(), [3, 2, 0]);
    assert_eq!(txn.backlinks(target, 0, origin, lists).unwrap(), [row]);

    txn.linklist_clear(&list).unwrap();
    assert_eq!(txn.linklist_len(&list).unwrap(), 0);
    assert_eq!(txn.backlink_count(target, 2, origin, lists).unwrap(), 0);
    txn.commit().unwrap();

    let read = db.begin_read().unwrap();
    assert_eq!(read.link_targets(origin, lists, row).unwrap(), Vec::<u64>::new());
}

#[test]
fn removing_a_row_breaks_links_in_both_directions() {
    let db = db();
    let mut txn = db.begin_write().unwrap();
    let (origin, target, link) = linked_pair(&mut txn, false, 3);
    txn.set_link(origin, link, 0, Some(1)).unwrap();
    txn.set_link(origin, link, 2, Some(1)).unwrap();

    // Deleting the target nulls every cell referencing it.
    txn.remove_row(target, 1).unwrap();
    assert_eq!(txn.get_link(origin, link, 0).unwrap(), None);
    assert_eq!(txn.get_link(origin, link, 2).unwrap(), None);
    txn.commit().unwrap();
}

#[test]
fn move_last_over_repoints_links_to_the_moved_row() {
    let db = db();
    let mut txn = db.begin_write().unwrap();
    let (origin, target, link) = linked_pair(&mut txn, false, 4);
    // Reference the last target row, then delete an unrelated one; the
    // last row moves into the hole and the link must follow it.
    txn.set_link(origin, link, 0, Some(3)).unwrap();
    txn.remove_row(target, 1).unwrap();
    assert_eq!(txn.get_link(origin, link, 0).unwrap(), Some(1));
    assert_eq!(txn.backlinks(target, 1, origin, link).unwrap(), [0]);
    txn.commit().unwrap();
}

#[test]
fn insert_row_renumbers_link_targets() {
    let db = db();
    let mut txn = db.begin_write().unwrap();
    let (origin, target, link) = linked_pair(&mut txn, false, 3);
    txn.set_link(origin, link, 0, Some(0)).unwrap();
    txn.set_link(origin, link, 1, Some(2)).unwrap();
    // Inserting in the target table shifts rows 1.. up by one.
    txn.insert_row(target, 1).unwrap();
    assert_eq!(txn.get_link(origin, link, 0).unwrap(), Some(0));
    assert_eq!(txn.get_link(origin, link, 1).unwrap(), Some(3));
    assert_eq!(txn.backlinks(target, 3, origin, link).unwrap(), [1]);
    txn.commit().unwrap();
}

#[test]
fn linklist_accessor_follows_row_moves_and_detaches_on_delete() {
    let db = db();
    let mut txn = db.begin_write().unwrap();
    let origin = txn.add_table("origin").unwrap();
    let target = txn.add_table("target").unwrap();
    let lists = txn
        .add_link_column(origin, "lists", ColumnKind::LinkList, target, false)
        .unwrap();
    for _ in 0..3 {
        txn.add_row(origin).unwrap();
        txn.add_row(target).unwrap();
    }
    let list = txn.linklist(origin, lists, 2).unwrap();
    txn.linklist_push(&list, 1).unwrap();

    // Deleting row 0 moves row 2 into its place; the handle follows.
    txn.remove_row(origin, 0).unwrap();
    assert_eq!(list.row(), Some(0));
    assert_eq!(txn.linklist_targets(&list).unwrap(), [1]);

    // Deleting the handle's own row detaches it.
    txn.remove_row(origin, 0).unwrap();
    assert!(!list.is_attached());
    let err = txn.linklist_push(&list, 1).unwrap_err();
    assert!(matches!(
        err,
        StrataError::Logic(LogicError::DetachedAccessor)
    ));
}

#[test]
fn weak_links_do_not_cascade() {
    let db = db();
    let mut txn = db.begin_write().unwrap();
    let (origin, target, link) = linked_pair(&mut txn, false, 2);
    txn.set_link(origin, link, 0, Some(0)).unwrap();
    txn.cascade_remove_row(origin, 0).unwrap();
    assert_eq!(txn.row_count(origin).unwrap(), 1);
    assert_eq!(txn.row_count(target).unwrap(), 2);
    txn.commit().unwrap();
}

#[test]
fn strong_link_cascades_to_orphaned_target() {
    let db = db();
    let mut txn = db.begin_write().unwrap();
    let (origin, target, link) = linked_pair(&mut txn, true, 2);
    txn.set_link(origin, link, 0, Some(0)).unwrap();
    txn.cascade_remove_row(origin, 0).unwrap();
    // The target row lost its only strong referrer and went with it.
    assert_eq!(txn.row_count(origin).unwrap(), 1);
    assert_eq!(txn.row_count(target).unwrap(), 1);
    txn.commit().unwrap();
}

#[test]
fn shared_strong_target_survives_one_referrer() {
    let db = db();
    let mut txn = db.begin_write().unwrap();
    let (origin, target, link) = linked_pair(&mut txn, true, 2);
    txn.set_link(origin, link, 0, Some(0)).unwrap();
    txn.set_link(origin, link, 1, Some(0)).unwrap();
    txn.cascade_remove_row(origin, 0).unwrap();
    assert_eq!(txn.row_count(target).unwrap(), 2);
    // Removing the surviving referrer orphans the target for real.
    txn.cascade_remove_row(origin, 0).unwrap();
    assert_eq!(txn.row_count(origin).unwrap(), 0);
    assert_eq!(txn.row_count(target).unwrap(), 1);
    txn.commit().unwrap();
}

#[test]
fn cascade_chains_through_intermediate_tables() {
    let db = db();
    let mut txn = db.begin_write().unwrap();
    let a = txn.add_table("a").unwrap();
    let b = txn.add_table("b").unwrap();
    let c = txn.add_table("c").unwrap();
    let ab = txn
        .add_link_column(a, "ab", ColumnKind::Link, b, true)
        .unwrap();
    let bc = txn
        .add_link_column(b, "bc", ColumnKind::LinkList, c, true)
        .unwrap();
    let (ra, rb, rc) = (
        txn.add_row(a).unwrap(),
        txn.add_row(b).unwrap(),
        txn.add_row(c).unwrap(),
    );
    txn.set_link(a, ab, ra, Some(rb)).unwrap();
    let list = txn.linklist(b, bc, rb).unwrap();
    txn.linklist_push(&list, rc).unwrap();
    drop(list);

    txn.cascade_remove_row(a, ra).unwrap();
    assert_eq!(txn.row_count(a).unwrap(), 0);
    assert_eq!(txn.row_count(b).unwrap(), 0);
    assert_eq!(txn.row_count(c).unwrap(), 0);
    txn.commit().unwrap();
}

#[test]
fn self_table_links_work() {
    let db = db();
    let mut txn = db.begin_write().unwrap();
    let t = txn.add_table("t").unwrap();
    let parent = txn
        .add_link_column(t, "parent", ColumnKind::Link, t, false)
        .unwrap();
    for _ in 0..3 {
        txn.add_row(t).unwrap();
    }
    txn.set_link(t, parent, 1, Some(0)).unwrap();
    txn.set_link(t, parent, 2, Some(2)).unwrap();
    assert_eq!(txn.backlinks(t, 0, t, parent).unwrap(), [1]);
    assert_eq!(txn.backlinks(t, 2, t, parent).unwrap(), [2]);

    // Delete row 0: row 2 moves into the hole, and its self-link must
    // follow both ends of the move.
    txn.remove_row(t, 0).unwrap();
    assert_eq!(txn.row_count(t).unwrap(), 2);
    assert_eq!(txn.get_link(t, parent, 0).unwrap(), Some(0));
    assert_eq!(txn.backlinks(t, 0, t, parent).unwrap(), [0]);
    assert_eq!(txn.get_link(t, parent, 1).unwrap(), None);
    txn.commit().unwrap();
}

#[test]
fn remove_table_is_refused_while_links_point_at_it() {
    let db = db();
    let mut txn = db.begin_write().unwrap();
    let (origin, target, _) = linked_pair(&mut txn, false, 1);
    let err = txn.remove_table(target).unwrap_err();
    assert!(matches!(
        err,
        StrataError::Logic(LogicError::CrossTableLink)
    ));
    // Removing the origin tears down its link column and the hidden
    // backlink column in the target.
    txn.remove_table(origin).unwrap();
    assert_eq!(txn.table_count().unwrap(), 1);
    assert_eq!(txn.column_count(0).unwrap(), 0);
    txn.commit().unwrap();
}
