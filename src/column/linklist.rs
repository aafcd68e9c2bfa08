//! Link-list accessors.
//!
//! A [`LinkList`] is a stable handle onto one link-list cell. Handles
//! survive row moves inside the owning write transaction: the registry
//! retargets them when move-last-over relocates their row, and detaches
//! them when their row is deleted. Operations through a detached handle
//! fail with a detached-accessor error instead of touching the wrong row.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::arena::Ref;
use crate::column::ColumnKind;
use crate::error::{LogicError, Result};
use crate::group::ReadAccess;
use crate::replog::LogOp;
use crate::tree::{IntCodec, RefCodec, Tree, TreeView};
use crate::txn::WriteTransaction;

pub(crate) struct ListState {
    table: u64,
    column: u64,
    /// `None` once the underlying row has been deleted.
    row: Option<u64>,
}

/// Handle onto one link-list cell of a write transaction.
#[derive(Clone)]
pub struct LinkList {
    state: Rc<RefCell<ListState>>,
}

impl LinkList {
    /// False once the underlying row has been deleted.
    pub fn is_attached(&self) -> bool {
        self.state.borrow().row.is_some()
    }

    /// Current row of the handle, tracking row moves.
    pub fn row(&self) -> Option<u64> {
        self.state.borrow().row
    }
}

/// Weak index of the live list handles of one write transaction.
#[derive(Default)]
pub(crate) struct LinkListRegistry {
    live: Vec<Weak<RefCell<ListState>>>,
}

impl LinkListRegistry {
    fn register(&mut self, state: &Rc<RefCell<ListState>>) {
        self.live.retain(|w| w.strong_count() > 0);
        self.live.push(Rc::downgrade(state));
    }

    fn for_each(&mut self, mut apply: impl FnMut(&mut ListState)) {
        self.live.retain(|weak| match weak.upgrade() {
            Some(state) => {
                apply(&mut state.borrow_mut());
                true
            }
            None => false,
        });
    }

    /// Detaches handles onto a deleted row.
    pub(crate) fn detach_row(&mut self, table: u64, row: u64) {
        self.for_each(|s| {
            if s.table == table && s.row == Some(row) {
                s.row = None;
            }
        });
    }

    /// Follows a move-last-over: handles on `from` now address `to`.
    pub(crate) fn retarget_row(&mut self, table: u64, from: u64, to: u64) {
        self.for_each(|s| {
            if s.table == table && s.row == Some(from) {
                s.row = Some(to);
            }
        });
    }

    /// Follows a row insertion: handles at or above `start` shift up.
    pub(crate) fn shift_rows(&mut self, table: u64, start: u64, delta: u64) {
        self.for_each(|s| {
            if s.table == table {
                if let Some(row) = s.row {
                    if row >= start {
                        s.row = Some(row + delta);
                    }
                }
            }
        });
    }

    /// Detaches every handle of a removed table.
    pub(crate) fn detach_table(&mut self, table: u64) {
        self.for_each(|s| {
            if s.table == table {
                s.row = None;
            }
        });
    }

    /// Follows a table removal: table indices above it shift down.
    pub(crate) fn shift_tables(&mut self, removed: u64) {
        self.for_each(|s| {
            if s.table > removed {
                s.table -= 1;
            }
        });
    }

    /// Follows a column removal inside `table`.
    pub(crate) fn shift_columns(&mut self, table: u64, removed: u64) {
        self.for_each(|s| {
            if s.table == table {
                if s.column == removed {
                    s.row = None;
                } else if s.column > removed {
                    s.column -= 1;
                }
            }
        });
    }
}

impl WriteTransaction {
    /// Opens a handle onto the link-list cell at (`table`, `column`,
    /// `row`).
    pub fn linklist(&mut self, table: u64, column: u64, row: u64) -> Result<LinkList> {
        let spec = self.column_spec(table, column)?;
        if spec.kind != ColumnKind::LinkList {
            return Err(LogicError::TypeMismatch.into());
        }
        if row >= self.row_count(table)? {
            return Err(LogicError::IndexOutOfRange.into());
        }
        let state = Rc::new(RefCell::new(ListState {
            table,
            column,
            row: Some(row),
        }));
        self.registry.register(&state);
        Ok(LinkList { state })
    }

    fn resolve(&self, list: &LinkList) -> Result<(u64, u64, u64)> {
        let state = list.state.borrow();
        match state.row {
            Some(row) => Ok((state.table, state.column, row)),
            None => Err(LogicError::DetachedAccessor.into()),
        }
    }

    /// Number of targets in the list.
    pub fn linklist_len(&self, list: &LinkList) -> Result<u64> {
        let (table, column, row) = self.resolve(list)?;
        Ok(self.link_targets(table, column, row)?.len() as u64)
    }

    /// Target row at `index`.
    pub fn linklist_get(&self, list: &LinkList, index: u64) -> Result<u64> {
        let (table, column, row) = self.resolve(list)?;
        let targets = self.link_targets(table, column, row)?;
        targets
            .get(index as usize)
            .copied()
            .ok_or_else(|| LogicError::IndexOutOfRange.into())
    }

    /// All targets, in list order.
    pub fn linklist_targets(&self, list: &LinkList) -> Result<Vec<u64>> {
        let (table, column, row) = self.resolve(list)?;
        self.link_targets(table, column, row)
    }

    /// Inserts `target` before `index`.
    pub fn linklist_insert(&mut self, list: &LinkList, index: u64, target: u64) -> Result<()> {
        let (table, column, row) = self.resolve(list)?;
        self.list_insert_internal(table, column, row, index, target)?;
        self.record(LogOp::ListInsert {
            table,
            column,
            row,
            index,
            target,
        });
        Ok(())
    }

    /// Appends `target`.
    pub fn linklist_push(&mut self, list: &LinkList, target: u64) -> Result<()> {
        let (table, column, row) = self.resolve(list)?;
        let index = self.link_targets(table, column, row)?.len() as u64;
        self.list_insert_internal(table, column, row, index, target)?;
        self.record(LogOp::ListInsert {
            table,
            column,
            row,
            index,
            target,
        });
        Ok(())
    }

    /// Removes the entry at `index`; the target row itself is untouched.
    pub fn linklist_erase(&mut self, list: &LinkList, index: u64) -> Result<()> {
        let (table, column, row) = self.resolve(list)?;
        self.list_erase_internal(table, column, row, index)?;
        self.record(LogOp::ListErase {
            table,
            column,
            row,
            index,
        });
        Ok(())
    }

    /// Removes every entry.
    pub fn linklist_clear(&mut self, list: &LinkList) -> Result<()> {
        let (table, column, row) = self.resolve(list)?;
        self.list_clear_internal(table, column, row)?;
        self.record(LogOp::ListClear { table, column, row });
        Ok(())
    }
}

// Cell-level internals, shared with row deletion and log replay.
impl WriteTransaction {
    fn list_cell(&self, table: u64, column: u64, row: u64) -> Result<Ref> {
        let root = self.column_root(table, column)?;
        TreeView::new(&self.arena, RefCodec, root).get(row)
    }

    fn set_list_cell(&mut self, table: u64, column: u64, row: u64, cell: Ref) -> Result<()> {
        let root = self.column_root(table, column)?;
        let mut tree = Tree::new(&mut self.arena, RefCodec, root);
        tree.set(row, cell)?;
        let root = tree.root();
        self.set_column_root(table, column, root)
    }

    pub(crate) fn list_insert_internal(
        &mut self,
        table: u64,
        column: u64,
        row: u64,
        index: u64,
        target: u64,
    ) -> Result<()> {
        let spec = self.column_spec(table, column)?;
        if spec.kind != ColumnKind::LinkList {
            return Err(LogicError::TypeMismatch.into());
        }
        if target >= self.row_count(spec.linked_table)? {
            return Err(LogicError::IndexOutOfRange.into());
        }
        let cell = self.list_cell(table, column, row)?;
        let cell = if cell.is_null() {
            Tree::create_empty(&mut self.arena, &IntCodec::default())?
        } else {
            cell
        };
        let mut sub = Tree::new(&mut self.arena, IntCodec::default(), cell);
        sub.insert(index, target as i64)?;
        let cell = sub.root();
        self.set_list_cell(table, column, row, cell)?;
        self.backlink_add(spec.linked_table, spec.linked_column, target, row)
    }

    pub(crate) fn list_erase_internal(
        &mut self,
        table: u64,
        column: u64,
        row: u64,
        index: u64,
    ) -> Result<()> {
        let spec = self.column_spec(table, column)?;
        if spec.kind != ColumnKind::LinkList {
            return Err(LogicError::TypeMismatch.into());
        }
        let cell = self.list_cell(table, column, row)?;
        if cell.is_null() {
            return Err(LogicError::IndexOutOfRange.into());
        }
        let mut sub = Tree::new(&mut self.arena, IntCodec::default(), cell);
        let target = sub.get(index)? as u64;
        sub.erase(index)?;
        let cell = sub.root();
        self.set_list_cell(table, column, row, cell)?;
        self.backlink_remove(spec.linked_table, spec.linked_column, target, row)
    }

    pub(crate) fn list_clear_internal(&mut self, table: u64, column: u64, row: u64) -> Result<()> {
        let spec = self.column_spec(table, column)?;
        let cell = self.list_cell(table, column, row)?;
        if cell.is_null() {
            return Ok(());
        }
        let targets = TreeView::new(&self.arena, IntCodec::default(), cell).to_vec()?;
        for target in targets {
            self.backlink_remove(spec.linked_table, spec.linked_column, target as u64, row)?;
        }
        self.free_ref_cell(table, column, row)
    }

    /// Removes every occurrence of `target` from the list at (`table`,
    /// `column`, `row`), with backlink pairing.
    pub(crate) fn list_remove_target(
        &mut self,
        table: u64,
        column: u64,
        row: u64,
        target: u64,
    ) -> Result<()> {
        loop {
            let cell = self.list_cell(table, column, row)?;
            if cell.is_null() {
                return Ok(());
            }
            let found =
                TreeView::new(&self.arena, IntCodec::default(), cell).find_first(&(target as i64))?;
            match found {
                Some(index) => self.list_erase_internal(table, column, row, index)?,
                None => return Ok(()),
            }
        }
    }

    /// Rewrites every occurrence of `old` in the list to `new`, without
    /// touching backlinks: the target's sub-array moves with its row, so
    /// the pairing is already correct.
    pub(crate) fn list_replace_target(
        &mut self,
        table: u64,
        column: u64,
        row: u64,
        old: u64,
        new: u64,
    ) -> Result<()> {
        let cell = self.list_cell(table, column, row)?;
        if cell.is_null() {
            return Ok(());
        }
        let targets = TreeView::new(&self.arena, IntCodec::default(), cell).to_vec()?;
        let mut sub_root = cell;
        for (i, t) in targets.into_iter().enumerate() {
            if t as u64 == old {
                let mut sub = Tree::new(&mut self.arena, IntCodec::default(), sub_root);
                sub.set(i as u64, new as i64)?;
                sub_root = sub.root();
            }
        }
        if sub_root != cell {
            self.set_list_cell(table, column, row, sub_root)?;
        }
        Ok(())
    }
}
