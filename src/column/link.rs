//! Forward link cells and the backlink bookkeeping behind them.
//!
//! Every link or link-list column has a hidden backlink column in its
//! target table; a backlink cell holds a sub-array of the source rows
//! currently referencing that row. All link writes go through this module
//! so the two directions never drift apart.

use std::collections::BTreeSet;

use tracing::debug;

use crate::arena::Ref;
use crate::column::{decode_link_cell, encode_link_cell, ColumnKind};
use crate::error::{LogicError, Result, StrataError};
use crate::group::ReadAccess;
use crate::replog::LogOp;
use crate::tree::{IntCodec, RefCodec, Tree, TreeView};
use crate::txn::WriteTransaction;

impl WriteTransaction {
    /// Points a link cell at `target`, or nulls it. Old and new targets'
    /// backlink sub-arrays are updated in the same step.
    pub fn set_link(
        &mut self,
        table: u64,
        column: u64,
        row: u64,
        target: Option<u64>,
    ) -> Result<()> {
        let spec = self.column_spec(table, column)?;
        if spec.kind != ColumnKind::Link {
            return Err(LogicError::TypeMismatch.into());
        }
        if row >= self.row_count(table)? {
            return Err(LogicError::IndexOutOfRange.into());
        }
        if let Some(t) = target {
            if t >= self.row_count(spec.linked_table)? {
                return Err(LogicError::IndexOutOfRange.into());
            }
        }
        self.link_write(table, column, row, target)?;
        self.record(LogOp::SetLink {
            table,
            column,
            row,
            target,
        });
        Ok(())
    }

    /// Nulls a link cell.
    pub fn nullify_link(&mut self, table: u64, column: u64, row: u64) -> Result<()> {
        self.set_link(table, column, row, None)
    }

    /// Inserts a new row before `row` and points its link cell at `target`
    /// in one step, so no intermediate state with an unlinked row is ever
    /// observable. `target` is a row index after the insertion; for a
    /// self-referencing table that means indices at or above `row` name the
    /// shifted positions. All validation happens before the row is added.
    pub fn insert_link(&mut self, table: u64, column: u64, row: u64, target: u64) -> Result<()> {
        let spec = self.column_spec(table, column)?;
        if spec.kind != ColumnKind::Link {
            return Err(LogicError::TypeMismatch.into());
        }
        if row > self.row_count(table)? {
            return Err(LogicError::IndexOutOfRange.into());
        }
        let targets =
            self.row_count(spec.linked_table)? + u64::from(spec.linked_table == table);
        if target >= targets {
            return Err(LogicError::IndexOutOfRange.into());
        }
        self.insert_row_internal(table, row)?;
        self.link_write(table, column, row, Some(target))?;
        self.record(LogOp::InsertRow { table, row });
        self.record(LogOp::SetLink {
            table,
            column,
            row,
            target: Some(target),
        });
        Ok(())
    }

    /// Unvalidated link write with full backlink pairing; shared by the
    /// public setter, row deletion, and log replay internals.
    pub(crate) fn link_write(
        &mut self,
        table: u64,
        column: u64,
        row: u64,
        target: Option<u64>,
    ) -> Result<()> {
        let spec = self.column_spec(table, column)?;
        let root = self.column_root(table, column)?;
        let old = decode_link_cell(TreeView::new(&self.arena, IntCodec::default(), root).get(row)?)?;
        if old == target {
            return Ok(());
        }
        if let Some(o) = old {
            self.backlink_remove(spec.linked_table, spec.linked_column, o, row)?;
        }
        self.set_int_cell(table, column, row, encode_link_cell(target))?;
        if let Some(t) = target {
            self.backlink_add(spec.linked_table, spec.linked_column, t, row)?;
        }
        Ok(())
    }

    /// Appends `source` to the backlink sub-array of `row`.
    pub(crate) fn backlink_add(
        &mut self,
        table: u64,
        backlink_column: u64,
        row: u64,
        source: u64,
    ) -> Result<()> {
        let root = self.column_root(table, backlink_column)?;
        let cell = TreeView::new(&self.arena, RefCodec, root).get(row)?;
        let cell_was_null = cell.is_null();
        let cell = if cell_was_null {
            Tree::create_empty(&mut self.arena, &IntCodec::default())?
        } else {
            cell
        };
        let mut sub = Tree::new(&mut self.arena, IntCodec::default(), cell);
        sub.push(source as i64)?;
        let new_cell = sub.root();
        if cell_was_null || new_cell != cell {
            let mut tree = Tree::new(&mut self.arena, RefCodec, root);
            tree.set(row, new_cell)?;
            let root = tree.root();
            self.set_column_root(table, backlink_column, root)?;
        }
        Ok(())
    }

    /// Removes one occurrence of `source` from the backlink sub-array of
    /// `row`. A missing entry means the two directions have drifted, which
    /// is reported as corruption.
    pub(crate) fn backlink_remove(
        &mut self,
        table: u64,
        backlink_column: u64,
        row: u64,
        source: u64,
    ) -> Result<()> {
        let root = self.column_root(table, backlink_column)?;
        let cell = TreeView::new(&self.arena, RefCodec, root).get(row)?;
        if cell.is_null() {
            return Err(StrataError::Corruption("backlink entry missing"));
        }
        let mut sub = Tree::new(&mut self.arena, IntCodec::default(), cell);
        let index = sub
            .find_first(&(source as i64))?
            .ok_or(StrataError::Corruption("backlink entry missing"))?;
        sub.erase(index)?;
        let new_cell = sub.root();
        if new_cell != cell {
            let mut tree = Tree::new(&mut self.arena, RefCodec, root);
            tree.set(row, new_cell)?;
            let root = tree.root();
            self.set_column_root(table, backlink_column, root)?;
        }
        Ok(())
    }

    /// Rewrites one backlink entry of `row` from `old_source` to
    /// `new_source`, after a move-last-over relocated the source row.
    pub(crate) fn backlink_replace_source(
        &mut self,
        table: u64,
        backlink_column: u64,
        row: u64,
        old_source: u64,
        new_source: u64,
    ) -> Result<()> {
        let root = self.column_root(table, backlink_column)?;
        let cell = TreeView::new(&self.arena, RefCodec, root).get(row)?;
        if cell.is_null() {
            return Err(StrataError::Corruption("backlink entry missing"));
        }
        let mut sub = Tree::new(&mut self.arena, IntCodec::default(), cell);
        let index = sub
            .find_first(&(old_source as i64))?
            .ok_or(StrataError::Corruption("backlink entry missing"))?;
        sub.set(index, new_source as i64)?;
        let new_cell = sub.root();
        if new_cell != cell {
            let mut tree = Tree::new(&mut self.arena, RefCodec, root);
            tree.set(row, new_cell)?;
            let root = tree.root();
            self.set_column_root(table, backlink_column, root)?;
        }
        Ok(())
    }

    /// Source rows recorded in the backlink sub-array of `row`.
    pub(crate) fn backlink_sources(
        &self,
        table: u64,
        backlink_column: u64,
        row: u64,
    ) -> Result<Vec<u64>> {
        let root = self.column_root(table, backlink_column)?;
        let cell = TreeView::new(&self.arena, RefCodec, root).get(row)?;
        if cell.is_null() {
            return Ok(Vec::new());
        }
        let values = TreeView::new(&self.arena, IntCodec::default(), cell).to_vec()?;
        Ok(values.into_iter().map(|v| v as u64).collect())
    }

    /// Number of strong references currently held against `row`: the total
    /// length of its backlink sub-arrays whose origin column is strong.
    fn strong_referrers(&self, table: u64, row: u64) -> Result<u64> {
        let mut total = 0;
        for c in 0..self.column_count(table)? {
            let spec = self.column_spec(table, c)?;
            if spec.kind != ColumnKind::Backlink {
                continue;
            }
            let origin = self.column_spec(spec.linked_table, spec.linked_column)?;
            if origin.strong {
                total += self.backlink_sources(table, c, row)?.len() as u64;
            }
        }
        Ok(total)
    }

    /// Rows of `table`'s link targets that `row` currently holds strong
    /// links to, deduplicated.
    fn strong_targets(&self, table: u64, row: u64) -> Result<BTreeSet<(u64, u64)>> {
        let mut targets = BTreeSet::new();
        for c in 0..self.column_count(table)? {
            let spec = self.column_spec(table, c)?;
            if !spec.strong {
                continue;
            }
            match spec.kind {
                ColumnKind::Link => {
                    let root = self.column_root(table, c)?;
                    let cell =
                        TreeView::new(&self.arena, IntCodec::default(), root).get(row)?;
                    if let Some(t) = decode_link_cell(cell)? {
                        targets.insert((spec.linked_table, t));
                    }
                }
                ColumnKind::LinkList => {
                    for t in self.link_targets(table, c, row)? {
                        targets.insert((spec.linked_table, t));
                    }
                }
                _ => {}
            }
        }
        Ok(targets)
    }

    /// Removes `row` and then every row that held its last strong reference
    /// through the removed rows, transitively. Rows in a strong reference
    /// cycle keep each other alive and are not collected here.
    pub fn cascade_remove_row(&mut self, table: u64, row: u64) -> Result<()> {
        if row >= self.row_count(table)? {
            return Err(LogicError::IndexOutOfRange.into());
        }
        self.record(LogOp::CascadeRemoveRow { table, row });
        let mut pending: BTreeSet<(u64, u64)> = BTreeSet::new();
        pending.insert((table, row));
        while let Some(&(t, r)) = pending.iter().next() {
            pending.remove(&(t, r));
            let targets = self.strong_targets(t, r)?;
            // Break the victim's links first so its strong holds no longer
            // count, then see which targets just lost their last referrer.
            for c in 0..self.column_count(t)? {
                match self.column_spec(t, c)?.kind {
                    ColumnKind::Link => self.link_write(t, c, r, None)?,
                    ColumnKind::LinkList => self.list_clear_internal(t, c, r)?,
                    _ => {}
                }
            }
            for (tt, tr) in targets {
                if (tt, tr) != (t, r) && self.strong_referrers(tt, tr)? == 0 {
                    pending.insert((tt, tr));
                }
            }
            let last = self.row_count(t)? - 1;
            self.remove_row_internal(t, r)?;
            // The former last row of `t` now lives at index `r`.
            if r != last && pending.remove(&(t, last)) {
                pending.insert((t, r));
            }
            debug!(table = t, row = r, "cascade removed row");
        }
        Ok(())
    }
}
