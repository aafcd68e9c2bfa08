//! Top-level table directory and row operations.
//!
//! The whole database hangs off one top ref: a context directory node with
//! two entries, the table-name tree and the table tree. Each table is itself
//! a directory node of three entries: the column metadata tree (integer
//! quads, see [`crate::column::ColumnSpec`]), the column-name tree, and the
//! column-root tree. Every mutation copy-on-writes the touched path and
//! patches the chain of directory refs back up to a new top.
//!
//! Row deletion uses move-last-over: the last row is moved into the freed
//! slot, so deleting changes the logical identity of whatever row used to
//! be last. Link cells referencing the moved row are repointed through the
//! backlink columns, keeping the forward/backlink pairing intact after
//! every operation.

use crate::arena::{Arena, Ref};
use crate::column::{
    decode_double_cell, decode_float_cell, encode_double_cell, encode_float_cell,
    new_column_root, string_repr, widen_string_column, ColumnKind, ColumnSpec, META_INTS,
};
use crate::error::{LogicError, Result, StrataError};
use crate::leaf::refs::encode_ref_leaf;
use crate::leaf::string::StrRepr;
use crate::node::{self, NodeKind};
use crate::replog::LogOp;
use crate::tree::{IntCodec, RefCodec, StrCodec, Tree, TreeView};
use crate::txn::WriteTransaction;

pub(crate) const TOP_NAMES: usize = 0;
pub(crate) const TOP_TABLES: usize = 1;

pub(crate) const TBL_META: usize = 0;
pub(crate) const TBL_NAMES: usize = 1;
pub(crate) const TBL_COLUMNS: usize = 2;

/// Table and column names share one representation; a name longer than the
/// medium string bound is rejected as caller misuse.
pub(crate) fn name_codec() -> StrCodec {
    StrCodec {
        repr: StrRepr::Medium,
    }
}

pub(crate) fn meta_codec() -> IntCodec {
    IntCodec { context: true }
}

/// Resolves one slot of a directory node.
pub(crate) fn dir_entry(arena: &Arena, dir: Ref, slot: usize) -> Result<Ref> {
    let (header, payload) = arena.node(dir)?;
    if header.kind != NodeKind::Refs || !header.is_context() {
        return Err(StrataError::Corruption("expected directory node"));
    }
    if slot >= header.size as usize {
        return Err(StrataError::Corruption("directory slot out of range"));
    }
    Ok(Ref::from_raw(node::payload_ref(payload, slot)?))
}

fn tree_len(arena: &Arena, root: Ref) -> Result<u64> {
    TreeView::new(arena, RefCodec, root).size()
}

/// Snapshot reads shared by read and write transactions: everything here
/// resolves refs through the transaction's own arena and never mutates.
pub trait ReadAccess {
    /// Arena translating this snapshot's refs.
    fn arena(&self) -> &Arena;
    /// Top directory ref of this snapshot (null for an empty database).
    fn top(&self) -> Ref;

    /// Number of tables.
    fn table_count(&self) -> Result<u64> {
        if self.top().is_null() {
            return Ok(0);
        }
        tree_len(self.arena(), dir_entry(self.arena(), self.top(), TOP_TABLES)?)
    }

    /// Directory node ref of `table`.
    #[doc(hidden)]
    fn table_node(&self, table: u64) -> Result<Ref> {
        if self.top().is_null() || table >= self.table_count()? {
            return Err(LogicError::TableOutOfRange.into());
        }
        let tables = dir_entry(self.arena(), self.top(), TOP_TABLES)?;
        TreeView::new(self.arena(), RefCodec, tables).get(table)
    }

    /// Name of `table`.
    fn table_name(&self, table: u64) -> Result<String> {
        if self.top().is_null() || table >= self.table_count()? {
            return Err(LogicError::TableOutOfRange.into());
        }
        let names = dir_entry(self.arena(), self.top(), TOP_NAMES)?;
        let bytes = TreeView::new(self.arena(), name_codec(), names).get(table)?;
        String::from_utf8(bytes).map_err(|_| StrataError::Corruption("table name not utf-8"))
    }

    /// Index of the table named `name`.
    fn find_table(&self, name: &str) -> Result<Option<u64>> {
        if self.top().is_null() {
            return Ok(None);
        }
        let names = dir_entry(self.arena(), self.top(), TOP_NAMES)?;
        TreeView::new(self.arena(), name_codec(), names).find_first(&name.as_bytes().to_vec())
    }

    /// Number of columns in `table`.
    fn column_count(&self, table: u64) -> Result<u64> {
        let node = self.table_node(table)?;
        let meta = dir_entry(self.arena(), node, TBL_META)?;
        Ok(tree_len(self.arena(), meta)? / META_INTS)
    }

    /// Name of a column.
    fn column_name(&self, table: u64, column: u64) -> Result<String> {
        if column >= self.column_count(table)? {
            return Err(LogicError::ColumnOutOfRange.into());
        }
        let node = self.table_node(table)?;
        let names = dir_entry(self.arena(), node, TBL_NAMES)?;
        let bytes = TreeView::new(self.arena(), name_codec(), names).get(column)?;
        String::from_utf8(bytes).map_err(|_| StrataError::Corruption("column name not utf-8"))
    }

    /// Index of the column named `name` in `table`.
    fn find_column(&self, table: u64, name: &str) -> Result<Option<u64>> {
        let node = self.table_node(table)?;
        let names = dir_entry(self.arena(), node, TBL_NAMES)?;
        TreeView::new(self.arena(), name_codec(), names).find_first(&name.as_bytes().to_vec())
    }

    /// Metadata of a column.
    fn column_spec(&self, table: u64, column: u64) -> Result<ColumnSpec> {
        if column >= self.column_count(table)? {
            return Err(LogicError::ColumnOutOfRange.into());
        }
        let node = self.table_node(table)?;
        let meta = dir_entry(self.arena(), node, TBL_META)?;
        let view = TreeView::new(self.arena(), meta_codec(), meta);
        let mut quad = [0i64; META_INTS as usize];
        for (i, slot) in quad.iter_mut().enumerate() {
            *slot = view.get(column * META_INTS + i as u64)?;
        }
        ColumnSpec::from_meta(&quad)
    }

    /// Root ref of a column's tree.
    #[doc(hidden)]
    fn column_root(&self, table: u64, column: u64) -> Result<Ref> {
        if column >= self.column_count(table)? {
            return Err(LogicError::ColumnOutOfRange.into());
        }
        let node = self.table_node(table)?;
        let columns = dir_entry(self.arena(), node, TBL_COLUMNS)?;
        TreeView::new(self.arena(), RefCodec, columns).get(column)
    }

    /// Number of rows in `table` (0 for a table without columns).
    fn row_count(&self, table: u64) -> Result<u64> {
        if self.column_count(table)? == 0 {
            return Ok(0);
        }
        tree_len(self.arena(), self.column_root(table, 0)?)
    }

    /// Integer cell.
    fn get_int(&self, table: u64, column: u64, row: u64) -> Result<i64> {
        let spec = self.column_spec(table, column)?;
        if spec.kind != ColumnKind::Int {
            return Err(LogicError::TypeMismatch.into());
        }
        let root = self.column_root(table, column)?;
        TreeView::new(self.arena(), IntCodec::default(), root).get(row)
    }

    /// Float cell.
    fn get_float(&self, table: u64, column: u64, row: u64) -> Result<f32> {
        let spec = self.column_spec(table, column)?;
        if spec.kind != ColumnKind::Float {
            return Err(LogicError::TypeMismatch.into());
        }
        let root = self.column_root(table, column)?;
        let cell = TreeView::new(self.arena(), IntCodec::default(), root).get(row)?;
        Ok(decode_float_cell(cell))
    }

    /// Double cell.
    fn get_double(&self, table: u64, column: u64, row: u64) -> Result<f64> {
        let spec = self.column_spec(table, column)?;
        if spec.kind != ColumnKind::Double {
            return Err(LogicError::TypeMismatch.into());
        }
        let root = self.column_root(table, column)?;
        let cell = TreeView::new(self.arena(), IntCodec::default(), root).get(row)?;
        Ok(decode_double_cell(cell))
    }

    /// String cell.
    fn get_string(&self, table: u64, column: u64, row: u64) -> Result<String> {
        let spec = self.column_spec(table, column)?;
        if spec.kind != ColumnKind::String {
            return Err(LogicError::TypeMismatch.into());
        }
        let root = self.column_root(table, column)?;
        let repr = string_repr(self.arena(), root)?;
        let bytes = TreeView::new(self.arena(), StrCodec { repr }, root).get(row)?;
        String::from_utf8(bytes).map_err(|_| StrataError::Corruption("string cell not utf-8"))
    }

    /// Binary cell.
    fn get_bytes(&self, table: u64, column: u64, row: u64) -> Result<Vec<u8>> {
        let spec = self.column_spec(table, column)?;
        if spec.kind != ColumnKind::Binary {
            return Err(LogicError::TypeMismatch.into());
        }
        let root = self.column_root(table, column)?;
        let repr = string_repr(self.arena(), root)?;
        TreeView::new(self.arena(), StrCodec { repr }, root).get(row)
    }

    /// Forward link target, `None` when null.
    fn get_link(&self, table: u64, column: u64, row: u64) -> Result<Option<u64>> {
        let spec = self.column_spec(table, column)?;
        if spec.kind != ColumnKind::Link {
            return Err(LogicError::TypeMismatch.into());
        }
        let root = self.column_root(table, column)?;
        let cell = TreeView::new(self.arena(), IntCodec::default(), root).get(row)?;
        crate::column::decode_link_cell(cell)
    }

    /// Targets of a link-list cell, in order.
    fn link_targets(&self, table: u64, column: u64, row: u64) -> Result<Vec<u64>> {
        let spec = self.column_spec(table, column)?;
        if spec.kind != ColumnKind::LinkList {
            return Err(LogicError::TypeMismatch.into());
        }
        let root = self.column_root(table, column)?;
        let cell = TreeView::new(self.arena(), RefCodec, root).get(row)?;
        if cell.is_null() {
            return Ok(Vec::new());
        }
        let values = TreeView::new(self.arena(), IntCodec::default(), cell).to_vec()?;
        Ok(values.into_iter().map(|v| v as u64).collect())
    }

    /// Rows of `origin_table` whose column `origin_column` references
    /// `row` of `table`, read from the backlink column.
    fn backlinks(
        &self,
        table: u64,
        row: u64,
        origin_table: u64,
        origin_column: u64,
    ) -> Result<Vec<u64>> {
        let origin = self.column_spec(origin_table, origin_column)?;
        if !origin.kind.is_link_kind() || origin.linked_table != table {
            return Err(LogicError::CrossTableLink.into());
        }
        let root = self.column_root(table, origin.linked_column)?;
        let cell = TreeView::new(self.arena(), RefCodec, root).get(row)?;
        if cell.is_null() {
            return Ok(Vec::new());
        }
        let values = TreeView::new(self.arena(), IntCodec::default(), cell).to_vec()?;
        Ok(values.into_iter().map(|v| v as u64).collect())
    }

    /// Number of backlinks for `row` under one origin column.
    fn backlink_count(
        &self,
        table: u64,
        row: u64,
        origin_table: u64,
        origin_column: u64,
    ) -> Result<u64> {
        Ok(self.backlinks(table, row, origin_table, origin_column)?.len() as u64)
    }

    /// First row of an integer column equal to `value`.
    fn find_first_int(&self, table: u64, column: u64, value: i64) -> Result<Option<u64>> {
        let spec = self.column_spec(table, column)?;
        if spec.kind != ColumnKind::Int {
            return Err(LogicError::TypeMismatch.into());
        }
        let root = self.column_root(table, column)?;
        TreeView::new(self.arena(), IntCodec::default(), root).find_first(&value)
    }

    /// Number of rows of an integer column equal to `value`.
    fn count_int(&self, table: u64, column: u64, value: i64) -> Result<u64> {
        let spec = self.column_spec(table, column)?;
        if spec.kind != ColumnKind::Int {
            return Err(LogicError::TypeMismatch.into());
        }
        let root = self.column_root(table, column)?;
        let values = TreeView::new(self.arena(), IntCodec::default(), root).to_vec()?;
        Ok(values.into_iter().filter(|v| *v == value).count() as u64)
    }

    /// First row of a string column equal to `value`.
    fn find_first_string(&self, table: u64, column: u64, value: &str) -> Result<Option<u64>> {
        let spec = self.column_spec(table, column)?;
        if spec.kind != ColumnKind::String {
            return Err(LogicError::TypeMismatch.into());
        }
        let root = self.column_root(table, column)?;
        let repr = string_repr(self.arena(), root)?;
        TreeView::new(self.arena(), StrCodec { repr }, root)
            .find_first(&value.as_bytes().to_vec())
    }
}

// Directory plumbing: every mutation ends by patching the chain of
// directory refs back up to a new top.
impl WriteTransaction {
    pub(crate) fn ensure_top(&mut self) -> Result<()> {
        if self.top.is_null() {
            let names = Tree::create_empty(&mut self.arena, &name_codec())?;
            let tables = Tree::create_empty(&mut self.arena, &RefCodec)?;
            self.top = self.arena.store(encode_ref_leaf(&[names, tables], true))?;
        }
        Ok(())
    }

    fn patch_directory(&mut self, dir: Ref, slot: usize, value: Ref) -> Result<Ref> {
        let mut bytes = self.arena.node_bytes(dir)?.to_vec();
        node::patch_ref(&mut bytes, slot, value.raw())?;
        let target = self.arena.cow(dir)?;
        self.arena.replace(target, bytes)?;
        Ok(target)
    }

    fn set_top_entry(&mut self, slot: usize, value: Ref) -> Result<()> {
        self.top = self.patch_directory(self.top, slot, value)?;
        Ok(())
    }

    fn set_table_node(&mut self, table: u64, dir: Ref) -> Result<()> {
        let tables = dir_entry(&self.arena, self.top, TOP_TABLES)?;
        let mut tree = Tree::new(&mut self.arena, RefCodec, tables);
        tree.set(table, dir)?;
        let tables = tree.root();
        self.set_top_entry(TOP_TABLES, tables)
    }

    fn set_table_entry(&mut self, table: u64, slot: usize, value: Ref) -> Result<()> {
        let dir = self.table_node(table)?;
        let dir = self.patch_directory(dir, slot, value)?;
        self.set_table_node(table, dir)
    }

    pub(crate) fn set_column_root(&mut self, table: u64, column: u64, root: Ref) -> Result<()> {
        let dir = self.table_node(table)?;
        let columns = dir_entry(&self.arena, dir, TBL_COLUMNS)?;
        let mut tree = Tree::new(&mut self.arena, RefCodec, columns);
        tree.set(column, root)?;
        let columns = tree.root();
        self.set_table_entry(table, TBL_COLUMNS, columns)
    }
}

// Schema operations.
impl WriteTransaction {
    /// Appends a new, empty table and returns its index.
    pub fn add_table(&mut self, name: &str) -> Result<u64> {
        self.ensure_top()?;
        let names = dir_entry(&self.arena, self.top, TOP_NAMES)?;
        let mut tree = Tree::new(&mut self.arena, name_codec(), names);
        tree.push(name.as_bytes().to_vec())?;
        let names = tree.root();
        self.set_top_entry(TOP_NAMES, names)?;

        let meta = Tree::create_empty(&mut self.arena, &meta_codec())?;
        let col_names = Tree::create_empty(&mut self.arena, &name_codec())?;
        let columns = Tree::create_empty(&mut self.arena, &RefCodec)?;
        let dir = self
            .arena
            .store(encode_ref_leaf(&[meta, col_names, columns], true))?;

        let tables = dir_entry(&self.arena, self.top, TOP_TABLES)?;
        let mut tree = Tree::new(&mut self.arena, RefCodec, tables);
        tree.push(dir)?;
        let tables = tree.root();
        self.set_top_entry(TOP_TABLES, tables)?;

        let index = self.table_count()? - 1;
        self.record(LogOp::AddTable { name: name.into() });
        Ok(index)
    }

    /// Removes a table. Fails with a cross-table-link error while any other
    /// table still holds a link column targeting it; the table's own link
    /// columns (and the backlink columns they maintain elsewhere) are torn
    /// down, and table indices above the removed one shift down.
    pub fn remove_table(&mut self, table: u64) -> Result<()> {
        let count = self.table_count()?;
        if table >= count {
            return Err(LogicError::TableOutOfRange.into());
        }
        for t in 0..count {
            if t == table {
                continue;
            }
            for c in 0..self.column_count(t)? {
                let spec = self.column_spec(t, c)?;
                if spec.kind.is_link_kind() && spec.linked_table == table {
                    return Err(LogicError::CrossTableLink.into());
                }
            }
        }

        // Break every link the table holds, then drop the backlink columns
        // it maintains in other tables.
        self.clear_table_rows(table)?;
        loop {
            let mut torn_down = false;
            for c in 0..self.column_count(table)? {
                let spec = self.column_spec(table, c)?;
                if spec.kind.is_link_kind() && spec.linked_table != table {
                    self.remove_column_internal(spec.linked_table, spec.linked_column)?;
                    self.remove_column_internal(table, c)?;
                    torn_down = true;
                    break;
                }
            }
            if !torn_down {
                break;
            }
        }

        let dir = self.table_node(table)?;
        self.arena.free_deep(dir)?;
        let names = dir_entry(&self.arena, self.top, TOP_NAMES)?;
        let mut tree = Tree::new(&mut self.arena, name_codec(), names);
        tree.erase(table)?;
        let names = tree.root();
        self.set_top_entry(TOP_NAMES, names)?;
        let tables = dir_entry(&self.arena, self.top, TOP_TABLES)?;
        let mut tree = Tree::new(&mut self.arena, RefCodec, tables);
        tree.erase(table)?;
        let tables = tree.root();
        self.set_top_entry(TOP_TABLES, tables)?;

        // Table indices above the removed one shift down by one.
        for t in 0..self.table_count()? {
            self.rewrite_specs(t, |spec| {
                if (spec.kind.is_link_kind() || spec.kind == ColumnKind::Backlink)
                    && spec.linked_table > table
                {
                    spec.linked_table -= 1;
                    true
                } else {
                    false
                }
            })?;
        }
        self.registry.detach_table(table);
        self.registry.shift_tables(table);
        self.record(LogOp::RemoveTable { table });
        Ok(())
    }

    /// Appends a plain data column (integer, string, or binary), filling
    /// existing rows with the default value.
    pub fn add_column(&mut self, table: u64, name: &str, kind: ColumnKind) -> Result<u64> {
        if kind.is_link_kind() || kind == ColumnKind::Backlink {
            return Err(LogicError::TypeMismatch.into());
        }
        let index = self.append_column(table, name, ColumnSpec::plain(kind))?;
        self.record(LogOp::AddColumn {
            table,
            name: name.into(),
            kind,
            target_table: 0,
            strong: false,
        });
        Ok(index)
    }

    /// Appends a link or link-list column targeting `target_table`, along
    /// with the backlink column it maintains there.
    pub fn add_link_column(
        &mut self,
        table: u64,
        name: &str,
        kind: ColumnKind,
        target_table: u64,
        strong: bool,
    ) -> Result<u64> {
        if !kind.is_link_kind() {
            return Err(LogicError::TypeMismatch.into());
        }
        if target_table >= self.table_count()? {
            return Err(LogicError::TableOutOfRange.into());
        }
        let forward = self.append_column(
            table,
            name,
            ColumnSpec {
                kind,
                linked_table: target_table,
                linked_column: 0,
                strong,
            },
        )?;
        let backlink_name = format!("!backlinks_{}_{}", table, forward);
        let backlink = self.append_column(
            target_table,
            &backlink_name,
            ColumnSpec {
                kind: ColumnKind::Backlink,
                linked_table: table,
                linked_column: forward,
                strong: false,
            },
        )?;
        // Now that the backlink column's index is known, complete the pair.
        self.set_spec_quad(table, forward, |spec| spec.linked_column = backlink)?;
        self.record(LogOp::AddColumn {
            table,
            name: name.into(),
            kind,
            target_table,
            strong,
        });
        Ok(forward)
    }

    fn append_column(&mut self, table: u64, name: &str, spec: ColumnSpec) -> Result<u64> {
        let rows = self.row_count(table)?;
        let index = self.column_count(table)?;
        let dir = self.table_node(table)?;

        let names = dir_entry(&self.arena, dir, TBL_NAMES)?;
        let mut tree = Tree::new(&mut self.arena, name_codec(), names);
        tree.push(name.as_bytes().to_vec())?;
        let names = tree.root();
        self.set_table_entry(table, TBL_NAMES, names)?;

        let dir = self.table_node(table)?;
        let meta = dir_entry(&self.arena, dir, TBL_META)?;
        let mut tree = Tree::new(&mut self.arena, meta_codec(), meta);
        for value in spec.to_meta() {
            tree.push(value)?;
        }
        let meta = tree.root();
        self.set_table_entry(table, TBL_META, meta)?;

        let root = new_column_root(&mut self.arena, spec.kind)?;
        let root = match spec.kind {
            ColumnKind::Int | ColumnKind::Link | ColumnKind::Float | ColumnKind::Double => {
                let mut tree = Tree::new(&mut self.arena, IntCodec::default(), root);
                for _ in 0..rows {
                    tree.push(0)?;
                }
                tree.root()
            }
            ColumnKind::String | ColumnKind::Binary => {
                let repr = string_repr(&self.arena, root)?;
                let mut tree = Tree::new(&mut self.arena, StrCodec { repr }, root);
                for _ in 0..rows {
                    tree.push(Vec::new())?;
                }
                tree.root()
            }
            ColumnKind::LinkList | ColumnKind::Backlink => {
                let mut tree = Tree::new(&mut self.arena, RefCodec, root);
                for _ in 0..rows {
                    tree.push(Ref::null())?;
                }
                tree.root()
            }
        };

        let dir = self.table_node(table)?;
        let columns = dir_entry(&self.arena, dir, TBL_COLUMNS)?;
        let mut tree = Tree::new(&mut self.arena, RefCodec, columns);
        tree.push(root)?;
        let columns = tree.root();
        self.set_table_entry(table, TBL_COLUMNS, columns)?;
        Ok(index)
    }

    /// Removes one column, freeing its tree and shifting the column indices
    /// recorded by link/backlink specs that point past it.
    fn remove_column_internal(&mut self, table: u64, column: u64) -> Result<()> {
        let root = self.column_root(table, column)?;
        self.free_ref_column(table, column)?;
        self.arena.free_deep(root)?;

        let dir = self.table_node(table)?;
        let names = dir_entry(&self.arena, dir, TBL_NAMES)?;
        let mut tree = Tree::new(&mut self.arena, name_codec(), names);
        tree.erase(column)?;
        let names = tree.root();
        self.set_table_entry(table, TBL_NAMES, names)?;

        let dir = self.table_node(table)?;
        let meta = dir_entry(&self.arena, dir, TBL_META)?;
        let mut tree = Tree::new(&mut self.arena, meta_codec(), meta);
        for _ in 0..META_INTS {
            tree.erase(column * META_INTS)?;
        }
        let meta = tree.root();
        self.set_table_entry(table, TBL_META, meta)?;

        let dir = self.table_node(table)?;
        let columns = dir_entry(&self.arena, dir, TBL_COLUMNS)?;
        let mut tree = Tree::new(&mut self.arena, RefCodec, columns);
        tree.erase(column)?;
        let columns = tree.root();
        self.set_table_entry(table, TBL_COLUMNS, columns)?;

        for t in 0..self.table_count()? {
            self.rewrite_specs(t, |spec| {
                if (spec.kind.is_link_kind() || spec.kind == ColumnKind::Backlink)
                    && spec.linked_table == table
                    && spec.linked_column > column
                {
                    spec.linked_column -= 1;
                    true
                } else {
                    false
                }
            })?;
        }
        self.registry.shift_columns(table, column);
        Ok(())
    }

    /// Frees the sub-arrays of a ref-valued column before the column itself
    /// is dropped. No-op for scalar columns.
    fn free_ref_column(&mut self, table: u64, column: u64) -> Result<()> {
        let spec = self.column_spec(table, column)?;
        if !matches!(spec.kind, ColumnKind::LinkList | ColumnKind::Backlink) {
            return Ok(());
        }
        let root = self.column_root(table, column)?;
        let cells = TreeView::new(&self.arena, RefCodec, root).to_vec()?;
        for cell in cells {
            self.arena.free_deep(cell)?;
        }
        Ok(())
    }

    fn set_spec_quad<F: FnOnce(&mut ColumnSpec)>(
        &mut self,
        table: u64,
        column: u64,
        patch: F,
    ) -> Result<()> {
        let mut spec = self.column_spec(table, column)?;
        patch(&mut spec);
        let dir = self.table_node(table)?;
        let meta = dir_entry(&self.arena, dir, TBL_META)?;
        let mut tree = Tree::new(&mut self.arena, meta_codec(), meta);
        for (i, value) in spec.to_meta().into_iter().enumerate() {
            tree.set(column * META_INTS + i as u64, value)?;
        }
        let meta = tree.root();
        self.set_table_entry(table, TBL_META, meta)
    }

    /// Applies `patch` to every column spec of `table`, writing back the
    /// quads the closure reports as changed.
    fn rewrite_specs<F: FnMut(&mut ColumnSpec) -> bool>(
        &mut self,
        table: u64,
        mut patch: F,
    ) -> Result<()> {
        for column in 0..self.column_count(table)? {
            let mut spec = self.column_spec(table, column)?;
            if patch(&mut spec) {
                self.set_spec_quad(table, column, |s| *s = spec)?;
            }
        }
        Ok(())
    }
}

// Row operations.
impl WriteTransaction {
    /// Appends an empty row and returns its index.
    pub fn add_row(&mut self, table: u64) -> Result<u64> {
        let row = self.row_count(table)?;
        self.insert_row_internal(table, row)?;
        self.record(LogOp::InsertRow { table, row });
        Ok(row)
    }

    /// Inserts an empty row before `row`; rows at or above it shift up, and
    /// every link cell referencing a shifted row is renumbered.
    pub fn insert_row(&mut self, table: u64, row: u64) -> Result<()> {
        self.insert_row_internal(table, row)?;
        self.record(LogOp::InsertRow { table, row });
        Ok(())
    }

    pub(crate) fn insert_row_internal(&mut self, table: u64, row: u64) -> Result<()> {
        let size = self.row_count(table)?;
        if row > size {
            return Err(LogicError::IndexOutOfRange.into());
        }
        if row < size {
            self.renumber_after_insert(table, row)?;
        }
        for column in 0..self.column_count(table)? {
            let spec = self.column_spec(table, column)?;
            let root = self.column_root(table, column)?;
            let root = match spec.kind {
                ColumnKind::Int | ColumnKind::Link | ColumnKind::Float | ColumnKind::Double => {
                    let mut tree = Tree::new(&mut self.arena, IntCodec::default(), root);
                    tree.insert(row, 0)?;
                    tree.root()
                }
                ColumnKind::String | ColumnKind::Binary => {
                    let repr = string_repr(&self.arena, root)?;
                    let mut tree = Tree::new(&mut self.arena, StrCodec { repr }, root);
                    tree.insert(row, Vec::new())?;
                    tree.root()
                }
                ColumnKind::LinkList | ColumnKind::Backlink => {
                    let mut tree = Tree::new(&mut self.arena, RefCodec, root);
                    tree.insert(row, Ref::null())?;
                    tree.root()
                }
            };
            self.set_column_root(table, column, root)?;
        }
        self.registry.shift_rows(table, row, 1);
        Ok(())
    }

    /// Renumbers every reference to rows of `table` at or above `row`, in
    /// preparation for an insertion there.
    fn renumber_after_insert(&mut self, table: u64, row: u64) -> Result<()> {
        for t in 0..self.table_count()? {
            for c in 0..self.column_count(t)? {
                let spec = self.column_spec(t, c)?;
                if spec.linked_table != table {
                    continue;
                }
                match spec.kind {
                    ColumnKind::Link => {
                        let root = self.column_root(t, c)?;
                        let mut tree = Tree::new(&mut self.arena, IntCodec::default(), root);
                        // Cells store target_row + 1.
                        tree.adjust_ge(row as i64 + 1, 1)?;
                        let root = tree.root();
                        self.set_column_root(t, c, root)?;
                    }
                    ColumnKind::LinkList | ColumnKind::Backlink => {
                        self.adjust_sub_arrays(t, c, row as i64, 1)?;
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Adds `delta` to every sub-array element `>= limit` in a ref-valued
    /// column. Sub-arrays hold raw row indices.
    fn adjust_sub_arrays(&mut self, table: u64, column: u64, limit: i64, delta: i64) -> Result<()> {
        let root = self.column_root(table, column)?;
        let cells = TreeView::new(&self.arena, RefCodec, root).to_vec()?;
        let mut tree_root = root;
        for (i, cell) in cells.into_iter().enumerate() {
            if cell.is_null() {
                continue;
            }
            let mut sub = Tree::new(&mut self.arena, IntCodec::default(), cell);
            sub.adjust_ge(limit, delta)?;
            let new_cell = sub.root();
            if new_cell != cell {
                let mut tree = Tree::new(&mut self.arena, RefCodec, tree_root);
                tree.set(i as u64, new_cell)?;
                tree_root = tree.root();
            }
        }
        if tree_root != root {
            self.set_column_root(table, column, tree_root)?;
        }
        Ok(())
    }

    /// Removes `row` with move-last-over semantics: the last row takes its
    /// place, and link cells referencing the moved row are repointed. The
    /// logical identity of the former last row changes.
    pub fn remove_row(&mut self, table: u64, row: u64) -> Result<()> {
        self.remove_row_internal(table, row)?;
        self.record(LogOp::RemoveRow { table, row });
        Ok(())
    }

    pub(crate) fn remove_row_internal(&mut self, table: u64, row: u64) -> Result<()> {
        let size = self.row_count(table)?;
        if row >= size {
            return Err(LogicError::IndexOutOfRange.into());
        }
        let last = size - 1;
        let columns = self.column_count(table)?;

        // Break the victim's outgoing links.
        for c in 0..columns {
            match self.column_spec(table, c)?.kind {
                ColumnKind::Link => self.link_write(table, c, row, None)?,
                ColumnKind::LinkList => self.list_clear_internal(table, c, row)?,
                _ => {}
            }
        }
        // Break links into the victim, walking its backlink columns.
        for c in 0..columns {
            let spec = self.column_spec(table, c)?;
            if spec.kind != ColumnKind::Backlink {
                continue;
            }
            let sources = self.backlink_sources(table, c, row)?;
            let origin_kind = self.column_spec(spec.linked_table, spec.linked_column)?.kind;
            for source in sources {
                match origin_kind {
                    ColumnKind::Link => {
                        self.link_write(spec.linked_table, spec.linked_column, source, None)?
                    }
                    ColumnKind::LinkList => self.list_remove_target(
                        spec.linked_table,
                        spec.linked_column,
                        source,
                        row,
                    )?,
                    _ => return Err(StrataError::Corruption("backlink origin kind")),
                }
            }
            self.free_ref_cell(table, c, row)?;
        }

        // Who references the row about to be moved into the freed slot?
        let mut repoint: Vec<(u64, u64, u64)> = Vec::new();
        if row != last {
            for c in 0..columns {
                let spec = self.column_spec(table, c)?;
                if spec.kind != ColumnKind::Backlink {
                    continue;
                }
                for source in self.backlink_sources(table, c, last)? {
                    repoint.push((spec.linked_table, spec.linked_column, source));
                }
            }
        }

        // Structural removal from every column tree.
        for c in 0..columns {
            let spec = self.column_spec(table, c)?;
            let root = self.column_root(table, c)?;
            let root = match spec.kind {
                ColumnKind::Int | ColumnKind::Link | ColumnKind::Float | ColumnKind::Double => {
                    let mut tree = Tree::new(&mut self.arena, IntCodec::default(), root);
                    tree.move_last_over(row)?;
                    tree.root()
                }
                ColumnKind::String | ColumnKind::Binary => {
                    let repr = string_repr(&self.arena, root)?;
                    let mut tree = Tree::new(&mut self.arena, StrCodec { repr }, root);
                    tree.move_last_over(row)?;
                    tree.root()
                }
                ColumnKind::LinkList | ColumnKind::Backlink => {
                    // The victim's cell is already null; the last row's
                    // sub-array moves down with its row.
                    let mut tree = Tree::new(&mut self.arena, RefCodec, root);
                    tree.move_last_over(row)?;
                    tree.root()
                }
            };
            self.set_column_root(table, c, root)?;
        }

        // Repoint forward references to the moved row.
        for (ot, oc, source) in repoint {
            let source = if ot == table && source == last { row } else { source };
            match self.column_spec(ot, oc)?.kind {
                ColumnKind::Link => {
                    let cell = crate::column::encode_link_cell(Some(row));
                    self.set_int_cell(ot, oc, source, cell)?;
                }
                ColumnKind::LinkList => self.list_replace_target(ot, oc, source, last, row)?,
                _ => return Err(StrataError::Corruption("backlink origin kind")),
            }
        }

        // The moved row is also a link *source*: its targets' backlink
        // sub-arrays still record it under its old index.
        if row != last {
            for c in 0..columns {
                let spec = self.column_spec(table, c)?;
                match spec.kind {
                    ColumnKind::Link => {
                        let root = self.column_root(table, c)?;
                        let cell =
                            TreeView::new(&self.arena, IntCodec::default(), root).get(row)?;
                        if let Some(target) = crate::column::decode_link_cell(cell)? {
                            self.backlink_replace_source(
                                spec.linked_table,
                                spec.linked_column,
                                target,
                                last,
                                row,
                            )?;
                        }
                    }
                    ColumnKind::LinkList => {
                        for target in self.link_targets(table, c, row)? {
                            self.backlink_replace_source(
                                spec.linked_table,
                                spec.linked_column,
                                target,
                                last,
                                row,
                            )?;
                        }
                    }
                    _ => {}
                }
            }
        }

        self.registry.detach_row(table, row);
        if row != last {
            self.registry.retarget_row(table, last, row);
        }
        Ok(())
    }

    /// Removes every row. Links in both directions are broken row by row.
    pub fn clear_table(&mut self, table: u64) -> Result<()> {
        self.clear_table_rows(table)?;
        self.record(LogOp::ClearTable { table });
        Ok(())
    }

    fn clear_table_rows(&mut self, table: u64) -> Result<()> {
        loop {
            let size = self.row_count(table)?;
            if size == 0 {
                return Ok(());
            }
            self.remove_row_internal(table, size - 1)?;
        }
    }

    /// Frees a ref-valued cell's sub-array and nulls the cell.
    pub(crate) fn free_ref_cell(&mut self, table: u64, column: u64, row: u64) -> Result<()> {
        let root = self.column_root(table, column)?;
        let cell = TreeView::new(&self.arena, RefCodec, root).get(row)?;
        if cell.is_null() {
            return Ok(());
        }
        self.arena.free_deep(cell)?;
        let mut tree = Tree::new(&mut self.arena, RefCodec, root);
        tree.set(row, Ref::null())?;
        let root = tree.root();
        self.set_column_root(table, column, root)
    }
}

// Cell writes.
impl WriteTransaction {
    /// Sets an integer cell.
    pub fn set_int(&mut self, table: u64, column: u64, row: u64, value: i64) -> Result<()> {
        let spec = self.column_spec(table, column)?;
        if spec.kind != ColumnKind::Int {
            return Err(LogicError::TypeMismatch.into());
        }
        self.set_int_cell(table, column, row, value)?;
        self.record(LogOp::SetInt {
            table,
            column,
            row,
            value,
        });
        Ok(())
    }

    /// Sets a float cell.
    pub fn set_float(&mut self, table: u64, column: u64, row: u64, value: f32) -> Result<()> {
        let spec = self.column_spec(table, column)?;
        if spec.kind != ColumnKind::Float {
            return Err(LogicError::TypeMismatch.into());
        }
        self.set_int_cell(table, column, row, encode_float_cell(value))?;
        self.record(LogOp::SetFloat {
            table,
            column,
            row,
            value,
        });
        Ok(())
    }

    /// Sets a double cell.
    pub fn set_double(&mut self, table: u64, column: u64, row: u64, value: f64) -> Result<()> {
        let spec = self.column_spec(table, column)?;
        if spec.kind != ColumnKind::Double {
            return Err(LogicError::TypeMismatch.into());
        }
        self.set_int_cell(table, column, row, encode_double_cell(value))?;
        self.record(LogOp::SetDouble {
            table,
            column,
            row,
            value,
        });
        Ok(())
    }

    /// Sets a string cell, widening the column representation first when
    /// the value does not fit the current one.
    pub fn set_string(&mut self, table: u64, column: u64, row: u64, value: &str) -> Result<()> {
        let spec = self.column_spec(table, column)?;
        if spec.kind != ColumnKind::String {
            return Err(LogicError::TypeMismatch.into());
        }
        self.set_str_cell(table, column, row, value.as_bytes())?;
        self.record(LogOp::SetString {
            table,
            column,
            row,
            value: value.into(),
        });
        Ok(())
    }

    /// Sets a binary cell.
    pub fn set_bytes(&mut self, table: u64, column: u64, row: u64, value: &[u8]) -> Result<()> {
        let spec = self.column_spec(table, column)?;
        if spec.kind != ColumnKind::Binary {
            return Err(LogicError::TypeMismatch.into());
        }
        self.set_str_cell(table, column, row, value)?;
        self.record(LogOp::SetBytes {
            table,
            column,
            row,
            value: value.to_vec(),
        });
        Ok(())
    }

    /// Raw integer-tree cell write, shared by the typed setters and the
    /// link machinery.
    pub(crate) fn set_int_cell(
        &mut self,
        table: u64,
        column: u64,
        row: u64,
        value: i64,
    ) -> Result<()> {
        let root = self.column_root(table, column)?;
        let mut tree = Tree::new(&mut self.arena, IntCodec::default(), root);
        tree.set(row, value)?;
        let root = tree.root();
        self.set_column_root(table, column, root)
    }

    fn set_str_cell(&mut self, table: u64, column: u64, row: u64, value: &[u8]) -> Result<()> {
        let root = self.column_root(table, column)?;
        let root = widen_string_column(&mut self.arena, root, value.len())?;
        let repr = string_repr(&self.arena, root)?;
        let mut tree = Tree::new(&mut self.arena, StrCodec { repr }, root);
        tree.set(row, value.to_vec())?;
        let root = tree.root();
        self.set_column_root(table, column, root)
    }
}
