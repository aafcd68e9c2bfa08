//! Logical transaction log for replication.
//!
//! When a database is opened in replicating mode, every committed write
//! transaction also serializes the logical operations it performed (not the
//! raw node bytes). A consumer fetches the logs for a version range and
//! replays them against a second database with [`apply_transact_log`]; the
//! replica converges to identical logical contents because link, backlink,
//! and cascade behavior is re-derived by the same engine code.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::column::ColumnKind;
use crate::error::{Result, StrataError};
use crate::txn::WriteTransaction;

/// One logical operation performed by a write transaction.
#[derive(Clone, Debug, PartialEq)]
pub enum LogOp {
    /// New table appended to the directory.
    AddTable {
        name: String,
    },
    RemoveTable {
        table: u64,
    },
    /// New column; link kinds carry their target and strength.
    AddColumn {
        table: u64,
        name: String,
        kind: ColumnKind,
        target_table: u64,
        strong: bool,
    },
    /// Row inserted before `row` (`row == size` appends).
    InsertRow {
        table: u64,
        row: u64,
    },
    /// Row removed with move-last-over semantics.
    RemoveRow {
        table: u64,
        row: u64,
    },
    CascadeRemoveRow {
        table: u64,
        row: u64,
    },
    ClearTable {
        table: u64,
    },
    SetInt {
        table: u64,
        column: u64,
        row: u64,
        value: i64,
    },
    /// Float assignment, carried bit-exact.
    SetFloat {
        table: u64,
        column: u64,
        row: u64,
        value: f32,
    },
    /// Double assignment, carried bit-exact.
    SetDouble {
        table: u64,
        column: u64,
        row: u64,
        value: f64,
    },
    SetString {
        table: u64,
        column: u64,
        row: u64,
        value: String,
    },
    SetBytes {
        table: u64,
        column: u64,
        row: u64,
        value: Vec<u8>,
    },
    /// Forward link assignment; `None` nullifies.
    SetLink {
        table: u64,
        column: u64,
        row: u64,
        target: Option<u64>,
    },
    ListInsert {
        table: u64,
        column: u64,
        row: u64,
        index: u64,
        target: u64,
    },
    ListErase {
        table: u64,
        column: u64,
        row: u64,
        index: u64,
    },
    ListClear {
        table: u64,
        column: u64,
        row: u64,
    },
}

const TAG_ADD_TABLE: u8 = 1;
const TAG_REMOVE_TABLE: u8 = 2;
const TAG_ADD_COLUMN: u8 = 3;
const TAG_INSERT_ROW: u8 = 4;
const TAG_REMOVE_ROW: u8 = 5;
const TAG_CASCADE_REMOVE_ROW: u8 = 6;
const TAG_CLEAR_TABLE: u8 = 7;
const TAG_SET_INT: u8 = 8;
const TAG_SET_STRING: u8 = 9;
const TAG_SET_BYTES: u8 = 10;
const TAG_SET_LINK: u8 = 11;
const TAG_LIST_INSERT: u8 = 12;
const TAG_LIST_ERASE: u8 = 13;
const TAG_LIST_CLEAR: u8 = 14;
const TAG_SET_FLOAT: u8 = 15;
const TAG_SET_DOUBLE: u8 = 16;

/// The serialized operations of one committed write transaction.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransactLog {
    bytes: Vec<u8>,
}

impl TransactLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialized form.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Rebuilds a log from its serialized form.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Appends one operation.
    pub fn push(&mut self, op: &LogOp) {
        let out = &mut self.bytes;
        match op {
            LogOp::AddTable { name } => {
                out.push(TAG_ADD_TABLE);
                put_str(out, name);
            }
            LogOp::RemoveTable { table } => {
                out.push(TAG_REMOVE_TABLE);
                put_u64(out, *table);
            }
            LogOp::AddColumn {
                table,
                name,
                kind,
                target_table,
                strong,
            } => {
                out.push(TAG_ADD_COLUMN);
                put_u64(out, *table);
                put_str(out, name);
                out.push(kind.tag() as u8);
                put_u64(out, *target_table);
                out.push(u8::from(*strong));
            }
            LogOp::InsertRow { table, row } => {
                out.push(TAG_INSERT_ROW);
                put_u64(out, *table);
                put_u64(out, *row);
            }
            LogOp::RemoveRow { table, row } => {
                out.push(TAG_REMOVE_ROW);
                put_u64(out, *table);
                put_u64(out, *row);
            }
            LogOp::CascadeRemoveRow { table, row } => {
                out.push(TAG_CASCADE_REMOVE_ROW);
                put_u64(out, *table);
                put_u64(out, *row);
            }
            LogOp::ClearTable { table } => {
                out.push(TAG_CLEAR_TABLE);
                put_u64(out, *table);
            }
            LogOp::SetInt {
                table,
                column,
                row,
                value,
            } => {
                out.push(TAG_SET_INT);
                put_u64(out, *table);
                put_u64(out, *column);
                put_u64(out, *row);
                put_u64(out, *value as u64);
            }
            LogOp::SetFloat {
                table,
                column,
                row,
                value,
            } => {
                out.push(TAG_SET_FLOAT);
                put_u64(out, *table);
                put_u64(out, *column);
                put_u64(out, *row);
                put_u64(out, value.to_bits() as u64);
            }
            LogOp::SetDouble {
                table,
                column,
                row,
                value,
            } => {
                out.push(TAG_SET_DOUBLE);
                put_u64(out, *table);
                put_u64(out, *column);
                put_u64(out, *row);
                put_u64(out, value.to_bits());
            }
            LogOp::SetString {
                table,
                column,
                row,
                value,
            } => {
                out.push(TAG_SET_STRING);
                put_u64(out, *table);
                put_u64(out, *column);
                put_u64(out, *row);
                put_str(out, value);
            }
            LogOp::SetBytes {
                table,
                column,
                row,
                value,
            } => {
                out.push(TAG_SET_BYTES);
                put_u64(out, *table);
                put_u64(out, *column);
                put_u64(out, *row);
                put_bytes(out, value);
            }
            LogOp::SetLink {
                table,
                column,
                row,
                target,
            } => {
                out.push(TAG_SET_LINK);
                put_u64(out, *table);
                put_u64(out, *column);
                put_u64(out, *row);
                put_u64(out, target.map(|t| t + 1).unwrap_or(0));
            }
            LogOp::ListInsert {
                table,
                column,
                row,
                index,
                target,
            } => {
                out.push(TAG_LIST_INSERT);
                put_u64(out, *table);
                put_u64(out, *column);
                put_u64(out, *row);
                put_u64(out, *index);
                put_u64(out, *target);
            }
            LogOp::ListErase {
                table,
                column,
                row,
                index,
            } => {
                out.push(TAG_LIST_ERASE);
                put_u64(out, *table);
                put_u64(out, *column);
                put_u64(out, *row);
                put_u64(out, *index);
            }
            LogOp::ListClear { table, column, row } => {
                out.push(TAG_LIST_CLEAR);
                put_u64(out, *table);
                put_u64(out, *column);
                put_u64(out, *row);
            }
        }
    }

    /// Decodes every operation in order.
    pub fn ops(&self) -> Result<Vec<LogOp>> {
        let mut cursor = Cursor {
            bytes: &self.bytes,
            pos: 0,
        };
        let mut ops = Vec::new();
        while !cursor.done() {
            ops.push(cursor.read_op()?);
        }
        Ok(ops)
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn done(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn take(&mut self, n: usize) -> Result<&[u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(StrataError::Corruption("truncated transact log"));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn blob(&mut self) -> Result<Vec<u8>> {
        let len = u32::from_be_bytes(self.take(4)?.try_into().unwrap()) as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn string(&mut self) -> Result<String> {
        String::from_utf8(self.blob()?)
            .map_err(|_| StrataError::Corruption("transact log string not utf-8"))
    }

    fn read_op(&mut self) -> Result<LogOp> {
        Ok(match self.u8()? {
            TAG_ADD_TABLE => LogOp::AddTable {
                name: self.string()?,
            },
            TAG_REMOVE_TABLE => LogOp::RemoveTable { table: self.u64()? },
            TAG_ADD_COLUMN => LogOp::AddColumn {
                table: self.u64()?,
                name: self.string()?,
                kind: ColumnKind::from_tag(self.u8()? as i64)?,
                target_table: self.u64()?,
                strong: self.u8()? != 0,
            },
            TAG_INSERT_ROW => LogOp::InsertRow {
                table: self.u64()?,
                row: self.u64()?,
            },
            TAG_REMOVE_ROW => LogOp::RemoveRow {
                table: self.u64()?,
                row: self.u64()?,
            },
            TAG_CASCADE_REMOVE_ROW => LogOp::CascadeRemoveRow {
                table: self.u64()?,
                row: self.u64()?,
            },
            TAG_CLEAR_TABLE => LogOp::ClearTable { table: self.u64()? },
            TAG_SET_INT => LogOp::SetInt {
                table: self.u64()?,
                column: self.u64()?,
                row: self.u64()?,
                value: self.u64()? as i64,
            },
            TAG_SET_FLOAT => LogOp::SetFloat {
                table: self.u64()?,
                column: self.u64()?,
                row: self.u64()?,
                value: f32::from_bits(self.u64()? as u32),
            },
            TAG_SET_DOUBLE => LogOp::SetDouble {
                table: self.u64()?,
                column: self.u64()?,
                row: self.u64()?,
                value: f64::from_bits(self.u64()?),
            },
            TAG_SET_STRING => LogOp::SetString {
                table: self.u64()?,
                column: self.u64()?,
                row: self.u64()?,
                value: self.string()?,
            },
            TAG_SET_BYTES => LogOp::SetBytes {
                table: self.u64()?,
                column: self.u64()?,
                row: self.u64()?,
                value: self.blob()?,
            },
            TAG_SET_LINK => LogOp::SetLink {
                table: self.u64()?,
                column: self.u64()?,
                row: self.u64()?,
                target: match self.u64()? {
                    0 => None,
                    n => Some(n - 1),
                },
            },
            TAG_LIST_INSERT => LogOp::ListInsert {
                table: self.u64()?,
                column: self.u64()?,
                row: self.u64()?,
                index: self.u64()?,
                target: self.u64()?,
            },
            TAG_LIST_ERASE => LogOp::ListErase {
                table: self.u64()?,
                column: self.u64()?,
                row: self.u64()?,
                index: self.u64()?,
            },
            TAG_LIST_CLEAR => LogOp::ListClear {
                table: self.u64()?,
                column: self.u64()?,
                row: self.u64()?,
            },
            _ => return Err(StrataError::Corruption("unknown transact log tag")),
        })
    }
}

fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn put_bytes(out: &mut Vec<u8>, value: &[u8]) {
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(value);
}

fn put_str(out: &mut Vec<u8>, value: &str) {
    put_bytes(out, value.as_bytes());
}

/// Committed logs retained per version.
#[derive(Default)]
pub struct LogStore {
    logs: BTreeMap<u64, Arc<TransactLog>>,
}

impl LogStore {
    /// Retains the log of the commit that produced `version`.
    pub fn retain(&mut self, version: u64, log: TransactLog) {
        self.logs.insert(version, Arc::new(log));
    }

    /// Logs for every commit with `from < version <= to`, in order.
    pub fn commit_entries(&self, from: u64, to: u64) -> Vec<Arc<TransactLog>> {
        self.logs
            .range(from + 1..=to)
            .map(|(_, log)| Arc::clone(log))
            .collect()
    }

    /// Drops logs at or below `version`.
    pub fn trim_below(&mut self, version: u64) {
        self.logs = self.logs.split_off(&(version + 1));
    }
}

/// Replays one transaction's logical operations against `txn`. Link,
/// backlink, and cascade side effects are re-derived by the engine, so a
/// replica fed every log in order converges to the origin's contents.
pub fn apply_transact_log(log: &TransactLog, txn: &mut WriteTransaction) -> Result<()> {
    for op in log.ops()? {
        match op {
            LogOp::AddTable { name } => {
                txn.add_table(&name)?;
            }
            LogOp::RemoveTable { table } => txn.remove_table(table)?,
            LogOp::AddColumn {
                table,
                name,
                kind,
                target_table,
                strong,
            } => {
                if kind.is_link_kind() {
                    txn.add_link_column(table, &name, kind, target_table, strong)?;
                } else {
                    txn.add_column(table, &name, kind)?;
                }
            }
            LogOp::InsertRow { table, row } => txn.insert_row(table, row)?,
            LogOp::RemoveRow { table, row } => txn.remove_row(table, row)?,
            LogOp::CascadeRemoveRow { table, row } => txn.cascade_remove_row(table, row)?,
            LogOp::ClearTable { table } => txn.clear_table(table)?,
            LogOp::SetInt {
                table,
                column,
                row,
                value,
            } => txn.set_int(table, column, row, value)?,
            LogOp::SetFloat {
                table,
                column,
                row,
                value,
            } => txn.set_float(table, column, row, value)?,
            LogOp::SetDouble {
                table,
                column,
                row,
                value,
            } => txn.set_double(table, column, row, value)?,
            LogOp::SetString {
                table,
                column,
                row,
                value,
            } => txn.set_string(table, column, row, &value)?,
            LogOp::SetBytes {
                table,
                column,
                row,
                value,
            } => txn.set_bytes(table, column, row, &value)?,
            LogOp::SetLink {
                table,
                column,
                row,
                target,
            } => txn.set_link(table, column, row, target)?,
            LogOp::ListInsert {
                table,
                column,
                row,
                index,
                target,
            } => {
                let list = txn.linklist(table, column, row)?;
                txn.linklist_insert(&list, index, target)?;
            }
            LogOp::ListErase {
                table,
                column,
                row,
                index,
            } => {
                let list = txn.linklist(table, column, row)?;
                txn.linklist_erase(&list, index)?;
            }
            LogOp::ListClear { table, column, row } => {
                let list = txn.linklist(table, column, row)?;
                txn.linklist_clear(&list)?;
            }
        }
    }
    Ok(())
}
