//! Strata is an embedded, copy-on-write column store.
//!
//! Data lives in counted B+-trees of fixed-width leaves, one tree per
//! column, all hanging off a single top ref. A commit never overwrites
//! live data: changed nodes are appended to the end of the file and a
//! 4 KiB double-buffered header flips to the new top, so a crash at any
//! point leaves one of the last two committed versions intact.
//!
//! Concurrency follows the MVCC single-writer model. Any number of read
//! transactions pin immutable snapshots; one write transaction at a time
//! builds the next version in memory and publishes it atomically. Old
//! versions stay readable until the last reader pinning them goes away.
//!
//! ```no_run
//! use strata::{ColumnKind, Database, ReadAccess};
//!
//! # fn main() -> strata::Result<()> {
//! let db = Database::open("people.strata")?;
//! let mut txn = db.begin_write()?;
//! let people = txn.add_table("people")?;
//! let age = txn.add_column(people, "age", ColumnKind::Int)?;
//! let row = txn.add_row(people)?;
//! txn.set_int(people, age, row, 41)?;
//! txn.commit()?;
//!
//! let read = db.begin_read()?;
//! assert_eq!(read.get_int(people, age, row)?, 41);
//! # Ok(())
//! # }
//! ```

pub mod arena;
pub mod column;
pub mod db;
pub mod error;
pub mod group;
pub mod io;
pub mod leaf;
pub mod node;
pub mod replog;
pub mod tree;
pub mod txn;

pub use arena::Ref;
pub use column::linklist::LinkList;
pub use column::{ColumnKind, ColumnSpec};
pub use db::{Database, Options};
pub use error::{LogicError, Result, StrataError};
pub use group::ReadAccess;
pub use replog::{apply_transact_log, LogOp, TransactLog};
pub use txn::{ReadTransaction, WriteTransaction};
