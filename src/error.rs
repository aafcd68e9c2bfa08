use std::io;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Top-level error type returned by every fallible engine operation.
///
/// The variants map one-to-one onto the error kinds a host-language wrapper
/// needs to translate: environmental failures (`Io`, `OutOfMemory`), snapshot
/// lifecycle failures (`UnreachableVersion`, `IncompatibleLockFile`), on-disk
/// damage (`Corruption`), and caller misuse (`Logic`).
#[derive(Debug, Error)]
pub enum StrataError {
    /// Underlying storage medium failed (not-found, permissions, short
    /// writes and friends all surface through the inner `io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The write transaction exceeded its transient allocation budget.
    /// Fatal to the current transaction only; committed snapshots are
    /// never affected.
    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),

    /// The requested snapshot version has already been reclaimed.
    /// Recoverable by retrying against the latest version.
    #[error("version {0} is no longer reachable")]
    UnreachableVersion(u64),

    /// The database file is exclusively locked by another process.
    #[error("database file is locked by another process")]
    IncompatibleLockFile,

    /// The committed image failed a structural or checksum validation.
    #[error("corruption detected: {0}")]
    Corruption(&'static str),

    /// The caller violated an API precondition. Never partially applied.
    #[error("logic error: {0}")]
    Logic(#[from] LogicError),
}

/// Caller-misuse error kinds. These are reported synchronously at the call
/// that violated the precondition and should not be retried.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LogicError {
    /// Row index past the end of the column.
    #[error("row index out of range")]
    IndexOutOfRange,
    /// Column index past the end of the table.
    #[error("column index out of range")]
    ColumnOutOfRange,
    /// Table index past the end of the group.
    #[error("table index out of range")]
    TableOutOfRange,
    /// Value or operation does not match the column type.
    #[error("value type does not match column type")]
    TypeMismatch,
    /// The accessor's row was removed or the transaction ended.
    #[error("accessor is detached from its row")]
    DetachedAccessor,
    /// A link operation named a row in the wrong target table.
    #[error("link target does not belong to the linked table")]
    CrossTableLink,
    /// The column has no search index to satisfy the request.
    #[error("no search index on this column")]
    NoSearchIndex,
    /// The transaction is not in the state the operation requires.
    #[error("transaction is not in the required state")]
    TransactionState,
}

impl StrataError {
    /// Returns `true` when the error indicates caller misuse rather than an
    /// environmental failure.
    pub fn is_logic(&self) -> bool {
        matches!(self, StrataError::Logic(_))
    }
}
