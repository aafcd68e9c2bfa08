//! Database handle and lifecycle.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::arena::Arena;
use crate::error::Result;
use crate::io::{DbFile, FILE_HDR_LEN};
use crate::replog::{LogStore, TransactLog};
use crate::txn::{Coordinator, ReadTransaction, WriteTransaction};

const DEFAULT_WRITE_BUDGET: usize = 64 * 1024 * 1024;

/// State shared by the handle and every live transaction.
pub(crate) struct DbShared {
    pub file: Mutex<DbFile>,
    pub coord: Coordinator,
    pub write_budget: usize,
    pub replicate: bool,
    pub logs: Mutex<LogStore>,
}

/// How to open a database.
pub struct Options {
    path: Option<PathBuf>,
    write_budget: usize,
    replicate: bool,
}

impl Options {
    /// Durable database backed by the file at `path`, created on first
    /// open.
    pub fn file<P: AsRef<Path>>(path: P) -> Self {
        Options {
            path: Some(path.as_ref().to_path_buf()),
            write_budget: DEFAULT_WRITE_BUDGET,
            replicate: false,
        }
    }

    /// Volatile database held entirely in memory. Commits are not durable,
    /// but every transactional guarantee still applies.
    pub fn in_memory() -> Self {
        Options {
            path: None,
            write_budget: DEFAULT_WRITE_BUDGET,
            replicate: false,
        }
    }

    /// Cap on transient node bytes a single write transaction may hold
    /// before it fails with an out-of-memory error.
    pub fn write_budget(mut self, bytes: usize) -> Self {
        self.write_budget = bytes;
        self
    }

    /// Record a logical operation log per commit, for replication.
    pub fn replicate(mut self, on: bool) -> Self {
        self.replicate = on;
        self
    }

    pub fn open(self) -> Result<Database> {
        let file = match &self.path {
            Some(path) => DbFile::open(path)?,
            None => DbFile::in_memory(),
        };
        let coord = Coordinator::new(file.version(), file.top());
        info!(
            version = file.version(),
            in_memory = file.is_in_memory(),
            "database opened"
        );
        Ok(Database {
            inner: Arc::new(DbShared {
                file: Mutex::new(file),
                coord,
                write_budget: self.write_budget,
                replicate: self.replicate,
                logs: Mutex::new(LogStore::default()),
            }),
        })
    }
}

/// An open database. Clones share the same underlying state; the handle is
/// `Send + Sync` and cheap to clone.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DbShared>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Opens (or creates) a durable database at `path` with default
    /// options.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Database> {
        Options::file(path).open()
    }

    /// Opens a volatile in-memory database with default options.
    pub fn open_in_memory() -> Result<Database> {
        Ok(Options::in_memory().open()?)
    }

    /// Begins a read transaction pinned to the newest committed version.
    pub fn begin_read(&self) -> Result<ReadTransaction> {
        ReadTransaction::begin(Arc::clone(&self.inner), None)
    }

    /// Begins a read transaction pinned to a specific retained version.
    /// Fails with an unreachable-version error when that version has been
    /// recycled.
    pub fn begin_read_at(&self, version: u64) -> Result<ReadTransaction> {
        ReadTransaction::begin(Arc::clone(&self.inner), Some(version))
    }

    /// Begins the write transaction, blocking until any current writer
    /// finishes.
    pub fn begin_write(&self) -> Result<WriteTransaction> {
        WriteTransaction::begin(Arc::clone(&self.inner))
    }

    /// Newest committed version.
    pub fn current_version(&self) -> u64 {
        self.inner.coord.ring.lock().newest_version()
    }

    /// Number of versions the ring still retains.
    pub fn version_count(&self) -> usize {
        self.inner.coord.ring.lock().len()
    }

    /// Committed bytes that only recycled versions still reference.
    pub fn reclaimable_bytes(&self) -> u64 {
        self.inner.coord.ring.lock().reclaimable_bytes()
    }

    /// True when a version newer than `since` has been committed.
    pub fn has_changed(&self, since: u64) -> bool {
        self.current_version() > since
    }

    /// Blocks until a version newer than `since` is committed, or until
    /// [`release_waiters`](Self::release_waiters) is called. Returns
    /// whether a change actually happened.
    pub fn wait_for_change(&self, since: u64) -> bool {
        let coord = &self.inner.coord;
        let mut ring = coord.ring.lock();
        let epoch = ring.wake_epoch;
        while ring.newest_version() <= since && ring.wake_epoch == epoch {
            coord.commit_cv.wait(&mut ring);
        }
        ring.newest_version() > since
    }

    /// Wakes every thread blocked in [`wait_for_change`](Self::wait_for_change).
    pub fn release_waiters(&self) {
        let mut ring = self.inner.coord.ring.lock();
        ring.wake_epoch += 1;
        self.inner.coord.commit_cv.notify_all();
    }

    /// Operation logs for the commits in `(since, upto]`, oldest first.
    /// Only populated when the database was opened with
    /// [`Options::replicate`].
    pub fn commit_entries(&self, since: u64, upto: u64) -> Vec<Arc<TransactLog>> {
        self.inner.logs.lock().commit_entries(since, upto)
    }

    /// Drops retained operation logs for versions up to and including
    /// `version`.
    pub fn trim_commit_entries(&self, version: u64) {
        self.inner.logs.lock().trim_below(version);
    }

    /// Rewrites the file to hold only the nodes reachable from the newest
    /// version. Returns `false` without touching the file when a writer or
    /// any reader is active.
    ///
    /// Holding the ring lock for the duration keeps new readers out; the
    /// writer lock keeps writers out.
    pub fn compact(&self) -> Result<bool> {
        let coord = &self.inner.coord;
        let _writer = match coord.writer.try_lock() {
            Some(g) => g,
            None => {
                warn!("compaction skipped: write transaction active");
                return Ok(false);
            }
        };
        let mut ring = coord.ring.lock();
        ring.sweep();
        if !ring.all_unpinned() {
            warn!("compaction skipped: read transactions active");
            return Ok(false);
        }

        let mut file = self.inner.file.lock();
        let old_len = file.len();
        let top = file.top();
        let version = file.version();
        let mut arena = Arena::for_write(file.image(), usize::MAX);
        let transient_top = arena.cow_deep(top)?;
        let mut tail: Vec<u8> = Vec::new();
        let new_top = arena.flush(transient_top, &mut |node| {
            let offset = FILE_HDR_LEN + tail.len() as u64;
            tail.extend_from_slice(node);
            let pad = tail.len().next_multiple_of(8) - tail.len();
            tail.extend(std::iter::repeat(0u8).take(pad));
            Ok(offset)
        })?;
        file.rewrite(new_top, &tail)?;
        ring.reset(version, new_top);
        info!(
            version,
            old_len,
            new_len = file.len(),
            "compacted"
        );
        Ok(true)
    }
}
