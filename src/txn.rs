//! Transaction coordination: single-writer exclusion, the version ring,
//! and snapshot pinning for readers.
//!
//! Every commit publishes a new version whose nodes are appended after the
//! previous end of file, so older snapshots stay byte-for-byte intact as
//! long as something pins them. The ring tracks which versions are still
//! pinned; when a version becomes unreachable its superseded bytes are
//! added to the reclaimable counter, and compaction can fold the file back
//! down once the ring is quiet.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Condvar, Mutex, RawMutex};
use tracing::{debug, info, warn};

use crate::arena::{Arena, Ref};
use crate::column::linklist::LinkListRegistry;
use crate::db::DbShared;
use crate::error::{Result, StrataError};
use crate::group::ReadAccess;
use crate::replog::{LogOp, TransactLog};

pub(crate) struct VersionSlot {
    pub version: u64,
    pub top: Ref,
    pub readers: u64,
    /// Bytes of the previous generation this version's commit made dead.
    /// Filled in when the next commit supersedes this slot.
    pub superseded_bytes: u64,
}

/// Bounded history of still-reachable versions, newest at the back.
pub(crate) struct VersionRing {
    slots: VecDeque<VersionSlot>,
    reclaimable: u64,
    /// Bumped by `release_waiters`; lets blocked waiters give up without a
    /// new commit arriving.
    pub wake_epoch: u64,
}

impl VersionRing {
    pub fn new(version: u64, top: Ref) -> Self {
        let mut slots = VecDeque::new();
        slots.push_back(VersionSlot {
            version,
            top,
            readers: 0,
            superseded_bytes: 0,
        });
        VersionRing {
            slots,
            reclaimable: 0,
            wake_epoch: 0,
        }
    }

    pub fn newest_version(&self) -> u64 {
        self.slots.back().map(|s| s.version).unwrap_or(0)
    }

    /// Pins the newest version and returns it.
    pub fn pin_newest(&mut self) -> (u64, Ref) {
        let slot = self.slots.back_mut().expect("ring never empty");
        slot.readers += 1;
        (slot.version, slot.top)
    }

    /// Pins a specific retained version.
    pub fn pin_at(&mut self, version: u64) -> Result<Ref> {
        for slot in self.slots.iter_mut() {
            if slot.version == version {
                slot.readers += 1;
                return Ok(slot.top);
            }
        }
        Err(StrataError::UnreachableVersion(version))
    }

    pub fn unpin(&mut self, version: u64) {
        for slot in self.slots.iter_mut() {
            if slot.version == version {
                debug_assert!(slot.readers > 0);
                slot.readers -= 1;
                return;
            }
        }
        debug_assert!(false, "unpin of unknown version");
    }

    /// Records a committed version. `freed` is the number of committed
    /// bytes the new version made dead; they become reclaimable once the
    /// previous newest version drops out of the ring.
    pub fn push(&mut self, version: u64, top: Ref, freed: u64) {
        if let Some(prev) = self.slots.back_mut() {
            prev.superseded_bytes = freed;
        }
        self.slots.push_back(VersionSlot {
            version,
            top,
            readers: 0,
            superseded_bytes: 0,
        });
    }

    /// Drops unpinned, superseded versions from the front of the ring.
    pub fn sweep(&mut self) {
        while self.slots.len() > 1 {
            let front = self.slots.front().expect("len checked");
            if front.readers != 0 {
                break;
            }
            self.reclaimable += front.superseded_bytes;
            self.slots.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn reclaimable_bytes(&self) -> u64 {
        self.reclaimable
    }

    pub fn all_unpinned(&self) -> bool {
        self.slots.iter().all(|s| s.readers == 0)
    }

    /// Resets history to a single fresh slot, e.g. after compaction has
    /// rewritten every surviving node.
    pub fn reset(&mut self, version: u64, top: Ref) {
        debug_assert!(self.all_unpinned());
        self.slots.clear();
        self.slots.push_back(VersionSlot {
            version,
            top,
            readers: 0,
            superseded_bytes: 0,
        });
        self.reclaimable = 0;
    }
}

/// Shared coordination state, one per open database.
pub(crate) struct Coordinator {
    /// Writer exclusion. Held as an owned guard inside the live
    /// [`WriteTransaction`] so the transaction can move across scopes.
    pub writer: Arc<Mutex<()>>,
    pub ring: Mutex<VersionRing>,
    /// Signalled on every commit and on `release_waiters`.
    pub commit_cv: Condvar,
}

impl Coordinator {
    pub fn new(version: u64, top: Ref) -> Self {
        Coordinator {
            writer: Arc::new(Mutex::new(())),
            ring: Mutex::new(VersionRing::new(version, top)),
            commit_cv: Condvar::new(),
        }
    }
}

/// A pinned, immutable snapshot of one committed version.
///
/// Dropping the transaction unpins the version; the ring then discards any
/// history nothing reads anymore.
pub struct ReadTransaction {
    db: Arc<DbShared>,
    arena: Arena,
    version: u64,
    top: Ref,
}

impl std::fmt::Debug for ReadTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadTransaction")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl ReadTransaction {
    /// Pins `at` (or the newest version when `None`) and wraps the current
    /// file image. The pin is taken before the image is sampled; commits
    /// publish the image before registering the version, so the image is
    /// always at least as new as the pinned version and, being append-only,
    /// still contains every node the pinned top reaches.
    pub(crate) fn begin(db: Arc<DbShared>, at: Option<u64>) -> Result<ReadTransaction> {
        let (version, top) = {
            let mut ring = db.coord.ring.lock();
            match at {
                None => ring.pin_newest(),
                Some(v) => (v, ring.pin_at(v)?),
            }
        };
        let image = db.file.lock().image();
        debug!(version, "begin read transaction");
        Ok(ReadTransaction {
            arena: Arena::for_read(image),
            db,
            version,
            top,
        })
    }

    /// The committed version this snapshot reads.
    pub fn version(&self) -> u64 {
        self.version
    }
}

impl ReadAccess for ReadTransaction {
    fn arena(&self) -> &Arena {
        &self.arena
    }

    fn top(&self) -> Ref {
        self.top
    }
}

impl Drop for ReadTransaction {
    fn drop(&mut self) {
        let mut ring = self.db.coord.ring.lock();
        ring.unpin(self.version);
        ring.sweep();
    }
}

/// The single live write transaction.
///
/// Construction takes the writer lock; the guard lives in the transaction,
/// so dropping it (explicitly via [`commit`](Self::commit) or
/// [`rollback`](Self::rollback), or implicitly) releases the next writer.
/// All mutations go to transient nodes in the arena; nothing is visible to
/// readers, or durable, before `commit` returns.
pub struct WriteTransaction {
    db: Arc<DbShared>,
    #[allow(dead_code)]
    guard: ArcMutexGuard<RawMutex, ()>,
    pub(crate) arena: Arena,
    pub(crate) top: Ref,
    base_version: u64,
    log: Option<TransactLog>,
    pub(crate) registry: LinkListRegistry,
    finished: bool,
}

impl WriteTransaction {
    pub(crate) fn begin(db: Arc<DbShared>) -> Result<WriteTransaction> {
        let guard = db.coord.writer.lock_arc();
        let (image, version, top) = {
            let file = db.file.lock();
            (file.image(), file.version(), file.top())
        };
        debug!(base_version = version, "begin write transaction");
        let arena = Arena::for_write(image, db.write_budget);
        let log = db.replicate.then(TransactLog::new);
        Ok(WriteTransaction {
            db,
            guard,
            arena,
            top,
            base_version: version,
            log,
            registry: LinkListRegistry::default(),
            finished: false,
        })
    }

    /// The committed version this transaction started from; a successful
    /// commit produces `base_version() + 1`.
    pub fn base_version(&self) -> u64 {
        self.base_version
    }

    pub(crate) fn record(&mut self, op: LogOp) {
        if let Some(log) = self.log.as_mut() {
            log.push(&op);
        }
    }

    /// Flushes every transient node to the end of the file, publishes the
    /// new header slot, and registers the version with the ring. Returns
    /// the new version number.
    ///
    /// Readers begun before this call keep their snapshots; readers begun
    /// after it see the new version.
    pub fn commit(mut self) -> Result<u64> {
        let new_version = self.base_version + 1;
        let mut tail: Vec<u8> = Vec::new();
        let new_top;
        {
            let mut file = self.db.file.lock();
            let base = file.len();
            let top = self.top;
            new_top = self.arena.flush(top, &mut |node| {
                let offset = base + tail.len() as u64;
                tail.extend_from_slice(node);
                // Committed refs must stay 8-byte aligned.
                let pad = tail.len().next_multiple_of(8) - tail.len();
                tail.extend(std::iter::repeat(0u8).take(pad));
                Ok(offset)
            })?;
            file.publish(new_version, new_top, &tail)?;
        }

        let freed = self.arena.freed_committed_bytes();
        {
            let mut ring = self.db.coord.ring.lock();
            ring.push(new_version, new_top, freed);
            ring.sweep();
            self.db.coord.commit_cv.notify_all();
        }
        if let Some(log) = self.log.take() {
            self.db.logs.lock().retain(new_version, log);
        }
        self.finished = true;
        info!(
            version = new_version,
            bytes = tail.len(),
            freed,
            "commit"
        );
        Ok(new_version)
    }

    /// Discards every change made in this transaction. Infallible, and
    /// equivalent to dropping the transaction.
    pub fn rollback(mut self) {
        self.arena.discard_writes();
        self.finished = true;
        debug!(base_version = self.base_version, "rollback");
    }

    pub(crate) fn commit_log(&self) -> Option<&TransactLog> {
        self.log.as_ref()
    }
}

impl ReadAccess for WriteTransaction {
    fn arena(&self) -> &Arena {
        &self.arena
    }

    fn top(&self) -> Ref {
        self.top
    }
}

impl Drop for WriteTransaction {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                base_version = self.base_version,
                "write transaction dropped without commit, rolling back"
            );
            self.arena.discard_writes();
        }
    }
}
