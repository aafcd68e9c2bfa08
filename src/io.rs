//! Database file layout and mapped I/O.
//!
//! A database file is a fixed 4096-byte header region followed by an
//! append-only arena of nodes addressed by byte offset. The header region
//! holds a magic, a format version, and two alternating commit slots; a
//! commit appends its nodes, syncs, then overwrites one slot and syncs
//! again, so a crash at any point leaves at least one valid slot naming a
//! fully written snapshot. Opening picks the valid slot with the higher
//! version, which also recovers from a torn header write.
//!
//! An exclusive advisory lock is held for the lifetime of the open file;
//! the engine's version ring is process-local, so a second process would
//! see stale snapshots. Memory-only databases keep the same layout in a
//! heap image and skip all durability.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use memmap2::Mmap;

use crate::arena::{BaseImage, Ref};
use crate::error::{Result, StrataError};

/// Size of the fixed header region; node offsets start here.
pub const FILE_HDR_LEN: u64 = 4096;

const MAGIC: [u8; 8] = *b"strata01";
const SLOT_OFF: [u64; 2] = [16, 64];
const SLOT_LEN: usize = 28;

/// One commit slot: the snapshot a reader of the file would open.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct HeaderSlot {
    version: u64,
    top: u64,
    file_len: u64,
}

impl HeaderSlot {
    fn encode(&self) -> [u8; SLOT_LEN] {
        let mut bytes = [0u8; SLOT_LEN];
        bytes[0..8].copy_from_slice(&self.version.to_be_bytes());
        bytes[8..16].copy_from_slice(&self.top.to_be_bytes());
        bytes[16..24].copy_from_slice(&self.file_len.to_be_bytes());
        let crc = crc32fast::hash(&bytes[0..24]);
        bytes[24..28].copy_from_slice(&crc.to_be_bytes());
        bytes
    }

    /// Parses a slot, returning `None` when the checksum does not hold or
    /// the slot was never written.
    fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < SLOT_LEN {
            return None;
        }
        let crc = u32::from_be_bytes(bytes[24..28].try_into().ok()?);
        if crc != crc32fast::hash(&bytes[0..24]) {
            return None;
        }
        let slot = Self {
            version: u64::from_be_bytes(bytes[0..8].try_into().ok()?),
            top: u64::from_be_bytes(bytes[8..16].try_into().ok()?),
            file_len: u64::from_be_bytes(bytes[16..24].try_into().ok()?),
        };
        if slot.version == 0 || slot.file_len < FILE_HDR_LEN {
            return None;
        }
        Some(slot)
    }
}

/// Maps a locked database file.
///
/// The one `unsafe` block in the crate. The mapping is sound because the
/// file is exclusively locked by this process and committed regions are
/// never rewritten in place; commits only append and flip a header slot.
#[allow(unsafe_code)]
fn map_file(file: &File) -> Result<Mmap> {
    Ok(unsafe { Mmap::map(file)? })
}

/// An open database: either a locked, mapped file or a heap image with the
/// same layout.
#[derive(Debug)]
pub enum DbFile {
    /// Durable, memory-mapped file.
    Disk {
        /// Locked file handle.
        file: File,
        /// Mapping of the whole file; refreshed after every publish.
        map: Arc<Mmap>,
        /// Logical length: header region plus all committed nodes. The
        /// physical file may be longer after a torn commit.
        len: u64,
        /// Location on disk, kept for compaction.
        path: PathBuf,
        version: u64,
        top: Ref,
    },
    /// Memory-only image, no durability.
    Mem {
        image: Arc<Vec<u8>>,
        version: u64,
        top: Ref,
    },
}

impl DbFile {
    /// Opens or creates a database file, taking the exclusive lock.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.try_lock_exclusive()
            .map_err(|_| StrataError::IncompatibleLockFile)?;

        let physical = file.metadata()?.len();
        let (version, top, len) = if physical == 0 {
            init_header(&mut file)?;
            (1, Ref::null(), FILE_HDR_LEN)
        } else {
            let slot = read_newest_slot(&mut file)?;
            (slot.version, Ref::from_raw(slot.top), slot.file_len)
        };
        let map = Arc::new(map_file(&file)?);
        Ok(DbFile::Disk {
            file,
            map,
            len,
            path: path.to_path_buf(),
            version,
            top,
        })
    }

    /// Creates a fresh memory-only database.
    pub fn in_memory() -> Self {
        DbFile::Mem {
            image: Arc::new(vec![0u8; FILE_HDR_LEN as usize]),
            version: 1,
            top: Ref::null(),
        }
    }

    /// Newest committed version number.
    pub fn version(&self) -> u64 {
        match self {
            DbFile::Disk { version, .. } => *version,
            DbFile::Mem { version, .. } => *version,
        }
    }

    /// Top ref of the newest committed snapshot.
    pub fn top(&self) -> Ref {
        match self {
            DbFile::Disk { top, .. } => *top,
            DbFile::Mem { top, .. } => *top,
        }
    }

    /// Logical committed length; the next appended node lands here.
    pub fn len(&self) -> u64 {
        match self {
            DbFile::Disk { len, .. } => *len,
            DbFile::Mem { image, .. } => image.len() as u64,
        }
    }

    /// Snapshot of the committed image for a new arena.
    pub fn image(&self) -> BaseImage {
        match self {
            DbFile::Disk { map, .. } => BaseImage::Mapped(Arc::clone(map)),
            DbFile::Mem { image, .. } => BaseImage::Mem(Arc::clone(image)),
        }
    }

    /// True when the database has no backing file.
    pub fn is_in_memory(&self) -> bool {
        matches!(self, DbFile::Mem { .. })
    }

    /// Publishes a new snapshot: appends `tail` after the current logical
    /// end, makes it durable, then flips a header slot. Crash-ordering: the
    /// node data is synced before the slot naming it, and the alternate slot
    /// still names the previous snapshot until the new one is fully synced.
    pub fn publish(&mut self, new_version: u64, new_top: Ref, tail: &[u8]) -> Result<()> {
        match self {
            DbFile::Disk {
                file,
                map,
                len,
                version,
                top,
                ..
            } => {
                let new_len = *len + tail.len() as u64;
                if !tail.is_empty() {
                    file.seek(SeekFrom::Start(*len))?;
                    file.write_all(tail)?;
                    file.sync_data()?;
                }
                let slot = HeaderSlot {
                    version: new_version,
                    top: new_top.raw(),
                    file_len: new_len,
                };
                file.seek(SeekFrom::Start(SLOT_OFF[(new_version % 2) as usize]))?;
                file.write_all(&slot.encode())?;
                file.sync_data()?;
                *map = Arc::new(map_file(file)?);
                *len = new_len;
                *version = new_version;
                *top = new_top;
            }
            DbFile::Mem {
                image,
                version,
                top,
            } => {
                let mut next = Vec::with_capacity(image.len() + tail.len());
                next.extend_from_slice(image);
                next.extend_from_slice(tail);
                *image = Arc::new(next);
                *version = new_version;
                *top = new_top;
            }
        }
        Ok(())
    }

    /// Replaces the whole file with a freshly packed image holding only the
    /// nodes in `tail`, keeping the current version. Used by compaction; the
    /// rewrite goes to a sibling temp file which is atomically renamed over
    /// the original, then reopened and relocked.
    pub fn rewrite(&mut self, new_top: Ref, tail: &[u8]) -> Result<()> {
        match self {
            DbFile::Disk { path, version, .. } => {
                let version = *version;
                let tmp_path = path.with_extension("compact");
                {
                    let mut tmp = OpenOptions::new()
                        .read(true)
                        .write(true)
                        .create(true)
                        .truncate(true)
                        .open(&tmp_path)?;
                    init_header(&mut tmp)?;
                    tmp.seek(SeekFrom::Start(FILE_HDR_LEN))?;
                    tmp.write_all(tail)?;
                    let slot = HeaderSlot {
                        version,
                        top: new_top.raw(),
                        file_len: FILE_HDR_LEN + tail.len() as u64,
                    };
                    tmp.seek(SeekFrom::Start(SLOT_OFF[(version % 2) as usize]))?;
                    tmp.write_all(&slot.encode())?;
                    tmp.sync_all()?;
                }
                let path = path.clone();
                std::fs::rename(&tmp_path, &path)?;
                // The old handle's lock dies with it; relock the new inode.
                *self = DbFile::open(&path)?;
            }
            DbFile::Mem {
                image,
                top,
                ..
            } => {
                let mut next = vec![0u8; FILE_HDR_LEN as usize];
                next.extend_from_slice(tail);
                *image = Arc::new(next);
                *top = new_top;
            }
        }
        Ok(())
    }
}

fn init_header(file: &mut File) -> Result<()> {
    let mut header = vec![0u8; FILE_HDR_LEN as usize];
    header[0..8].copy_from_slice(&MAGIC);
    let slot = HeaderSlot {
        version: 1,
        top: 0,
        file_len: FILE_HDR_LEN,
    };
    header[SLOT_OFF[1] as usize..SLOT_OFF[1] as usize + SLOT_LEN]
        .copy_from_slice(&slot.encode());
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header)?;
    file.sync_all()?;
    Ok(())
}

fn read_newest_slot(file: &mut File) -> Result<HeaderSlot> {
    let mut header = vec![0u8; FILE_HDR_LEN as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut header)?;
    if header[0..8] != MAGIC {
        return Err(StrataError::Corruption("bad database magic"));
    }
    let slots = SLOT_OFF
        .iter()
        .filter_map(|&off| HeaderSlot::parse(&header[off as usize..off as usize + SLOT_LEN]));
    slots
        .max_by_key(|slot| slot.version)
        .ok_or(StrataError::Corruption("no valid header slot"))
}
