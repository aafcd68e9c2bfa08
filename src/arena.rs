//! Versioned node memory: refs, the write arena, and copy-on-write.
//!
//! A [`Ref`] is an opaque location token. Committed nodes live in the
//! read-only base image (the mapped database file) and are addressed by byte
//! offset; nodes created by the active write transaction live in the write
//! arena and are addressed by a tagged slot index. Only the arena translates
//! a ref to bytes, and only transient nodes may ever be mutated in place;
//! shared committed nodes are copied first, which is what lets concurrent
//! readers keep using old nodes while the writer edits a structurally
//! identical new set.

use std::sync::Arc;

use memmap2::Mmap;

use crate::error::{LogicError, Result, StrataError};
use crate::node::{self, NodeHeader};

const TRANSIENT_BIT: u64 = 1 << 63;

/// Opaque versioned location token for a node. Zero means "absent".
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct Ref(u64);

impl Ref {
    /// Returns the null ref.
    pub const fn null() -> Self {
        Ref(0)
    }

    /// Returns `true` when this ref addresses no node.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` when this ref addresses write-transaction memory.
    pub const fn is_transient(self) -> bool {
        (self.0 & TRANSIENT_BIT) != 0
    }

    /// Builds a committed ref from a file byte offset.
    pub fn from_offset(offset: u64) -> Self {
        debug_assert!(offset & TRANSIENT_BIT == 0, "offset collides with tag");
        Ref(offset)
    }

    fn transient(slot: usize) -> Self {
        Ref(TRANSIENT_BIT | (slot as u64 + 1))
    }

    fn slot(self) -> usize {
        ((self.0 & !TRANSIENT_BIT) - 1) as usize
    }

    /// Raw integer form, used only for serialization inside node payloads.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Rebuilds a ref from its raw serialized form.
    pub const fn from_raw(raw: u64) -> Self {
        Ref(raw)
    }
}

/// Immutable committed image backing an arena.
#[derive(Clone)]
pub enum BaseImage {
    /// Memory-only database image.
    Mem(Arc<Vec<u8>>),
    /// Memory-mapped database file.
    Mapped(Arc<Mmap>),
}

impl BaseImage {
    /// The committed bytes.
    pub fn as_slice(&self) -> &[u8] {
        match self {
            BaseImage::Mem(buf) => buf.as_slice(),
            BaseImage::Mapped(map) => map,
        }
    }

    /// Total committed length in bytes.
    pub fn len(&self) -> u64 {
        self.as_slice().len() as u64
    }

    /// Whether the image holds no bytes at all.
    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }
}

struct WriteArena {
    slots: Vec<Option<Vec<u8>>>,
    free: Vec<usize>,
    bytes: usize,
    budget: usize,
}

impl WriteArena {
    fn new(budget: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            bytes: 0,
            budget,
        }
    }

    fn store(&mut self, node: Vec<u8>) -> Result<Ref> {
        if self.bytes.saturating_add(node.len()) > self.budget {
            return Err(StrataError::OutOfMemory(
                "write transaction exceeded its transient budget",
            ));
        }
        self.bytes += node.len();
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                slot
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        Ok(Ref::transient(slot))
    }

    fn get(&self, r: Ref) -> Result<&[u8]> {
        self.slots
            .get(r.slot())
            .and_then(|slot| slot.as_deref())
            .ok_or(StrataError::Corruption("transient ref already released"))
    }

    fn replace(&mut self, r: Ref, node: Vec<u8>) -> Result<()> {
        let slot = self
            .slots
            .get_mut(r.slot())
            .ok_or(StrataError::Corruption("transient ref out of range"))?;
        let old = slot
            .take()
            .ok_or(StrataError::Corruption("transient ref already released"))?;
        let new_bytes = self.bytes - old.len() + node.len();
        if new_bytes > self.budget {
            *slot = Some(old);
            return Err(StrataError::OutOfMemory(
                "write transaction exceeded its transient budget",
            ));
        }
        self.bytes = new_bytes;
        *slot = Some(node);
        Ok(())
    }

    fn release(&mut self, r: Ref) {
        if let Some(slot) = self.slots.get_mut(r.slot()) {
            if let Some(node) = slot.take() {
                self.bytes -= node.len();
                self.free.push(r.slot());
            }
        }
    }
}

/// Translates refs to node bytes and owns the write-side transient memory.
pub struct Arena {
    base: BaseImage,
    write: Option<WriteArena>,
    freed_committed: u64,
}

impl Arena {
    /// Arena for a read transaction: translation only, no mutation.
    pub fn for_read(base: BaseImage) -> Self {
        Self {
            base,
            write: None,
            freed_committed: 0,
        }
    }

    /// Arena for a write transaction with a transient allocation budget.
    pub fn for_write(base: BaseImage, budget: usize) -> Self {
        Self {
            base,
            write: Some(WriteArena::new(budget)),
            freed_committed: 0,
        }
    }

    /// Full node bytes (header and payload) for `r`.
    pub fn node_bytes(&self, r: Ref) -> Result<&[u8]> {
        if r.is_null() {
            return Err(StrataError::Corruption("null ref dereferenced"));
        }
        if r.is_transient() {
            let write = self
                .write
                .as_ref()
                .ok_or(StrataError::Corruption("transient ref in read snapshot"))?;
            return write.get(r);
        }
        let image = self.base.as_slice();
        let offset = r.raw() as usize;
        if offset >= image.len() {
            return Err(StrataError::Corruption("ref beyond committed image"));
        }
        let len = node::node_len(&image[offset..])?;
        if offset + len > image.len() {
            return Err(StrataError::Corruption("node extends beyond image"));
        }
        Ok(&image[offset..offset + len])
    }

    /// Parses the node at `r`, returning its header and payload.
    pub fn node(&self, r: Ref) -> Result<(NodeHeader, &[u8])> {
        node::parse_node(self.node_bytes(r)?)
    }

    /// Stores a freshly built node in the write arena.
    pub fn store(&mut self, bytes: Vec<u8>) -> Result<Ref> {
        self.write_mut()?.store(bytes)
    }

    /// Replaces the contents of a transient node in place.
    pub fn replace(&mut self, r: Ref, bytes: Vec<u8>) -> Result<()> {
        if !r.is_transient() {
            return Err(LogicError::DetachedAccessor.into());
        }
        self.write_mut()?.replace(r, bytes)
    }

    /// Copy-on-write: returns `r` unchanged when it is already transient,
    /// otherwise copies the committed node into the write arena.
    pub fn cow(&mut self, r: Ref) -> Result<Ref> {
        if r.is_transient() {
            return Ok(r);
        }
        let bytes = self.node_bytes(r)?.to_vec();
        self.freed_committed += bytes.len() as u64;
        self.write_mut()?.store(bytes)
    }

    /// Shallow release of one node. Transient nodes are physically freed;
    /// committed nodes are only counted as reclaimable slack, since readers
    /// pinned to older versions may still reach them.
    pub fn free(&mut self, r: Ref) {
        if r.is_null() {
            return;
        }
        if r.is_transient() {
            if let Some(write) = self.write.as_mut() {
                write.release(r);
            }
        } else {
            let len = self.node_bytes(r).map(|b| b.len() as u64).unwrap_or(0);
            self.freed_committed += len;
        }
    }

    /// Recursively releases a whole subtree.
    pub fn free_deep(&mut self, r: Ref) -> Result<()> {
        if r.is_null() {
            return Ok(());
        }
        let (header, payload) = self.node(r)?;
        if header.has_refs() {
            let mut children = Vec::with_capacity(header.size as usize);
            for i in 0..header.size as usize {
                children.push(Ref::from_raw(node::payload_ref(payload, i)?));
            }
            for child in children {
                self.free_deep(child)?;
            }
        }
        self.free(r);
        Ok(())
    }

    /// Deep copy of a committed subtree into the write arena. Used by
    /// compaction to rewrite the live snapshot into a fresh file.
    pub fn cow_deep(&mut self, r: Ref) -> Result<Ref> {
        if r.is_null() {
            return Ok(Ref::null());
        }
        let (header, payload) = self.node(r)?;
        if !header.has_refs() {
            let bytes = self.node_bytes(r)?.to_vec();
            return self.write_mut()?.store(bytes);
        }
        let mut children = Vec::with_capacity(header.size as usize);
        for i in 0..header.size as usize {
            children.push(Ref::from_raw(node::payload_ref(payload, i)?));
        }
        let mut bytes = self.node_bytes(r)?.to_vec();
        for (i, child) in children.into_iter().enumerate() {
            let copied = self.cow_deep(child)?;
            node::patch_ref(&mut bytes, i, copied.raw())?;
        }
        self.write_mut()?.store(bytes)
    }

    /// Bytes of committed nodes logically freed by this transaction. Folded
    /// into the database's reclaimable-slack accounting at commit.
    pub fn freed_committed_bytes(&self) -> u64 {
        self.freed_committed
    }

    /// Bytes currently held by transient nodes.
    pub fn transient_bytes(&self) -> usize {
        self.write.as_ref().map(|w| w.bytes).unwrap_or(0)
    }

    /// Drops every transient allocation. The rollback path; cannot fail.
    pub fn discard_writes(&mut self) {
        if let Some(write) = self.write.as_mut() {
            let budget = write.budget;
            *write = WriteArena::new(budget);
        }
    }

    /// Serializes every transient node reachable from `top` bottom-up,
    /// appending each to the committed image via `append` (which returns the
    /// assigned byte offset) and rewriting child refs so the committed image
    /// never contains transient tags. Returns the committed ref of `top`.
    pub fn flush<A>(&mut self, top: Ref, append: &mut A) -> Result<Ref>
    where
        A: FnMut(&[u8]) -> Result<u64>,
    {
        if top.is_null() || !top.is_transient() {
            return Ok(top);
        }
        let (header, payload) = self.node(top)?;
        let mut bytes;
        if header.has_refs() {
            let mut children = Vec::with_capacity(header.size as usize);
            for i in 0..header.size as usize {
                children.push(Ref::from_raw(node::payload_ref(payload, i)?));
            }
            bytes = self.node_bytes(top)?.to_vec();
            for (i, child) in children.into_iter().enumerate() {
                let flushed = self.flush(child, append)?;
                node::patch_ref(&mut bytes, i, flushed.raw())?;
            }
        } else {
            bytes = self.node_bytes(top)?.to_vec();
        }
        let offset = append(&bytes)?;
        if let Some(write) = self.write.as_mut() {
            write.release(top);
        }
        Ok(Ref::from_offset(offset))
    }

    fn write_mut(&mut self) -> Result<&mut WriteArena> {
        self.write
            .as_mut()
            .ok_or_else(|| LogicError::TransactionState.into())
    }
}
