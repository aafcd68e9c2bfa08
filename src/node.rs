//! Packed binary node format.
//!
//! Every on-disk structure (integer arrays, string tables, inner B+-tree
//! nodes, table directories) is stored as a node: a 16-byte header followed
//! by a payload. Nodes address each other by [`crate::arena::Ref`] tokens,
//! never by native pointers; only the arena translates a ref to bytes.

use std::convert::TryFrom;

use crate::error::{Result, StrataError};

/// Length of the fixed node header in bytes.
pub const NODE_HDR_LEN: usize = 16;

const KIND_OFFSET: usize = 0;
const FLAGS_OFFSET: usize = 1;
const WIDTH_OFFSET: usize = 2;
const SIZE_OFFSET: usize = 4;
const PAYLOAD_LEN_OFFSET: usize = 8;
const CRC_OFFSET: usize = 12;

/// Node payload encodings.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NodeKind {
    /// Inner B+-tree node: `size` child refs followed by `size` cumulative
    /// element counts, both u64 big-endian.
    Inner = 1,
    /// Flat array of child refs (`size` u64 entries). Used for table
    /// directories and for leaves whose elements are sub-array roots.
    Refs = 2,
    /// Packed fixed-width signed integers (`width` bytes per element).
    Int = 3,
    /// Small strings in fixed 16-byte slots (`[len:u8][15 data bytes]`).
    SmallStr = 4,
    /// Medium strings: `size` u32 end offsets followed by the blob bytes.
    MediumStr = 5,
    /// Large blobs: `size` u64 end offsets followed by the blob bytes.
    BigBlob = 6,
}

impl NodeKind {
    /// Returns `true` when payload elements are child refs that the arena
    /// must chase during deep free and commit flush.
    pub fn has_refs(self) -> bool {
        matches!(self, NodeKind::Inner | NodeKind::Refs)
    }
}

impl TryFrom<u8> for NodeKind {
    type Error = StrataError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(NodeKind::Inner),
            2 => Ok(NodeKind::Refs),
            3 => Ok(NodeKind::Int),
            4 => Ok(NodeKind::SmallStr),
            5 => Ok(NodeKind::MediumStr),
            6 => Ok(NodeKind::BigBlob),
            _ => Err(StrataError::Corruption("unknown node kind")),
        }
    }
}

/// Node header flags.
pub mod flags {
    /// Payload elements are child refs.
    pub const HAS_REFS: u8 = 0x01;
    /// Node is an inner B+-tree node.
    pub const INNER: u8 = 0x02;
    /// Payload is auxiliary metadata (table specs, directories) rather than
    /// column data.
    pub const CONTEXT: u8 = 0x04;
}

/// Decoded node header.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NodeHeader {
    /// Payload encoding.
    pub kind: NodeKind,
    /// Flag bits from [`flags`].
    pub flags: u8,
    /// Element width in bytes for fixed-width payloads, zero otherwise.
    pub width: u8,
    /// Logical element count.
    pub size: u32,
    /// Payload length in bytes.
    pub payload_len: u32,
}

impl NodeHeader {
    /// Returns `true` when the payload begins with `size` child refs.
    pub fn has_refs(&self) -> bool {
        (self.flags & flags::HAS_REFS) != 0
    }

    /// Returns `true` for inner B+-tree nodes.
    pub fn is_inner(&self) -> bool {
        (self.flags & flags::INNER) != 0
    }

    /// Returns `true` for context (metadata) nodes.
    pub fn is_context(&self) -> bool {
        (self.flags & flags::CONTEXT) != 0
    }
}

/// Builds a complete node (header + payload) into an owned buffer.
///
/// The `HAS_REFS` and `INNER` flag bits are derived from `kind`; callers only
/// supply `CONTEXT` through `extra_flags`.
pub fn build_node(kind: NodeKind, extra_flags: u8, width: u8, size: u32, payload: &[u8]) -> Vec<u8> {
    let mut node_flags = extra_flags & flags::CONTEXT;
    if kind.has_refs() {
        node_flags |= flags::HAS_REFS;
    }
    if kind == NodeKind::Inner {
        node_flags |= flags::INNER;
    }
    let mut out = Vec::with_capacity(NODE_HDR_LEN + payload.len());
    out.push(kind as u8);
    out.push(node_flags);
    out.push(width);
    out.push(0);
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&crc32fast::hash(payload).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Parses a node at the start of `bytes`, verifying lengths and the payload
/// checksum. Returns the header and the payload slice.
pub fn parse_node(bytes: &[u8]) -> Result<(NodeHeader, &[u8])> {
    if bytes.len() < NODE_HDR_LEN {
        return Err(StrataError::Corruption("node shorter than header"));
    }
    let kind = NodeKind::try_from(bytes[KIND_OFFSET])?;
    let node_flags = bytes[FLAGS_OFFSET];
    if bytes[3] != 0 {
        return Err(StrataError::Corruption("node header pad byte not zero"));
    }
    let width = bytes[WIDTH_OFFSET];
    let size = read_u32(bytes, SIZE_OFFSET);
    let payload_len = read_u32(bytes, PAYLOAD_LEN_OFFSET);
    let crc = read_u32(bytes, CRC_OFFSET);
    let end = NODE_HDR_LEN
        .checked_add(payload_len as usize)
        .ok_or(StrataError::Corruption("node payload length overflow"))?;
    if bytes.len() < end {
        return Err(StrataError::Corruption("node payload truncated"));
    }
    let payload = &bytes[NODE_HDR_LEN..end];
    if crc32fast::hash(payload) != crc {
        return Err(StrataError::Corruption("node payload checksum mismatch"));
    }
    let header = NodeHeader {
        kind,
        flags: node_flags,
        width,
        size,
        payload_len,
    };
    if header.has_refs() != kind.has_refs() || header.is_inner() != (kind == NodeKind::Inner) {
        return Err(StrataError::Corruption("node flags disagree with kind"));
    }
    if kind.has_refs() && (payload.len() < size as usize * 8) {
        return Err(StrataError::Corruption("ref payload shorter than size"));
    }
    Ok((header, payload))
}

/// Total encoded length of the node at the start of `bytes`.
pub fn node_len(bytes: &[u8]) -> Result<usize> {
    if bytes.len() < NODE_HDR_LEN {
        return Err(StrataError::Corruption("node shorter than header"));
    }
    let payload_len = read_u32(bytes, PAYLOAD_LEN_OFFSET) as usize;
    NODE_HDR_LEN
        .checked_add(payload_len)
        .ok_or(StrataError::Corruption("node payload length overflow"))
}

/// Reads the `index`-th child ref (raw u64) from a `HAS_REFS` payload.
pub fn payload_ref(payload: &[u8], index: usize) -> Result<u64> {
    let start = index * 8;
    let end = start + 8;
    if end > payload.len() {
        return Err(StrataError::Corruption("child ref outside payload"));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&payload[start..end]);
    Ok(u64::from_be_bytes(buf))
}

/// Overwrites the `index`-th child ref inside a full node buffer and refreshes
/// the payload checksum. Used by the commit flush when transient child refs
/// are rewritten to their final file offsets.
pub fn patch_ref(node: &mut [u8], index: usize, raw: u64) -> Result<()> {
    let start = NODE_HDR_LEN + index * 8;
    let end = start + 8;
    if end > node.len() {
        return Err(StrataError::Corruption("child ref outside node"));
    }
    node[start..end].copy_from_slice(&raw.to_be_bytes());
    refresh_crc(node)
}

/// Recomputes the payload checksum of a full node buffer after mutation.
pub fn refresh_crc(node: &mut [u8]) -> Result<()> {
    if node.len() < NODE_HDR_LEN {
        return Err(StrataError::Corruption("node shorter than header"));
    }
    let crc = crc32fast::hash(&node[NODE_HDR_LEN..]);
    node[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_be_bytes());
    Ok(())
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_be_bytes(buf)
}
