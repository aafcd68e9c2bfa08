//! The three adaptive string/blob leaf representations.
//!
//! A string column starts in the small representation and is promoted to a
//! wider one the first time a value exceeds the current capacity. Promotion
//! rewrites the whole column (see `column::widen_string_column`), so a single
//! column never mixes representations.

use std::convert::TryFrom;

use crate::error::{Result, StrataError};
use crate::node::{self, NodeHeader, NodeKind};

/// Longest value (in bytes) storable in a small-string slot.
pub const SMALL_MAX: usize = 15;
/// Longest value storable in the medium (u32-offset) representation.
pub const MEDIUM_MAX: usize = 1024;

const SMALL_SLOT: usize = 16;

/// Which of the three leaf encodings a string column currently uses.
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum StrRepr {
    /// Fixed 16-byte slots, values up to [`SMALL_MAX`] bytes.
    Small,
    /// u32 end offsets plus a shared blob, values up to [`MEDIUM_MAX`] bytes.
    Medium,
    /// u64 end offsets plus a shared blob, unbounded values.
    Big,
}

impl StrRepr {
    /// Node kind used by leaves of this representation.
    pub fn kind(self) -> NodeKind {
        match self {
            StrRepr::Small => NodeKind::SmallStr,
            StrRepr::Medium => NodeKind::MediumStr,
            StrRepr::Big => NodeKind::BigBlob,
        }
    }

    /// Representation required for a value of `len` bytes.
    pub fn for_len(len: usize) -> Self {
        if len <= SMALL_MAX {
            StrRepr::Small
        } else if len <= MEDIUM_MAX {
            StrRepr::Medium
        } else {
            StrRepr::Big
        }
    }

    /// Whether a value of `len` bytes fits this representation.
    pub fn fits(self, len: usize) -> bool {
        match self {
            StrRepr::Small => len <= SMALL_MAX,
            StrRepr::Medium => len <= MEDIUM_MAX,
            StrRepr::Big => true,
        }
    }

    /// Representation for a given leaf node kind, if it is a string kind.
    pub fn from_kind(kind: NodeKind) -> Option<Self> {
        match kind {
            NodeKind::SmallStr => Some(StrRepr::Small),
            NodeKind::MediumStr => Some(StrRepr::Medium),
            NodeKind::BigBlob => Some(StrRepr::Big),
            _ => None,
        }
    }
}

/// Builds a complete string/blob leaf node from `values`.
///
/// Fails with `Corruption` if any value exceeds the representation: the
/// column layer is responsible for promoting before encoding.
pub fn encode_str_leaf(repr: StrRepr, values: &[Vec<u8>], context: bool) -> Result<Vec<u8>> {
    for value in values {
        if !repr.fits(value.len()) {
            return Err(StrataError::Corruption(
                "string exceeds leaf representation",
            ));
        }
    }
    let extra = if context { node::flags::CONTEXT } else { 0 };
    let size = values.len() as u32;
    let payload = match repr {
        StrRepr::Small => {
            let mut payload = vec![0u8; values.len() * SMALL_SLOT];
            for (i, value) in values.iter().enumerate() {
                let slot = &mut payload[i * SMALL_SLOT..(i + 1) * SMALL_SLOT];
                slot[0] = value.len() as u8;
                slot[1..1 + value.len()].copy_from_slice(value);
            }
            payload
        }
        StrRepr::Medium => {
            let mut payload = Vec::new();
            let mut end = 0u32;
            for value in values {
                end = end
                    .checked_add(value.len() as u32)
                    .ok_or(StrataError::Corruption("medium string blob overflow"))?;
                payload.extend_from_slice(&end.to_be_bytes());
            }
            for value in values {
                payload.extend_from_slice(value);
            }
            payload
        }
        StrRepr::Big => {
            let mut payload = Vec::new();
            let mut end = 0u64;
            for value in values {
                end += value.len() as u64;
                payload.extend_from_slice(&end.to_be_bytes());
            }
            for value in values {
                payload.extend_from_slice(value);
            }
            payload
        }
    };
    let width = if repr == StrRepr::Small {
        SMALL_SLOT as u8
    } else {
        0
    };
    Ok(node::build_node(repr.kind(), extra, width, size, &payload))
}

/// Unpacks a string/blob leaf payload into owned values.
pub fn decode_str_leaf(header: &NodeHeader, payload: &[u8]) -> Result<Vec<Vec<u8>>> {
    let repr = StrRepr::from_kind(header.kind)
        .ok_or(StrataError::Corruption("expected string leaf"))?;
    let size = header.size as usize;
    match repr {
        StrRepr::Small => {
            if payload.len() != size * SMALL_SLOT {
                return Err(StrataError::Corruption("small string payload length"));
            }
            let mut values = Vec::with_capacity(size);
            for slot in payload.chunks_exact(SMALL_SLOT) {
                let len = slot[0] as usize;
                if len > SMALL_MAX {
                    return Err(StrataError::Corruption("small string slot length"));
                }
                values.push(slot[1..1 + len].to_vec());
            }
            Ok(values)
        }
        StrRepr::Medium => decode_offset_blob(payload, size, 4),
        StrRepr::Big => decode_offset_blob(payload, size, 8),
    }
}

fn decode_offset_blob(payload: &[u8], size: usize, offset_width: usize) -> Result<Vec<Vec<u8>>> {
    let table_len = size * offset_width;
    if payload.len() < table_len {
        return Err(StrataError::Corruption("string offset table truncated"));
    }
    let blob = &payload[table_len..];
    let mut values = Vec::with_capacity(size);
    let mut start = 0usize;
    for i in 0..size {
        let entry = &payload[i * offset_width..(i + 1) * offset_width];
        let end = if offset_width == 4 {
            u32::from_be_bytes(<[u8; 4]>::try_from(entry).expect("4-byte entry")) as u64
        } else {
            u64::from_be_bytes(<[u8; 8]>::try_from(entry).expect("8-byte entry"))
        };
        let end = usize::try_from(end)
            .map_err(|_| StrataError::Corruption("string offset exceeds usize"))?;
        if end < start || end > blob.len() {
            return Err(StrataError::Corruption("string offsets out of order"));
        }
        values.push(blob[start..end].to_vec());
        start = end;
    }
    Ok(values)
}
