//! Flat ref-array leaves.
//!
//! Used in two roles: directory nodes (table list, column roots, table spec)
//! and B+-tree leaves whose elements are sub-array roots (link lists and
//! backlinks keep one private row-index array per row).

use crate::arena::Ref;
use crate::error::{Result, StrataError};
use crate::node::{self, NodeHeader, NodeKind};

/// Builds a complete ref-array node from `values`. Null refs are legal
/// entries (an absent sub-array).
pub fn encode_ref_leaf(values: &[Ref], context: bool) -> Vec<u8> {
    let mut payload = Vec::with_capacity(values.len() * 8);
    for r in values {
        payload.extend_from_slice(&r.raw().to_be_bytes());
    }
    let extra = if context { node::flags::CONTEXT } else { 0 };
    node::build_node(NodeKind::Refs, extra, 8, values.len() as u32, &payload)
}

/// Unpacks a ref-array payload.
pub fn decode_ref_leaf(header: &NodeHeader, payload: &[u8]) -> Result<Vec<Ref>> {
    if header.kind != NodeKind::Refs {
        return Err(StrataError::Corruption("expected ref leaf"));
    }
    let size = header.size as usize;
    if payload.len() != size * 8 {
        return Err(StrataError::Corruption("ref leaf payload length"));
    }
    let mut values = Vec::with_capacity(size);
    for i in 0..size {
        values.push(Ref::from_raw(node::payload_ref(payload, i)?));
    }
    Ok(values)
}
