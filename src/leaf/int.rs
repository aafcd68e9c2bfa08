//! Packed fixed-width integer leaves.
//!
//! Values are stored big-endian at the narrowest byte width (1, 2, 4 or 8)
//! that covers every element; the width is recorded in the node header and
//! re-derived on every rewrite, so a leaf shrinks back down when wide values
//! are erased.

use crate::error::{Result, StrataError};
use crate::node::{self, NodeHeader, NodeKind};

/// Legal element widths in bytes for an integer leaf.
pub(crate) const WIDTHS: [u8; 4] = [1, 2, 4, 8];

/// Narrowest width in bytes that represents `value` as a signed integer.
pub fn width_for(value: i64) -> u8 {
    if (i8::MIN as i64..=i8::MAX as i64).contains(&value) {
        1
    } else if (i16::MIN as i64..=i16::MAX as i64).contains(&value) {
        2
    } else if (i32::MIN as i64..=i32::MAX as i64).contains(&value) {
        4
    } else {
        8
    }
}

/// Builds a complete integer leaf node from `values`.
pub fn encode_int_leaf(values: &[i64], context: bool) -> Vec<u8> {
    let width = values.iter().copied().map(width_for).max().unwrap_or(1);
    let mut payload = Vec::with_capacity(values.len() * width as usize);
    for &value in values {
        let be = value.to_be_bytes();
        payload.extend_from_slice(&be[8 - width as usize..]);
    }
    let extra = if context { node::flags::CONTEXT } else { 0 };
    node::build_node(NodeKind::Int, extra, width, values.len() as u32, &payload)
}

/// Unpacks an integer leaf payload, sign-extending each element.
pub fn decode_int_leaf(header: &NodeHeader, payload: &[u8]) -> Result<Vec<i64>> {
    if header.kind != NodeKind::Int {
        return Err(StrataError::Corruption("expected integer leaf"));
    }
    let width = header.width as usize;
    if !WIDTHS.contains(&header.width) {
        return Err(StrataError::Corruption("invalid integer leaf width"));
    }
    let expected = header.size as usize * width;
    if payload.len() != expected {
        return Err(StrataError::Corruption("integer leaf payload length"));
    }
    let mut values = Vec::with_capacity(header.size as usize);
    for chunk in payload.chunks_exact(width) {
        let negative = chunk[0] & 0x80 != 0;
        let mut buf = if negative { [0xFFu8; 8] } else { [0u8; 8] };
        buf[8 - width..].copy_from_slice(chunk);
        values.push(i64::from_be_bytes(buf));
    }
    Ok(values)
}
