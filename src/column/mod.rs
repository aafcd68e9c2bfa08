//! Column specializations over the generic tree engine.
//!
//! A column is a root ref plus a kind tag kept in the owning table's spec.
//! Integer, float, double, and link columns share the integer leaf format
//! (float and double cells are stored as their IEEE-754 bit patterns, a
//! link cell is `0` for null, `target_row + 1` otherwise); string and
//! binary columns use the adaptive string leaves; link-list and backlink
//! columns are ref columns whose cells point at private row-index
//! sub-arrays.

pub mod link;
pub mod linklist;

use crate::arena::{Arena, Ref};
use crate::error::{Result, StrataError};
use crate::leaf::string::StrRepr;
use crate::tree::{IntCodec, RefCodec, StrCodec, Tree, TreeView};

/// Number of spec integers stored per column in a table's metadata.
pub const META_INTS: u64 = 4;

const FLAG_STRONG: i64 = 0x01;

/// Closed set of column kinds.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ColumnKind {
    /// `i64` cells.
    Int = 0,
    /// UTF-8 string cells.
    String = 1,
    /// Arbitrary byte-blob cells.
    Binary = 2,
    /// Single forward link to a row of another table.
    Link = 3,
    /// Ordered list of forward links to rows of another table.
    LinkList = 4,
    /// Inverse index maintained for one link or link-list column.
    Backlink = 5,
    /// `f32` cells, stored bit-exact in integer leaves.
    Float = 6,
    /// `f64` cells, stored bit-exact in integer leaves.
    Double = 7,
}

impl ColumnKind {
    /// Spec tag for this kind.
    pub fn tag(self) -> i64 {
        self as i64
    }

    /// Decodes a spec tag.
    pub fn from_tag(tag: i64) -> Result<Self> {
        Ok(match tag {
            0 => Self::Int,
            1 => Self::String,
            2 => Self::Binary,
            3 => Self::Link,
            4 => Self::LinkList,
            5 => Self::Backlink,
            6 => Self::Float,
            7 => Self::Double,
            _ => return Err(StrataError::Corruption("unknown column kind tag")),
        })
    }

    /// Whether cells of this kind reference rows of another table.
    pub fn is_link_kind(self) -> bool {
        matches!(self, Self::Link | Self::LinkList)
    }
}

/// Per-column metadata, serialized as [`META_INTS`] integers in the table
/// spec: `[kind, linked_table, linked_column, flags]`.
///
/// For link and link-list columns `linked_table` names the target table and
/// `linked_column` the backlink column maintained there. For backlink
/// columns the pair names the origin table and origin column instead.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ColumnSpec {
    /// Cell kind.
    pub kind: ColumnKind,
    /// Link target table, or backlink origin table.
    pub linked_table: u64,
    /// Backlink column in the target table, or origin column for backlinks.
    pub linked_column: u64,
    /// Strong link: removing the last strong referrer cascades.
    pub strong: bool,
}

impl ColumnSpec {
    /// Plain data column of `kind`.
    pub fn plain(kind: ColumnKind) -> Self {
        Self {
            kind,
            linked_table: 0,
            linked_column: 0,
            strong: false,
        }
    }

    /// Serializes into the table-spec integer quad.
    pub fn to_meta(self) -> [i64; META_INTS as usize] {
        let flags = if self.strong { FLAG_STRONG } else { 0 };
        [
            self.kind.tag(),
            self.linked_table as i64,
            self.linked_column as i64,
            flags,
        ]
    }

    /// Deserializes from the table-spec integer quad.
    pub fn from_meta(meta: &[i64]) -> Result<Self> {
        if meta.len() != META_INTS as usize {
            return Err(StrataError::Corruption("column spec quad length"));
        }
        Ok(Self {
            kind: ColumnKind::from_tag(meta[0])?,
            linked_table: meta[1] as u64,
            linked_column: meta[2] as u64,
            strong: meta[3] & FLAG_STRONG != 0,
        })
    }
}

/// Allocates the empty root for a new column of `kind`.
pub fn new_column_root(arena: &mut Arena, kind: ColumnKind) -> Result<Ref> {
    match kind {
        ColumnKind::Int | ColumnKind::Link | ColumnKind::Float | ColumnKind::Double => {
            Tree::create_empty(arena, &IntCodec::default())
        }
        ColumnKind::String => Tree::create_empty(arena, &StrCodec { repr: StrRepr::Small }),
        ColumnKind::Binary => Tree::create_empty(arena, &StrCodec { repr: StrRepr::Big }),
        ColumnKind::LinkList | ColumnKind::Backlink => Tree::create_empty(arena, &RefCodec),
    }
}

/// Representation currently used by a string column, read off its leftmost
/// leaf. Promotion rewrites every leaf, so one leaf speaks for all.
pub fn string_repr(arena: &Arena, root: Ref) -> Result<StrRepr> {
    let mut r = root;
    loop {
        let (header, payload) = arena.node(r)?;
        if !header.is_inner() {
            return StrRepr::from_kind(header.kind)
                .ok_or(StrataError::Corruption("string column leaf kind"));
        }
        if header.size == 0 {
            return Err(StrataError::Corruption("inner node without children"));
        }
        r = Ref::from_raw(crate::node::payload_ref(payload, 0)?);
    }
}

/// Rewrites a string column into a representation wide enough for
/// `needed_len`, returning the new root. The whole column is rebuilt, not
/// one leaf; the old tree is freed.
pub fn widen_string_column(arena: &mut Arena, root: Ref, needed_len: usize) -> Result<Ref> {
    let current = string_repr(arena, root)?;
    let needed = StrRepr::for_len(needed_len).max(current);
    if needed == current {
        return Ok(root);
    }
    let values = TreeView::new(arena, StrCodec { repr: current }, root).to_vec()?;
    arena.free_deep(root)?;
    let codec = StrCodec { repr: needed };
    let new_root = Tree::create_empty(arena, &codec)?;
    let mut tree = Tree::new(arena, codec, new_root);
    for value in values {
        tree.push(value)?;
    }
    Ok(tree.root())
}

/// Forward link cell encoding: `0` is null, otherwise `target_row + 1`.
pub fn encode_link_cell(target: Option<u64>) -> i64 {
    match target {
        None => 0,
        Some(row) => row as i64 + 1,
    }
}

/// Decodes a forward link cell.
pub fn decode_link_cell(cell: i64) -> Result<Option<u64>> {
    match cell {
        0 => Ok(None),
        n if n > 0 => Ok(Some(n as u64 - 1)),
        _ => Err(StrataError::Corruption("negative link cell")),
    }
}

/// Float cell encoding: the IEEE-754 bit pattern, zero-extended. Bit-exact,
/// so NaN payloads and signed zero survive a roundtrip.
pub fn encode_float_cell(value: f32) -> i64 {
    value.to_bits() as i64
}

/// Decodes a float cell.
pub fn decode_float_cell(cell: i64) -> f32 {
    f32::from_bits(cell as u32)
}

/// Double cell encoding: the IEEE-754 bit pattern reinterpreted.
pub fn encode_double_cell(value: f64) -> i64 {
    value.to_bits() as i64
}

/// Decodes a double cell.
pub fn decode_double_cell(cell: i64) -> f64 {
    f64::from_bits(cell as u64)
}
