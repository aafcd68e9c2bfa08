//! Generic B+-tree structural engine.
//!
//! One insert/erase/split/merge algorithm serves every column type; the leaf
//! payload behavior is supplied by a [`LeafCodec`] strategy (a closed set:
//! integers, refs, strings). Inner nodes store child refs plus cumulative
//! element counts, so positional lookup walks one child per level.
//!
//! Balance invariants: all leaves under one root share a depth; inner nodes
//! hold between [`MIN_FANOUT`] and [`MAX_FANOUT`] children (the root may
//! hold fewer); leaves split at [`LEAF_MAX`] elements and are merged or
//! rebalanced below [`LEAF_MIN`]. Splits and merges propagate exactly as far
//! up as needed. These bounds are fixed constants; only performance, not
//! correctness, depends on their exact values.

use smallvec::SmallVec;

use crate::arena::{Arena, Ref};
use crate::error::{LogicError, Result, StrataError};
use crate::leaf::int::{decode_int_leaf, encode_int_leaf};
use crate::leaf::refs::{decode_ref_leaf, encode_ref_leaf};
use crate::leaf::string::{decode_str_leaf, encode_str_leaf, StrRepr};
use crate::node::{self, NodeHeader, NodeKind};

/// Maximum children per inner node; an inner node splits past this.
pub const MAX_FANOUT: usize = 32;
/// Minimum children per non-root inner node.
pub const MIN_FANOUT: usize = 4;
/// Maximum elements per leaf; a leaf splits past this.
pub const LEAF_MAX: usize = 128;
/// Leaves below this are merged with or rebalanced against a sibling.
pub const LEAF_MIN: usize = 32;

/// Leaf-type strategy: how leaf payloads encode, decode, and bound values.
pub trait LeafCodec: Copy {
    /// Owned element type.
    type Value: Clone + PartialEq + std::fmt::Debug;

    /// Builds a complete leaf node from `values`.
    fn encode_leaf(&self, values: &[Self::Value]) -> Result<Vec<u8>>;

    /// Unpacks a leaf payload.
    fn decode_leaf(&self, header: &NodeHeader, payload: &[u8]) -> Result<Vec<Self::Value>>;

    /// Whether `value` fits this codec's current representation. Callers
    /// must widen the representation before inserting values that do not.
    fn fits(&self, _value: &Self::Value) -> bool {
        true
    }

    /// Default element used when rows are inserted without a value.
    fn default_value(&self) -> Self::Value;
}

/// Fixed-width integer leaves ([`crate::leaf::int`]).
#[derive(Copy, Clone, Debug, Default)]
pub struct IntCodec {
    /// Mark leaves as context (auxiliary metadata) nodes.
    pub context: bool,
}

impl LeafCodec for IntCodec {
    type Value = i64;

    fn encode_leaf(&self, values: &[i64]) -> Result<Vec<u8>> {
        Ok(encode_int_leaf(values, self.context))
    }

    fn decode_leaf(&self, header: &NodeHeader, payload: &[u8]) -> Result<Vec<i64>> {
        decode_int_leaf(header, payload)
    }

    fn default_value(&self) -> i64 {
        0
    }
}

/// Ref-array leaves: elements are sub-array roots ([`crate::leaf::refs`]).
#[derive(Copy, Clone, Debug, Default)]
pub struct RefCodec;

impl LeafCodec for RefCodec {
    type Value = Ref;

    fn encode_leaf(&self, values: &[Ref]) -> Result<Vec<u8>> {
        Ok(encode_ref_leaf(values, false))
    }

    fn decode_leaf(&self, header: &NodeHeader, payload: &[u8]) -> Result<Vec<Ref>> {
        decode_ref_leaf(header, payload)
    }

    fn default_value(&self) -> Ref {
        Ref::null()
    }
}

/// String/blob leaves in one fixed representation
/// ([`crate::leaf::string`]).
#[derive(Copy, Clone, Debug)]
pub struct StrCodec {
    /// Representation every leaf of the column currently uses.
    pub repr: StrRepr,
}

impl LeafCodec for StrCodec {
    type Value = Vec<u8>;

    fn encode_leaf(&self, values: &[Vec<u8>]) -> Result<Vec<u8>> {
        encode_str_leaf(self.repr, values, false)
    }

    fn decode_leaf(&self, header: &NodeHeader, payload: &[u8]) -> Result<Vec<Vec<u8>>> {
        decode_str_leaf(header, payload)
    }

    fn fits(&self, value: &Vec<u8>) -> bool {
        self.repr.fits(value.len())
    }

    fn default_value(&self) -> Vec<u8> {
        Vec::new()
    }
}

/// Shape summary used by balance assertions and diagnostics.
#[derive(Clone, Debug, Default)]
pub struct TreeStats {
    /// Levels from root to leaves (a lone leaf root has depth 1).
    pub depth: usize,
    /// Number of leaf nodes.
    pub leaf_count: u64,
    /// Total elements.
    pub element_count: u64,
    /// Whether every leaf sits at the same depth.
    pub uniform_depth: bool,
    /// Smallest leaf occupancy observed.
    pub min_leaf_len: usize,
    /// Largest leaf occupancy observed.
    pub max_leaf_len: usize,
    /// Largest inner-node fanout observed.
    pub max_fanout: usize,
}

struct Inner {
    children: Vec<Ref>,
    counts: Vec<u64>,
}

impl Inner {
    fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    fn decode(header: &NodeHeader, payload: &[u8]) -> Result<Self> {
        if header.kind != NodeKind::Inner {
            return Err(StrataError::Corruption("expected inner node"));
        }
        let size = header.size as usize;
        if payload.len() != size * 16 {
            return Err(StrataError::Corruption("inner node payload length"));
        }
        let mut children = Vec::with_capacity(size);
        let mut counts = Vec::with_capacity(size);
        let mut prev = 0u64;
        for i in 0..size {
            children.push(Ref::from_raw(node::payload_ref(payload, i)?));
            let cumulative = node::payload_ref(payload, size + i)?;
            if cumulative < prev {
                return Err(StrataError::Corruption("inner counts not monotonic"));
            }
            counts.push(cumulative - prev);
            prev = cumulative;
        }
        Ok(Self { children, counts })
    }

    fn encode(&self) -> Vec<u8> {
        let size = self.children.len();
        let mut payload = Vec::with_capacity(size * 16);
        for child in &self.children {
            payload.extend_from_slice(&child.raw().to_be_bytes());
        }
        let mut cumulative = 0u64;
        for count in &self.counts {
            cumulative += count;
            payload.extend_from_slice(&cumulative.to_be_bytes());
        }
        node::build_node(NodeKind::Inner, 0, 0, size as u32, &payload)
    }

    /// Child owning `index`, with the index local to that child. An index
    /// equal to the total lands in the last child (append position).
    fn locate(&self, index: u64) -> Result<(usize, u64)> {
        let mut remaining = index;
        for (i, &count) in self.counts.iter().enumerate() {
            if remaining < count {
                return Ok((i, remaining));
            }
            remaining -= count;
        }
        match self.counts.len() {
            0 => Err(StrataError::Corruption("inner node without children")),
            n if remaining == 0 => Ok((n - 1, self.counts[n - 1])),
            _ => Err(StrataError::Corruption("index beyond inner node counts")),
        }
    }
}

/// Read-only positional access to a tree, usable from pinned snapshots.
pub struct TreeView<'a, C: LeafCodec> {
    arena: &'a Arena,
    codec: C,
    root: Ref,
}

impl<'a, C: LeafCodec> TreeView<'a, C> {
    /// Views an existing tree without write access.
    pub fn new(arena: &'a Arena, codec: C, root: Ref) -> Self {
        Self { arena, codec, root }
    }

    /// Total element count. O(1): a leaf root's header size, or the last
    /// cumulative count of an inner root.
    pub fn size(&self) -> Result<u64> {
        self.subtree_count(self.root)
    }

    /// Value at `index`. Walks one child per level.
    pub fn get(&self, index: u64) -> Result<C::Value> {
        if index >= self.size()? {
            return Err(LogicError::IndexOutOfRange.into());
        }
        self.get_rec(self.root, index)
    }

    fn get_rec(&self, r: Ref, index: u64) -> Result<C::Value> {
        let (header, payload) = self.arena.node(r)?;
        if header.is_inner() {
            let inner = Inner::decode(&header, payload)?;
            let (child, local) = inner.locate(index)?;
            return self.get_rec(inner.children[child], local);
        }
        let values = self.codec.decode_leaf(&header, payload)?;
        values
            .get(index as usize)
            .cloned()
            .ok_or(StrataError::Corruption("leaf shorter than counted"))
    }

    /// Index of the first element equal to `value`, scanning leaves in
    /// order. Columns without a search index fall back to this.
    pub fn find_first(&self, value: &C::Value) -> Result<Option<u64>> {
        self.find_rec(self.root, 0, value)
    }

    fn find_rec(&self, r: Ref, base: u64, value: &C::Value) -> Result<Option<u64>> {
        let (header, payload) = self.arena.node(r)?;
        if header.is_inner() {
            let inner = Inner::decode(&header, payload)?;
            let mut offset = base;
            for (child, &count) in inner.children.iter().zip(inner.counts.iter()) {
                if let Some(found) = self.find_rec(*child, offset, value)? {
                    return Ok(Some(found));
                }
                offset += count;
            }
            return Ok(None);
        }
        let values = self.codec.decode_leaf(&header, payload)?;
        Ok(values.iter().position(|v| v == value).map(|p| base + p as u64))
    }

    /// Collects every element in order. Used by representation promotion,
    /// compaction checks, and tests.
    pub fn to_vec(&self) -> Result<Vec<C::Value>> {
        let mut out = Vec::new();
        self.collect_rec(self.root, &mut out)?;
        Ok(out)
    }

    fn collect_rec(&self, r: Ref, out: &mut Vec<C::Value>) -> Result<()> {
        let (header, payload) = self.arena.node(r)?;
        if header.is_inner() {
            let inner = Inner::decode(&header, payload)?;
            for child in inner.children {
                self.collect_rec(child, out)?;
            }
            return Ok(());
        }
        out.extend(self.codec.decode_leaf(&header, payload)?);
        Ok(())
    }

    /// Shape summary for balance assertions.
    pub fn stats(&self) -> Result<TreeStats> {
        let mut stats = TreeStats {
            uniform_depth: true,
            min_leaf_len: usize::MAX,
            ..TreeStats::default()
        };
        let mut leaf_depth = None;
        self.stats_rec(self.root, 1, &mut stats, &mut leaf_depth)?;
        if stats.leaf_count == 0 {
            stats.min_leaf_len = 0;
        }
        stats.depth = leaf_depth.unwrap_or(0);
        Ok(stats)
    }

    fn stats_rec(
        &self,
        r: Ref,
        depth: usize,
        stats: &mut TreeStats,
        leaf_depth: &mut Option<usize>,
    ) -> Result<()> {
        let (header, payload) = self.arena.node(r)?;
        if header.is_inner() {
            let inner = Inner::decode(&header, payload)?;
            stats.max_fanout = stats.max_fanout.max(inner.children.len());
            for child in inner.children {
                self.stats_rec(child, depth + 1, stats, leaf_depth)?;
            }
            return Ok(());
        }
        let len = header.size as usize;
        stats.leaf_count += 1;
        stats.element_count += len as u64;
        stats.min_leaf_len = stats.min_leaf_len.min(len);
        stats.max_leaf_len = stats.max_leaf_len.max(len);
        match leaf_depth {
            None => *leaf_depth = Some(depth),
            Some(expected) if *expected != depth => stats.uniform_depth = false,
            _ => {}
        }
        Ok(())
    }

    fn subtree_count(&self, r: Ref) -> Result<u64> {
        let (header, payload) = self.arena.node(r)?;
        if !header.is_inner() {
            return Ok(header.size as u64);
        }
        Ok(Inner::decode(&header, payload)?.total())
    }
}

struct SplitPart {
    r: Ref,
    count: u64,
}

/// A column's node graph viewed through a leaf-type strategy, rooted at a
/// single ref. Mutating operations copy-on-write every node along the touched
/// path and leave the new root in [`Tree::root`].
pub struct Tree<'a, C: LeafCodec> {
    arena: &'a mut Arena,
    codec: C,
    root: Ref,
}

impl<'a, C: LeafCodec> Tree<'a, C> {
    /// Views an existing tree with write access.
    pub fn new(arena: &'a mut Arena, codec: C, root: Ref) -> Self {
        Self { arena, codec, root }
    }

    /// Allocates an empty leaf root.
    pub fn create_empty(arena: &mut Arena, codec: &C) -> Result<Ref> {
        let bytes = codec.encode_leaf(&[])?;
        arena.store(bytes)
    }

    /// Current root ref (updated by mutations).
    pub fn root(&self) -> Ref {
        self.root
    }

    fn view(&self) -> TreeView<'_, C> {
        TreeView::new(&*self.arena, self.codec, self.root)
    }

    /// Total element count.
    pub fn size(&self) -> Result<u64> {
        self.view().size()
    }

    /// Value at `index`.
    pub fn get(&self, index: u64) -> Result<C::Value> {
        self.view().get(index)
    }

    /// Index of the first element equal to `value`.
    pub fn find_first(&self, value: &C::Value) -> Result<Option<u64>> {
        self.view().find_first(value)
    }

    /// Collects every element in order.
    pub fn to_vec(&self) -> Result<Vec<C::Value>> {
        self.view().to_vec()
    }

    /// Shape summary for balance assertions.
    pub fn stats(&self) -> Result<TreeStats> {
        self.view().stats()
    }

    /// Overwrites the value at `index`.
    pub fn set(&mut self, index: u64, value: C::Value) -> Result<()> {
        if index >= self.size()? {
            return Err(LogicError::IndexOutOfRange.into());
        }
        if !self.codec.fits(&value) {
            return Err(LogicError::TypeMismatch.into());
        }
        self.root = self.set_rec(self.root, index, value)?;
        Ok(())
    }

    fn set_rec(&mut self, r: Ref, index: u64, value: C::Value) -> Result<Ref> {
        let (header, payload) = self.arena.node(r)?;
        if header.is_inner() {
            let mut inner = Inner::decode(&header, payload)?;
            let (child, local) = inner.locate(index)?;
            let new_child = self.set_rec(inner.children[child], local, value)?;
            inner.children[child] = new_child;
            return self.write_back(r, inner.encode());
        }
        let mut values = self.codec.decode_leaf(&header, payload)?;
        values[index as usize] = value;
        let bytes = self.codec.encode_leaf(&values)?;
        self.write_back(r, bytes)
    }

    /// Inserts `value` before `index`; `index == size` appends. Splits
    /// propagate upward and promote a new inner root when the old root
    /// overflows. An insertion landing exactly on a split boundary ends up
    /// in the right sibling.
    pub fn insert(&mut self, index: u64, value: C::Value) -> Result<()> {
        if index > self.size()? {
            return Err(LogicError::IndexOutOfRange.into());
        }
        if !self.codec.fits(&value) {
            return Err(LogicError::TypeMismatch.into());
        }
        let (new_root, split) = self.insert_rec(self.root, index, value)?;
        self.root = match split {
            None => new_root,
            Some(part) => {
                // Promote: the old root becomes the left child of a new root.
                let left_count = self.subtree_count(new_root)?;
                let inner = Inner {
                    children: vec![new_root, part.r],
                    counts: vec![left_count, part.count],
                };
                self.arena.store(inner.encode())?
            }
        };
        Ok(())
    }

    /// Appends `value` at the end.
    pub fn push(&mut self, value: C::Value) -> Result<()> {
        let size = self.size()?;
        self.insert(size, value)
    }

    fn insert_rec(
        &mut self,
        r: Ref,
        index: u64,
        value: C::Value,
    ) -> Result<(Ref, Option<SplitPart>)> {
        let (header, payload) = self.arena.node(r)?;
        if header.is_inner() {
            let mut inner = Inner::decode(&header, payload)?;
            let (child, local) = inner.locate(index)?;
            let (new_child, split) = self.insert_rec(inner.children[child], local, value)?;
            inner.children[child] = new_child;
            inner.counts[child] += 1;
            if let Some(part) = split {
                inner.counts[child] -= part.count;
                inner.children.insert(child + 1, part.r);
                inner.counts.insert(child + 1, part.count);
            }
            if inner.children.len() > MAX_FANOUT {
                let mid = inner.children.len() / 2;
                let right = Inner {
                    children: inner.children.split_off(mid),
                    counts: inner.counts.split_off(mid),
                };
                let right_count = right.total();
                let right_ref = self.arena.store(right.encode())?;
                let left_ref = self.write_back(r, inner.encode())?;
                return Ok((
                    left_ref,
                    Some(SplitPart {
                        r: right_ref,
                        count: right_count,
                    }),
                ));
            }
            let new_ref = self.write_back(r, inner.encode())?;
            return Ok((new_ref, None));
        }

        let mut values = self.codec.decode_leaf(&header, payload)?;
        values.insert(index as usize, value);
        if values.len() > LEAF_MAX {
            let mid = values.len() / 2;
            let right_values = values.split_off(mid);
            let right_count = right_values.len() as u64;
            let right_bytes = self.codec.encode_leaf(&right_values)?;
            let right_ref = self.arena.store(right_bytes)?;
            let left_bytes = self.codec.encode_leaf(&values)?;
            let left_ref = self.write_back(r, left_bytes)?;
            return Ok((
                left_ref,
                Some(SplitPart {
                    r: right_ref,
                    count: right_count,
                }),
            ));
        }
        let bytes = self.codec.encode_leaf(&values)?;
        Ok((self.write_back(r, bytes)?, None))
    }

    /// Removes the value at `index`, merging or rebalancing underfull nodes
    /// and demoting the root when it collapses to one child.
    pub fn erase(&mut self, index: u64) -> Result<()> {
        if index >= self.size()? {
            return Err(LogicError::IndexOutOfRange.into());
        }
        self.root = self.erase_rec(self.root, index)?;
        // Demote single-child inner roots back toward a leaf root.
        loop {
            let only = {
                let (header, payload) = self.arena.node(self.root)?;
                if !header.is_inner() || header.size != 1 {
                    break;
                }
                Inner::decode(&header, payload)?.children[0]
            };
            self.arena.free(self.root);
            self.root = only;
        }
        Ok(())
    }

    fn erase_rec(&mut self, r: Ref, index: u64) -> Result<Ref> {
        let (header, payload) = self.arena.node(r)?;
        if header.is_inner() {
            let mut inner = Inner::decode(&header, payload)?;
            let (child, local) = inner.locate(index)?;
            let new_child = self.erase_rec(inner.children[child], local)?;
            inner.children[child] = new_child;
            inner.counts[child] -= 1;
            self.rebalance_child(&mut inner, child)?;
            return self.write_back(r, inner.encode());
        }
        let mut values = self.codec.decode_leaf(&header, payload)?;
        values.remove(index as usize);
        let bytes = self.codec.encode_leaf(&values)?;
        self.write_back(r, bytes)
    }

    /// Merges or rebalances `inner.children[child]` with a neighbor when it
    /// has dropped below the minimum occupancy.
    fn rebalance_child(&mut self, inner: &mut Inner, child: usize) -> Result<()> {
        if inner.children.len() < 2 {
            return Ok(());
        }
        let (header, _) = self.arena.node(inner.children[child])?;
        let undersized = if header.is_inner() {
            (header.size as usize) < MIN_FANOUT
        } else {
            (header.size as usize) < LEAF_MIN
        };
        if !undersized {
            return Ok(());
        }
        let left = if child > 0 { child - 1 } else { child };
        let right = left + 1;

        let (left_header, _) = self.arena.node(inner.children[left])?;
        if left_header.is_inner() {
            self.rebalance_inner_pair(inner, left, right)
        } else {
            self.rebalance_leaf_pair(inner, left, right)
        }
    }

    fn rebalance_leaf_pair(&mut self, inner: &mut Inner, left: usize, right: usize) -> Result<()> {
        let left_values = {
            let (h, p) = self.arena.node(inner.children[left])?;
            self.codec.decode_leaf(&h, p)?
        };
        let right_values = {
            let (h, p) = self.arena.node(inner.children[right])?;
            self.codec.decode_leaf(&h, p)?
        };
        let mut combined = left_values;
        combined.extend(right_values);
        if combined.len() <= LEAF_MAX {
            let bytes = self.codec.encode_leaf(&combined)?;
            let merged = self.write_back(inner.children[left], bytes)?;
            self.arena.free(inner.children[right]);
            inner.children[left] = merged;
            inner.counts[left] += inner.counts[right];
            inner.children.remove(right);
            inner.counts.remove(right);
        } else {
            let mid = combined.len() / 2;
            let right_half = combined.split_off(mid);
            let left_bytes = self.codec.encode_leaf(&combined)?;
            let right_bytes = self.codec.encode_leaf(&right_half)?;
            inner.children[left] = self.write_back(inner.children[left], left_bytes)?;
            inner.children[right] = self.write_back(inner.children[right], right_bytes)?;
            inner.counts[left] = combined.len() as u64;
            inner.counts[right] = right_half.len() as u64;
        }
        Ok(())
    }

    fn rebalance_inner_pair(&mut self, inner: &mut Inner, left: usize, right: usize) -> Result<()> {
        let left_inner = {
            let (h, p) = self.arena.node(inner.children[left])?;
            Inner::decode(&h, p)?
        };
        let right_inner = {
            let (h, p) = self.arena.node(inner.children[right])?;
            Inner::decode(&h, p)?
        };
        let mut children = left_inner.children;
        let mut counts = left_inner.counts;
        children.extend(right_inner.children);
        counts.extend(right_inner.counts);
        if children.len() <= MAX_FANOUT {
            let merged_inner = Inner { children, counts };
            let merged = self.write_back(inner.children[left], merged_inner.encode())?;
            self.arena.free(inner.children[right]);
            inner.children[left] = merged;
            inner.counts[left] += inner.counts[right];
            inner.children.remove(right);
            inner.counts.remove(right);
        } else {
            let mid = children.len() / 2;
            let new_right = Inner {
                children: children.split_off(mid),
                counts: counts.split_off(mid),
            };
            let new_left = Inner { children, counts };
            let left_total = new_left.total();
            let right_total = new_right.total();
            inner.children[left] = self.write_back(inner.children[left], new_left.encode())?;
            inner.children[right] = self.write_back(inner.children[right], new_right.encode())?;
            inner.counts[left] = left_total;
            inner.counts[right] = right_total;
        }
        Ok(())
    }

    /// Overwrites the slot at `index` with the last value, then erases the
    /// last slot. O(log n), and it changes the logical identity of whatever
    /// row used to be last; callers of row deletion inherit that.
    pub fn move_last_over(&mut self, index: u64) -> Result<()> {
        let size = self.size()?;
        if index >= size {
            return Err(LogicError::IndexOutOfRange.into());
        }
        if index + 1 < size {
            let last = self.get(size - 1)?;
            self.set(index, last)?;
        }
        self.erase(size - 1)
    }

    /// Frees the whole tree and replaces it with an empty leaf root.
    pub fn clear(&mut self) -> Result<()> {
        self.arena.free_deep(self.root)?;
        self.root = Self::create_empty(self.arena, &self.codec)?;
        Ok(())
    }

    fn subtree_count(&self, r: Ref) -> Result<u64> {
        let (header, payload) = self.arena.node(r)?;
        if !header.is_inner() {
            return Ok(header.size as u64);
        }
        Ok(Inner::decode(&header, payload)?.total())
    }

    fn write_back(&mut self, r: Ref, bytes: Vec<u8>) -> Result<Ref> {
        let target = self.arena.cow(r)?;
        self.arena.replace(target, bytes)?;
        Ok(target)
    }
}

impl<'a> Tree<'a, IntCodec> {
    /// Adds `delta` to every element. Bulk arithmetic used to renumber
    /// indices after structural changes elsewhere.
    pub fn adjust(&mut self, delta: i64) -> Result<()> {
        self.root = self.adjust_rec(self.root, i64::MIN, delta)?;
        Ok(())
    }

    /// Adds `delta` to every element greater than or equal to `limit`.
    pub fn adjust_ge(&mut self, limit: i64, delta: i64) -> Result<()> {
        self.root = self.adjust_rec(self.root, limit, delta)?;
        Ok(())
    }

    fn adjust_rec(&mut self, r: Ref, limit: i64, delta: i64) -> Result<Ref> {
        let (header, payload) = self.arena.node(r)?;
        if header.is_inner() {
            let mut inner = Inner::decode(&header, payload)?;
            let children: SmallVec<[Ref; MAX_FANOUT]> =
                inner.children.iter().copied().collect();
            let mut touched = false;
            for (i, child) in children.into_iter().enumerate() {
                let adjusted = self.adjust_rec(child, limit, delta)?;
                if adjusted != child {
                    inner.children[i] = adjusted;
                    touched = true;
                }
            }
            if !touched {
                return Ok(r);
            }
            return self.write_back(r, inner.encode());
        }
        let mut values = self.codec.decode_leaf(&header, payload)?;
        let mut touched = false;
        for value in values.iter_mut() {
            if *value >= limit {
                *value += delta;
                touched = true;
            }
        }
        if !touched {
            return Ok(r);
        }
        let bytes = self.codec.encode_leaf(&values)?;
        self.write_back(r, bytes)
    }
}
