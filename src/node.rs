//! Node representation and the in-node mutation primitives shared by both
//! engines.
//!
//! A node is either a leaf holding `(key, record)` entries plus a next-leaf
//! link, or an internal node holding separator keys and child handles. The
//! two shapes are a tagged union rather than a dynamically-typed pointer
//! slot, so child descent and record access cannot be confused.
//!
//! All primitives here operate on a single already-locked node; locking
//! policy lives with the callers ([`crate::tree::locked`] and
//! [`crate::palm`]).

use std::sync::Arc;

use crate::arena::NodeId;
use crate::record::Record;

/// Key type indexed by the tree.
pub type Key = u64;

/// A leaf slot: key plus its record.
pub(crate) type Entry = (Key, Arc<Record>);

// ============================================================================
//  NodeBody
// ============================================================================

/// The shape-specific payload of a node.
#[derive(Debug)]
pub(crate) enum NodeBody {
    /// Leaf level: sorted entries and the next leaf to the right.
    Leaf {
        /// Sorted, unique `(key, record)` pairs.
        entries: Vec<Entry>,
        /// Right sibling in the leaf chain.
        next: Option<NodeId>,
    },

    /// Internal level: `keys.len() + 1` children.
    Internal {
        /// Sorted, unique separator keys.
        keys: Vec<Key>,
        /// Child handles; child `i` covers keys below `keys[i]`,
        /// child `keys.len()` covers the rest.
        children: Vec<NodeId>,
    },
}

// ============================================================================
//  Node
// ============================================================================

/// One node of the tree, stored in the arena and guarded by its own lock.
#[derive(Debug)]
pub(crate) struct Node {
    /// This node's own handle.
    pub id: NodeId,

    /// Non-owning back-reference to the parent, guarded by this node's lock.
    pub parent: Option<NodeId>,

    /// Leaf or internal payload.
    pub body: NodeBody,
}

impl Node {
    pub(crate) fn new_leaf(id: NodeId) -> Self {
        Self {
            id,
            parent: None,
            body: NodeBody::Leaf {
                entries: Vec::new(),
                next: None,
            },
        }
    }

    pub(crate) fn new_internal(id: NodeId, keys: Vec<Key>, children: Vec<NodeId>) -> Self {
        Self {
            id,
            parent: None,
            body: NodeBody::Internal { keys, children },
        }
    }

    #[inline]
    pub(crate) fn is_leaf(&self) -> bool {
        matches!(self.body, NodeBody::Leaf { .. })
    }

    /// Number of keys currently held (entries for a leaf).
    #[inline]
    pub(crate) fn num_keys(&self) -> usize {
        match &self.body {
            NodeBody::Leaf { entries, .. } => entries.len(),
            NodeBody::Internal { keys, .. } => keys.len(),
        }
    }

    /// Keys of this node, in order. Allocates for leaves; used by the
    /// invariant checker and diagnostics, not by hot paths.
    pub(crate) fn keys_vec(&self) -> Vec<Key> {
        match &self.body {
            NodeBody::Leaf { entries, .. } => entries.iter().map(|(k, _)| *k).collect(),
            NodeBody::Internal { keys, .. } => keys.clone(),
        }
    }

    /// Child to descend into for `key`: `key >= keys[i]` advances past
    /// child `i`.
    ///
    /// # Panics
    ///
    /// Panics when called on a leaf; routing below leaf level is a
    /// programming error.
    pub(crate) fn route(&self, key: Key) -> NodeId {
        match &self.body {
            NodeBody::Internal { keys, children } => {
                let idx = keys.partition_point(|&k| key >= k);
                children[idx]
            }
            NodeBody::Leaf { .. } => panic!("routing through a leaf node"),
        }
    }

    // ------------------------------------------------------------------
    //  Leaf primitives
    // ------------------------------------------------------------------

    /// Binary search for `key` among leaf entries.
    ///
    /// `Ok(slot)` when present, `Err(insertion_point)` otherwise.
    pub(crate) fn search_leaf(&self, key: Key) -> Result<usize, usize> {
        match &self.body {
            NodeBody::Leaf { entries, .. } => entries.binary_search_by_key(&key, |(k, _)| *k),
            NodeBody::Internal { .. } => panic!("leaf search on internal node"),
        }
    }

    /// Insert `key` into a leaf at its sorted position, replacing the
    /// record in place when the key already exists.
    ///
    /// Returns the replaced record, if any.
    pub(crate) fn insert_into_leaf(&mut self, key: Key, record: Arc<Record>) -> Option<Arc<Record>> {
        let slot = self.search_leaf(key);
        let NodeBody::Leaf { entries, .. } = &mut self.body else {
            unreachable!("search_leaf verified the shape")
        };
        match slot {
            Ok(slot) => Some(std::mem::replace(&mut entries[slot].1, record)),
            Err(slot) => {
                entries.insert(slot, (key, record));
                None
            }
        }
    }

    /// Remove `key` from a leaf; absent keys are a no-op.
    pub(crate) fn remove_from_leaf(&mut self, key: Key) -> Option<Entry> {
        let slot = self.search_leaf(key).ok()?;
        let NodeBody::Leaf { entries, .. } = &mut self.body else {
            unreachable!("search_leaf verified the shape")
        };
        Some(entries.remove(slot))
    }

    /// Record stored under `key`, if present. Leaf only.
    pub(crate) fn leaf_lookup(&self, key: Key) -> Option<Arc<Record>> {
        let slot = self.search_leaf(key).ok()?;
        let NodeBody::Leaf { entries, .. } = &self.body else {
            unreachable!("search_leaf verified the shape")
        };
        Some(Arc::clone(&entries[slot].1))
    }

    // ------------------------------------------------------------------
    //  Internal-node primitives
    // ------------------------------------------------------------------

    /// Index of `child` among this node's children, by identity.
    pub(crate) fn get_left_index(&self, child: NodeId) -> Option<usize> {
        match &self.body {
            NodeBody::Internal { children, .. } => children.iter().position(|&c| c == child),
            NodeBody::Leaf { .. } => None,
        }
    }

    /// Insert separator `key` at `left_index` with `right` as the child to
    /// its right. The caller locates `left_index` via [`Self::get_left_index`]
    /// on the split child.
    pub(crate) fn insert_into_node(&mut self, left_index: usize, key: Key, right: NodeId) {
        let NodeBody::Internal { keys, children } = &mut self.body else {
            panic!("internal insert on leaf node")
        };
        keys.insert(left_index, key);
        children.insert(left_index + 1, right);
    }

    /// Insert `(sep, child)` at the position dictated by separator order.
    ///
    /// Used when applying batched split modifications, where the new
    /// sibling is not yet present among the children.
    pub(crate) fn insert_child_by_key(&mut self, sep: Key, child: NodeId) {
        let NodeBody::Internal { keys, children } = &mut self.body else {
            panic!("internal insert on leaf node")
        };
        let idx = keys.partition_point(|&k| k < sep);
        keys.insert(idx, sep);
        children.insert(idx + 1, child);
    }

    /// Remove `child` (by identity) and the separator associated with it.
    ///
    /// Returns the removed separator, or `None` when the node had no keys
    /// left (sole-child removal). Absent children are a no-op returning
    /// `None`.
    pub(crate) fn remove_child(&mut self, child: NodeId) -> Option<Key> {
        let idx = self.get_left_index(child)?;
        let NodeBody::Internal { keys, children } = &mut self.body else {
            unreachable!("get_left_index verified the shape")
        };
        children.remove(idx);
        if keys.is_empty() {
            return None;
        }
        // Child 0 has no separator of its own; the boundary key between it
        // and child 1 goes instead.
        let key_idx = idx.saturating_sub(1);
        Some(keys.remove(key_idx))
    }

    // ------------------------------------------------------------------
    //  Capacity tests
    // ------------------------------------------------------------------

    /// Post-mutation overflow test.
    #[inline]
    pub(crate) fn is_overfull(&self, max_order: usize) -> bool {
        self.num_keys() > max_order
    }

    /// Post-mutation underflow test used by the batch path.
    #[inline]
    pub(crate) fn is_underfull(&self, min_order: usize) -> bool {
        self.num_keys() < min_order
    }
}

// ============================================================================
//  cut
// ============================================================================

/// Split point for redistributing `n` entries into two roughly-even halves.
///
/// The extra entry goes to the left half when `n` is even, to the right
/// otherwise.
#[inline]
#[must_use]
pub(crate) const fn cut(n: usize) -> usize {
    if n % 2 == 0 {
        n / 2
    } else {
        n / 2 + 1
    }
}

// ============================================================================
//  Tests
// ============================================================================
