//! The B+ tree itself: construction, configuration, point lookup, and the
//! structural diagnostics used by tests.
//!
//! Mutation lives in two engines sharing this storage:
//!
//! - [`locked`] — per-operation lock-coupling insert/delete, safe under
//!   true thread parallelism.
//! - [`crate::palm`] — bulk-synchronous batch processing, which assumes
//!   exclusive access for a whole round (`&mut self`).

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::arena::{NodeArena, NodeId};
use crate::error::TreeError;
use crate::node::{Key, NodeBody};
use crate::record::Record;

pub(crate) mod locked;

// ============================================================================
//  TreeConfig
// ============================================================================

/// Fanout thresholds for a tree.
///
/// A node holds at most `max_order` keys; non-root nodes hold at least
/// `min_order - 1` keys between operations. The batch path treats a
/// mutated node with fewer than `min_order` keys as underflowed and
/// dissolves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeConfig {
    /// Maximum keys per node.
    pub max_order: usize,

    /// Underflow threshold for the batch path; `min_order - 1` is the
    /// structural floor.
    pub min_order: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            max_order: 20,
            min_order: 3,
        }
    }
}

impl TreeConfig {
    /// Check that the thresholds can coexist.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::InvalidConfig`] when `min_order < 2` or when
    /// `max_order < 2 * min_order` (a split could then produce an
    /// immediately-underflowed half).
    pub fn validate(&self) -> Result<(), TreeError> {
        if self.min_order < 2 {
            return Err(TreeError::InvalidConfig("min_order must be at least 2"));
        }
        if self.max_order < 2 * self.min_order {
            return Err(TreeError::InvalidConfig(
                "max_order must be at least twice min_order",
            ));
        }
        Ok(())
    }

    /// Minimum keys a non-root node may hold between operations.
    #[inline]
    pub(crate) const fn min_keys(&self) -> usize {
        self.min_order - 1
    }
}

// ============================================================================
//  BpTree
// ============================================================================

/// A concurrent in-memory B+ tree.
///
/// Point operations ([`find`](Self::find), [`insert`](Self::insert),
/// [`delete`](Self::delete)) may run from many threads at once; batch
/// rounds ([`palm`](Self::palm)) take `&mut self` and so are exclusive by
/// construction. The two modes must not be interleaved on one live tree,
/// and the borrow checker enforces exactly that.
pub struct BpTree {
    /// Node storage.
    pub(crate) arena: NodeArena,

    /// Root handle. Holding this mutex is the "tree lock" of the
    /// lock-coupling engine: it is retained for as long as a descent
    /// might still have to replace the root.
    pub(crate) root: Mutex<Option<NodeId>>,

    /// Fanout thresholds.
    pub(crate) config: TreeConfig,

    /// Live key count.
    pub(crate) count: AtomicUsize,
}

impl BpTree {
    /// Create an empty tree with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(TreeConfig::default()).expect("default config is valid")
    }

    /// Create an empty tree with an explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::InvalidConfig`] when the configuration fails
    /// [`TreeConfig::validate`].
    pub fn with_config(config: TreeConfig) -> Result<Self, TreeError> {
        config.validate()?;
        Ok(Self {
            arena: NodeArena::new(),
            root: Mutex::new(None),
            config,
            count: AtomicUsize::new(0),
        })
    }

    /// The configuration this tree was built with.
    #[must_use]
    pub const fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// Number of keys currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Whether the tree holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ------------------------------------------------------------------
    //  Lookup
    // ------------------------------------------------------------------

    /// Point lookup.
    ///
    /// The descent takes each node's lock only momentarily, never two at
    /// once, so concurrent writers are delayed by at most one node visit.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::NotFound`] when the key is absent.
    pub fn find(&self, key: Key) -> Result<Arc<Record>, TreeError> {
        let leaf = self.find_leaf(key).ok_or(TreeError::NotFound)?;
        let guard = self.arena.lock(leaf);
        guard.leaf_lookup(key).ok_or(TreeError::NotFound)
    }

    /// Descend to the leaf that `key` belongs to, without coupling locks.
    ///
    /// Returns `None` only on an empty tree.
    pub(crate) fn find_leaf(&self, key: Key) -> Option<NodeId> {
        let mut current = (*self.root.lock())?;
        loop {
            let guard = self.arena.lock(current);
            if guard.is_leaf() {
                return Some(current);
            }
            current = guard.route(key);
        }
    }

    /// Height of the tree in edges: 0 for an empty or single-leaf tree.
    #[must_use]
    pub fn height(&self) -> usize {
        let Some(mut current) = *self.root.lock() else {
            return 0;
        };
        let mut height = 0;
        loop {
            let guard = self.arena.lock(current);
            match &guard.body {
                NodeBody::Leaf { .. } => return height,
                NodeBody::Internal { children, .. } => {
                    current = children[0];
                    height += 1;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    //  Construction helpers
    // ------------------------------------------------------------------

    /// Build a fresh single-leaf tree around one entry and return its root.
    ///
    /// The caller must hold the root slot and store the returned handle.
    pub(crate) fn start_new_tree(&self, key: Key, record: Arc<Record>) -> NodeId {
        let id = self.arena.alloc_leaf();
        let mut guard = self.arena.lock(id);
        guard.insert_into_leaf(key, record);
        drop(guard);
        id
    }

    /// Re-point the parent handle of every node in `children` to `parent`.
    ///
    /// Each child's lock is taken briefly; the caller already holds the
    /// lock of the node the children are moving under, so no new descent
    /// can reach them mid-update.
    pub(crate) fn reparent(&self, children: &[NodeId], parent: NodeId) {
        for &child in children {
            self.arena.lock(child).parent = Some(parent);
        }
    }

    // ------------------------------------------------------------------
    //  Diagnostics
    // ------------------------------------------------------------------

    /// Verify every structural invariant, panicking on the first
    /// violation. Intended for tests and debugging between operations;
    /// assumes no concurrent writers.
    ///
    /// # Panics
    ///
    /// Panics with a description of the violated invariant.
    #[allow(clippy::too_many_lines)]
    pub fn check_invariants(&self) {
        let Some(root) = *self.root.lock() else {
            assert_eq!(self.len(), 0, "empty tree with non-zero count");
            return;
        };

        let mut leaves_in_order = Vec::new();
        let mut leaf_depths = Vec::new();
        let mut total_entries = 0usize;

        // (id, expected parent, lower bound, upper bound, depth)
        let mut stack: Vec<(NodeId, Option<NodeId>, Option<Key>, Option<Key>, usize)> =
            vec![(root, None, None, None, 0)];

        while let Some((id, expected_parent, lo, hi, depth)) = stack.pop() {
            let guard = self.arena.lock(id);
            assert_eq!(guard.id, id, "node {id:?} does not know its own id");
            assert_eq!(
                guard.parent, expected_parent,
                "node {id:?} has a stale parent handle"
            );

            let keys = guard.keys_vec();
            assert!(
                keys.windows(2).all(|w| w[0] < w[1]),
                "node {id:?} keys are not sorted-unique: {keys:?}"
            );
            if let Some(lo) = lo {
                assert!(
                    keys.iter().all(|&k| k >= lo),
                    "node {id:?} violates lower bound {lo}: {keys:?}"
                );
            }
            if let Some(hi) = hi {
                assert!(
                    keys.iter().all(|&k| k < hi),
                    "node {id:?} violates upper bound {hi}: {keys:?}"
                );
            }

            let is_root = id == root;
            if !is_root {
                assert!(
                    guard.num_keys() >= self.config.min_keys(),
                    "node {id:?} below the structural floor: {} keys",
                    guard.num_keys()
                );
            }
            assert!(
                guard.num_keys() <= self.config.max_order,
                "node {id:?} above capacity: {} keys",
                guard.num_keys()
            );

            match &guard.body {
                NodeBody::Leaf { entries, next } => {
                    total_entries += entries.len();
                    leaves_in_order.push((id, *next));
                    leaf_depths.push(depth);
                }
                NodeBody::Internal { keys, children } => {
                    assert!(
                        !keys.is_empty() || is_root,
                        "internal node {id:?} has no keys"
                    );
                    assert_eq!(
                        children.len(),
                        keys.len() + 1,
                        "node {id:?} child count does not match key count"
                    );
                    // Push right-to-left so leaves pop out left-to-right.
                    for i in (0..children.len()).rev() {
                        let child_lo = if i == 0 { lo } else { Some(keys[i - 1]) };
                        let child_hi = if i == keys.len() { hi } else { Some(keys[i]) };
                        stack.push((children[i], Some(id), child_lo, child_hi, depth + 1));
                    }
                }
            }
        }

        let first_depth = leaf_depths[0];
        assert!(
            leaf_depths.iter().all(|&d| d == first_depth),
            "leaves at unequal depths: {leaf_depths:?}"
        );

        for window in leaves_in_order.windows(2) {
            let (_, next) = window[0];
            let (right_id, _) = window[1];
            assert_eq!(
                next,
                Some(right_id),
                "leaf chain does not follow in-order leaf sequence"
            );
        }
        let (_, last_next) = leaves_in_order[leaves_in_order.len() - 1];
        assert_eq!(last_next, None, "rightmost leaf has a dangling next link");

        assert_eq!(
            total_entries,
            self.len(),
            "entry count disagrees with live key counter"
        );
    }

    /// Render the tree level by level, one line per level.
    ///
    /// Traverses through an explicit local queue; there is no shared
    /// traversal state anywhere in the crate.
    #[must_use]
    pub fn dump(&self) -> String {
        let Some(root) = *self.root.lock() else {
            return "(empty)".to_owned();
        };

        let mut out = String::new();
        let mut queue: VecDeque<(NodeId, usize)> = VecDeque::new();
        queue.push_back((root, 0));
        let mut current_depth = 0;

        while let Some((id, depth)) = queue.pop_front() {
            if depth != current_depth {
                out.push('\n');
                current_depth = depth;
            } else if !out.is_empty() {
                out.push_str(" | ");
            }
            let guard = self.arena.lock(id);
            out.push('[');
            for (i, k) in guard.keys_vec().iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                let _ = write!(out, "{k}");
            }
            out.push(']');
            if let NodeBody::Internal { children, .. } = &guard.body {
                for &child in children {
                    queue.push_back((child, depth + 1));
                }
            }
        }
        out
    }
}

impl Default for BpTree {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BpTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BpTree")
            .field("len", &self.len())
            .field("height", &self.height())
            .field("nodes", &self.arena.len())
            .field("config", &self.config)
            .finish()
    }
}

// ============================================================================
//  Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        assert!(TreeConfig::default().validate().is_ok());
        assert!(TreeConfig {
            max_order: 4,
            min_order: 2
        }
        .validate()
        .is_ok());
        assert_eq!(
            TreeConfig {
                max_order: 10,
                min_order: 1
            }
            .validate(),
            Err(TreeError::InvalidConfig("min_order must be at least 2"))
        );
        assert_eq!(
            TreeConfig {
                max_order: 5,
                min_order: 3
            }
            .validate(),
            Err(TreeError::InvalidConfig(
                "max_order must be at least twice min_order"
            ))
        );
    }

    #[test]
    fn test_empty_tree() {
        let tree = BpTree::new();
        assert!(tree.is_empty());
        assert_eq!(tree.height(), 0);
        assert_eq!(tree.find(1), Err(TreeError::NotFound));
        assert_eq!(tree.dump(), "(empty)");
        tree.check_invariants();
    }

    #[test]
    fn test_four_keys_share_one_leaf() {
        // With max_order 20 and min_order 3, a handful of inserts stays
        // in a single leaf.
        let tree = BpTree::new();
        for k in [5u64, 3, 8, 1] {
            tree.insert(k, b"v").unwrap();
        }
        assert_eq!(tree.height(), 0);
        assert_eq!(tree.len(), 4);
        assert_eq!(tree.find(3).unwrap().value(), b"v");
        assert_eq!(tree.find(99), Err(TreeError::NotFound));
        tree.check_invariants();
    }

    #[test]
    fn test_dump_levels() {
        let tree = BpTree::with_config(TreeConfig {
            max_order: 4,
            min_order: 2,
        })
        .unwrap();
        for k in 0..10u64 {
            tree.insert(k, b"v").unwrap();
        }
        let dump = tree.dump();
        assert!(dump.contains('\n'), "expected at least two levels: {dump}");
        tree.check_invariants();
    }
}
