//! Stable-handle node storage.
//!
//! Nodes live in an append-only arena and are addressed by [`NodeId`]
//! handles rather than references, so parent back-pointers and leaf links
//! never dangle while the tree is alive. Each slot is an
//! `Arc<Mutex<Node>>`: the `Arc` gives descent paths owned lock guards
//! (no borrow tied to the arena), and the `Mutex` is the per-node lock of
//! the lock-coupling engine.
//!
//! Nodes detached by merges stay allocated until the tree drops; they are
//! unreachable through the root, so keeping them costs memory but never
//! correctness.

use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, RwLock};

use crate::node::{Key, Node};

/// Stable handle to a node in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct NodeId(u32);

impl NodeId {
    #[inline]
    pub(crate) const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Owned guard over one node; safe to hold across arena reallocations.
pub(crate) type NodeGuard = ArcMutexGuard<RawMutex, Node>;

/// Append-only arena of lockable nodes.
pub(crate) struct NodeArena {
    cells: RwLock<Vec<Arc<Mutex<Node>>>>,
}

impl NodeArena {
    pub(crate) fn new() -> Self {
        Self {
            cells: RwLock::new(Vec::new()),
        }
    }

    /// Allocate an empty leaf.
    pub(crate) fn alloc_leaf(&self) -> NodeId {
        self.alloc_with(Node::new_leaf)
    }

    /// Allocate an internal node with the given keys and children.
    ///
    /// The caller is responsible for re-pointing the children's parent
    /// handles afterwards.
    pub(crate) fn alloc_internal(&self, keys: Vec<Key>, children: Vec<NodeId>) -> NodeId {
        self.alloc_with(|id| Node::new_internal(id, keys, children))
    }

    fn alloc_with(&self, build: impl FnOnce(NodeId) -> Node) -> NodeId {
        let mut cells = self.cells.write();
        let id = NodeId(u32::try_from(cells.len()).expect("node arena exhausted"));
        cells.push(Arc::new(Mutex::new(build(id))));
        id
    }

    /// Shared handle to a node's cell.
    pub(crate) fn cell(&self, id: NodeId) -> Arc<Mutex<Node>> {
        Arc::clone(&self.cells.read()[id.index()])
    }

    /// Block until `id`'s node lock is acquired.
    pub(crate) fn lock(&self, id: NodeId) -> NodeGuard {
        self.cell(id).lock_arc()
    }

    /// Number of nodes ever allocated (including detached ones).
    pub(crate) fn len(&self) -> usize {
        self.cells.read().len()
    }
}
