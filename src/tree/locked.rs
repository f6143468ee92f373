//! Lock-coupling ("crabbing") insert and delete.
//!
//! Both operations descend root-to-leaf, locking each child before
//! inspecting it and releasing every held lock the moment a *safe* node
//! is found — one that can absorb the pending mutation without a
//! parent-visible change. The held set is therefore always the minimal
//! unsafe suffix of the descent path, and since locks are only ever
//! acquired downwards, no deadlock is possible.
//!
//! The tree lock (the root slot's mutex) counts as the lock above the
//! root: it is retained exactly while the root itself is unsafe, because
//! only then can the operation end up swapping the root handle.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::MutexGuard;
use tracing::trace;

use crate::arena::{NodeGuard, NodeId};
use crate::error::TreeError;
use crate::node::{cut, Key, NodeBody};
use crate::record::Record;
use crate::tree::BpTree;

/// Guard over the root slot; holding it is holding the tree lock.
type TreeGuard<'a> = MutexGuard<'a, Option<NodeId>>;

impl BpTree {
    // ========================================================================
    //  Insert
    // ========================================================================

    /// Insert `key`, replacing the record in place when the key already
    /// exists.
    ///
    /// Safe to call from many threads concurrently.
    ///
    /// # Errors
    ///
    /// Currently infallible for valid trees; the `Result` is part of the
    /// tree contract shared by all benchmark subjects.
    pub fn insert(&self, key: Key, value: &[u8]) -> Result<(), TreeError> {
        self.insert_record(key, Arc::new(Record::new(value)))
    }

    /// Insert a pre-built record. Orphan reinsertion reuses this to avoid
    /// copying payloads.
    pub(crate) fn insert_record(&self, key: Key, record: Arc<Record>) -> Result<(), TreeError> {
        let mut root_slot = self.root.lock();
        let Some(root_id) = *root_slot else {
            *root_slot = Some(self.start_new_tree(key, record));
            self.count.fetch_add(1, Ordering::AcqRel);
            return Ok(());
        };

        let (mut path, tree_guard) =
            self.descend(root_id, key, root_slot, |keys, _| keys < self.config.max_order);

        let depth = path.len();
        let leaf = path.last_mut().expect("descent returns at least the leaf");

        // Replacing an existing key never changes the structure, even in
        // a full leaf.
        if leaf.search_leaf(key).is_ok() {
            leaf.insert_into_leaf(key, record);
            return Ok(());
        }

        if leaf.num_keys() < self.config.max_order {
            assert!(tree_guard.is_none(), "tree locked but leaf is safe");
            assert_eq!(depth, 1, "locks retained above a safe leaf");
            leaf.insert_into_leaf(key, record);
            self.count.fetch_add(1, Ordering::AcqRel);
            return Ok(());
        }

        self.count.fetch_add(1, Ordering::AcqRel);
        self.insert_into_leaf_after_splitting(path, tree_guard, key, record);
        Ok(())
    }

    /// Split a full leaf around the incoming entry and push the new
    /// separator into the parent, splitting ancestors as capacity
    /// requires. Consumes the held lock path.
    fn insert_into_leaf_after_splitting(
        &self,
        mut path: Vec<NodeGuard>,
        tree_guard: Option<TreeGuard<'_>>,
        key: Key,
        record: Arc<Record>,
    ) {
        let mut leaf = path.pop().expect("split target must be locked");
        leaf.insert_into_leaf(key, record);

        let left_id = leaf.id;
        let parent_hint = leaf.parent;
        let split = cut(self.config.max_order);
        let NodeBody::Leaf { entries, next } = &mut leaf.body else {
            unreachable!("insert descent ends at a leaf")
        };
        let right_entries = entries.split_off(split);
        let sep = right_entries[0].0;
        let old_next = *next;

        let right_id = self.arena.alloc_leaf();
        {
            let mut right = self.arena.lock(right_id);
            right.parent = parent_hint;
            let NodeBody::Leaf {
                entries: r_entries,
                next: r_next,
            } = &mut right.body
            else {
                unreachable!("allocated as a leaf")
            };
            *r_entries = right_entries;
            *r_next = old_next;
        }
        let NodeBody::Leaf { next, .. } = &mut leaf.body else {
            unreachable!()
        };
        *next = Some(right_id);
        trace!(left = ?left_id, right = ?right_id, sep, "leaf split");

        // The parent (or the tree lock) is still held, so no descent can
        // observe the half-linked sibling.
        drop(leaf);
        self.insert_into_parent(path, tree_guard, left_id, sep, right_id);
    }

    /// Propagate `(sep, right)` upwards through the held lock suffix.
    fn insert_into_parent(
        &self,
        mut path: Vec<NodeGuard>,
        tree_guard: Option<TreeGuard<'_>>,
        mut left_id: NodeId,
        mut sep: Key,
        mut right_id: NodeId,
    ) {
        loop {
            let Some(mut parent) = path.pop() else {
                // The split reached the top: grow a new root.
                let mut slot = tree_guard.expect("root split without the tree lock");
                assert_eq!(*slot, Some(left_id), "tree lock does not cover the split root");
                let new_root = self.arena.alloc_internal(vec![sep], vec![left_id, right_id]);
                self.reparent(&[left_id, right_id], new_root);
                *slot = Some(new_root);
                trace!(root = ?new_root, "tree grew a level");
                return;
            };

            let left_index = parent
                .get_left_index(left_id)
                .expect("split child missing from its parent");

            if parent.num_keys() < self.config.max_order {
                parent.insert_into_node(left_index, sep, right_id);
                return;
            }

            let (up_key, new_right) = self.split_internal(&mut parent, left_index, sep, right_id);
            left_id = parent.id;
            sep = up_key;
            right_id = new_right;
        }
    }

    /// Two-way split of a full internal node absorbing `(sep, right)`.
    ///
    /// Returns the separator to push up and the new right sibling.
    fn split_internal(
        &self,
        node: &mut NodeGuard,
        left_index: usize,
        sep: Key,
        right: NodeId,
    ) -> (Key, NodeId) {
        node.insert_into_node(left_index, sep, right);

        let parent_hint = node.parent;
        let split = cut(self.config.max_order + 1);
        let NodeBody::Internal { keys, children } = &mut node.body else {
            unreachable!("split_internal called on a leaf")
        };
        let right_keys = keys.split_off(split);
        let up_key = keys.pop().expect("left half keeps at least one key");
        let right_children = children.split_off(split);
        debug_assert_eq!(right_children.len(), right_keys.len() + 1);

        let moved = right_children.clone();
        let new_id = self.arena.alloc_internal(right_keys, right_children);
        self.arena.lock(new_id).parent = parent_hint;
        self.reparent(&moved, new_id);
        trace!(left = ?node.id, right = ?new_id, up_key, "internal split");
        (up_key, new_id)
    }

    // ========================================================================
    //  Delete
    // ========================================================================

    /// Delete `key`. Absent keys are a no-op.
    ///
    /// Uses the same lock-coupling discipline as [`Self::insert`]: a node
    /// is safe for deletion when removing one entry cannot drop it below
    /// the structural floor (for the root: when it cannot force a root
    /// swap).
    ///
    /// # Errors
    ///
    /// Currently infallible for valid trees; the `Result` is part of the
    /// tree contract shared by all benchmark subjects.
    pub fn delete(&self, key: Key) -> Result<(), TreeError> {
        let root_slot = self.root.lock();
        if root_slot.is_none() {
            return Ok(());
        }
        let root_id = root_slot.expect("checked above");

        let min_keys = self.config.min_keys();
        let (mut path, mut tree_guard) = self.descend(root_id, key, root_slot, |keys, is_root| {
            if is_root {
                keys >= 2
            } else {
                keys > min_keys
            }
        });

        let mut leaf = path.pop().expect("descent returns at least the leaf");
        if leaf.remove_from_leaf(key).is_none() {
            return Ok(());
        }
        self.count.fetch_sub(1, Ordering::AcqRel);

        if leaf.parent.is_none() {
            // Root leaf: the tree empties when its last key goes.
            if leaf.num_keys() == 0 {
                let mut slot = tree_guard.take().expect("emptying the root without the tree lock");
                *slot = None;
            }
            return Ok(());
        }

        if leaf.num_keys() >= min_keys {
            assert!(tree_guard.is_none(), "tree locked but leaf is safe");
            assert!(path.is_empty(), "locks retained above a safe leaf");
            return Ok(());
        }

        self.rebalance(path, tree_guard, leaf);
        Ok(())
    }

    /// Restore the floor for an underflowed node, cascading separator
    /// deletions up through the held lock suffix.
    fn rebalance(
        &self,
        mut path: Vec<NodeGuard>,
        mut tree_guard: Option<TreeGuard<'_>>,
        mut node: NodeGuard,
    ) {
        loop {
            let mut parent = path.pop().expect("underflowed non-root without its parent locked");
            let idx = parent
                .get_left_index(node.id)
                .expect("underflowed child missing from its parent");

            // Prefer the left sibling; only the leftmost child borrows
            // from its right.
            let (nb_idx, k_idx) = if idx == 0 { (1, 0) } else { (idx - 1, idx - 1) };
            let NodeBody::Internal { keys, children } = &parent.body else {
                unreachable!("parent of a node is internal")
            };
            let nb_id = children[nb_idx];
            let k_prime = keys[k_idx];
            // The sibling is only reachable through the locked parent, so
            // this acquisition cannot deadlock.
            let nb = self.arena.lock(nb_id);

            let sep_cost = usize::from(!node.is_leaf());
            if node.num_keys() + nb.num_keys() + sep_cost <= self.config.max_order {
                // Merge right into left and delete the separator above.
                let (mut left, right) = if idx == 0 { (node, nb) } else { (nb, node) };
                let right_id = right.id;
                self.coalesce(&mut left, right, k_prime);
                let removed = parent.remove_child(right_id);
                debug_assert_eq!(removed, Some(k_prime));
                trace!(left = ?left.id, right = ?right_id, "coalesced siblings");
                drop(left);

                if parent.parent.is_none() {
                    self.adjust_root(&parent, &mut tree_guard);
                    return;
                }
                if parent.num_keys() >= self.config.min_keys() {
                    return;
                }
                node = parent;
            } else {
                redistribute(&mut parent, &mut node, nb, idx == 0, k_idx, k_prime);
                if let NodeBody::Internal { children, .. } = &node.body {
                    // A child changed hands; fix its back-reference.
                    let moved = if idx == 0 {
                        children[children.len() - 1]
                    } else {
                        children[0]
                    };
                    let node_id = node.id;
                    drop(node);
                    self.arena.lock(moved).parent = Some(node_id);
                }
                return;
            }
        }
    }

    /// Fold `right` into `left`; for internal nodes the separator from
    /// the parent joins the merged key sequence.
    fn coalesce(&self, left: &mut NodeGuard, mut right: NodeGuard, k_prime: Key) {
        let left_id = left.id;
        let moved = match (&mut left.body, &mut right.body) {
            (
                NodeBody::Leaf { entries, next },
                NodeBody::Leaf {
                    entries: r_entries,
                    next: r_next,
                },
            ) => {
                entries.append(r_entries);
                *next = *r_next;
                Vec::new()
            }
            (
                NodeBody::Internal { keys, children },
                NodeBody::Internal {
                    keys: r_keys,
                    children: r_children,
                },
            ) => {
                keys.push(k_prime);
                keys.append(r_keys);
                let moved = std::mem::take(r_children);
                children.extend_from_slice(&moved);
                moved
            }
            _ => panic!("coalescing nodes of different kinds"),
        };
        drop(right);
        self.reparent(&moved, left_id);
    }

    /// Root post-processing after a merge removed one of its children.
    fn adjust_root(&self, root: &NodeGuard, tree_guard: &mut Option<TreeGuard<'_>>) {
        if root.num_keys() > 0 {
            return;
        }
        let mut slot = tree_guard
            .take()
            .expect("shrinking the root without the tree lock");
        let NodeBody::Internal { children, .. } = &root.body else {
            unreachable!("leaf roots are handled before rebalancing")
        };
        // A zero-key internal root has exactly one child left; promote
        // it instead of discarding the subtree.
        let sole = children[0];
        self.arena.lock(sole).parent = None;
        *slot = Some(sole);
        trace!(root = ?sole, "tree shrank a level");
    }

    // ========================================================================
    //  Shared descent
    // ========================================================================

    /// Lock-coupling descent to the leaf for `key`.
    ///
    /// `is_safe(num_keys, is_root)` decides whether a just-locked node can
    /// absorb the pending mutation locally; a safe node releases the tree
    /// lock and every ancestor guard. Returns the retained unsafe suffix
    /// (always ending with the leaf) and the tree lock if still held.
    fn descend<'a>(
        &'a self,
        root_id: NodeId,
        key: Key,
        root_slot: TreeGuard<'a>,
        is_safe: impl Fn(usize, bool) -> bool,
    ) -> (Vec<NodeGuard>, Option<TreeGuard<'a>>) {
        let mut tree_guard = Some(root_slot);
        let mut path: Vec<NodeGuard> = Vec::new();

        let current = self.arena.lock(root_id);
        if is_safe(current.num_keys(), true) {
            tree_guard = None;
        }
        path.push(current);

        loop {
            let node = path.last().expect("path is never empty here");
            if node.is_leaf() {
                return (path, tree_guard);
            }
            let child_id = node.route(key);
            let child = self.arena.lock(child_id);
            if is_safe(child.num_keys(), false) {
                tree_guard = None;
                path.clear();
            }
            path.push(child);
        }
    }
}

/// Move one entry from `nb` into `node` and refresh the parent separator.
///
/// `nb_is_right` is set when `node` is the leftmost child borrowing from
/// its right sibling. Caller fixes the moved child's parent handle for
/// internal nodes.
fn redistribute(
    parent: &mut NodeGuard,
    node: &mut NodeGuard,
    mut nb: NodeGuard,
    nb_is_right: bool,
    k_idx: usize,
    k_prime: Key,
) {
    let new_sep = match (&mut node.body, &mut nb.body) {
        (
            NodeBody::Leaf { entries, .. },
            NodeBody::Leaf {
                entries: nb_entries,
                ..
            },
        ) => {
            if nb_is_right {
                let entry = nb_entries.remove(0);
                entries.push(entry);
                nb_entries[0].0
            } else {
                let entry = nb_entries.pop().expect("sibling can spare an entry");
                let sep = entry.0;
                entries.insert(0, entry);
                sep
            }
        }
        (
            NodeBody::Internal { keys, children },
            NodeBody::Internal {
                keys: nb_keys,
                children: nb_children,
            },
        ) => {
            if nb_is_right {
                keys.push(k_prime);
                children.push(nb_children.remove(0));
                nb_keys.remove(0)
            } else {
                keys.insert(0, k_prime);
                children.insert(0, nb_children.pop().expect("sibling can spare a child"));
                nb_keys.pop().expect("sibling can spare a key")
            }
        }
        _ => panic!("redistributing between nodes of different kinds"),
    };

    let NodeBody::Internal { keys, .. } = &mut parent.body else {
        unreachable!("parent of a node is internal")
    };
    keys[k_idx] = new_sep;
}

// ============================================================================
//  Tests
// ============================================================================
