//! Stage 4: finalize the root and collect orphans.

use std::sync::atomic::Ordering;

use tracing::trace;

use crate::arena::NodeId;
use crate::node::{Entry, Key, NodeBody};
use crate::palm::{self, ModKind, RoundState, stage3};
use crate::tree::BpTree;

/// Sequentially absorb the last round's modifications into the root,
/// grow or shrink the tree as needed, repair the leaf chain when
/// dissolves tore it, and return every orphaned entry of the round.
///
/// Runs on the driver thread after all workers have joined.
pub(crate) fn finalize(tree: &mut BpTree, state: &RoundState) -> Vec<Entry> {
    let mut root_id =
        (*tree.root.get_mut()).expect("a batch round always starts with a root");

    // Split pairs emitted by the root itself; everything else targets
    // the root by handle.
    let mut root_splits: Vec<(Key, NodeId)> = Vec::new();
    for slot in &state.mods {
        let map = std::mem::take(&mut *slot.lock());
        for (target, mods) in map {
            match target {
                Some(id) => {
                    let mut node = tree.arena.lock(id);
                    stage3::apply_mods(tree, &mut node, &mods);
                }
                None => {
                    for modification in mods {
                        match modification.kind {
                            ModKind::Split(splits) => root_splits.extend(splits),
                            ModKind::Dissolve => {
                                unreachable!("the root never dissolves")
                            }
                        }
                    }
                }
            }
        }
    }

    if !root_splits.is_empty() {
        root_splits.sort_unstable_by_key(|&(sep, _)| sep);
        root_id = grow_root(tree, root_id, root_splits);
    }

    // The root may still hold more keys than fit; keep splitting until
    // it satisfies capacity again.
    loop {
        let mut root = tree.arena.lock(root_id);
        if !root.is_overfull(tree.config().max_order) {
            break;
        }
        let splits = palm::big_split(tree, &mut root);
        drop(root);
        root_id = grow_root(tree, root_id, splits);
    }

    // Shrink: promote through zero-key internal roots; a zero-key leaf
    // root means the tree emptied.
    let new_root = shrink_root(tree, root_id);
    *tree.root.get_mut() = new_root;

    if state.chain_dirty.load(Ordering::Relaxed) {
        if let Some(root) = new_root {
            relink_leaf_chain(tree, root);
        }
    }

    state
        .orphans
        .iter()
        .flat_map(|slot| std::mem::take(&mut *slot.lock()))
        .collect()
}

/// Put a fresh root above `root_id` and its freshly split siblings.
fn grow_root(tree: &BpTree, root_id: NodeId, splits: Vec<(Key, NodeId)>) -> NodeId {
    let (seps, siblings): (Vec<Key>, Vec<NodeId>) = splits.into_iter().unzip();
    let mut children = Vec::with_capacity(siblings.len() + 1);
    children.push(root_id);
    children.extend(siblings);
    let new_root = tree.arena.alloc_internal(seps, children.clone());
    tree.reparent(&children, new_root);
    trace!(root = ?new_root, children = children.len(), "tree grew a level");
    new_root
}

/// Resolve a possibly zero-key root to the tree's real top.
fn shrink_root(tree: &BpTree, mut root_id: NodeId) -> Option<NodeId> {
    loop {
        let guard = tree.arena.lock(root_id);
        if guard.num_keys() > 0 {
            return Some(root_id);
        }
        match &guard.body {
            NodeBody::Leaf { .. } => {
                trace!("tree emptied");
                return None;
            }
            NodeBody::Internal { children, .. } => {
                // Zero keys leaves at most one child; promote it. No
                // children at all means every subtree dissolved.
                let Some(&sole) = children.first() else {
                    trace!("tree emptied");
                    return None;
                };
                drop(guard);
                tree.arena.lock(sole).parent = None;
                trace!(root = ?sole, "tree shrank a level");
                root_id = sole;
            }
        }
    }
}

/// Rebuild the leaf chain from the tree structure after dissolves left
/// next-pointers aimed at unlinked leaves.
fn relink_leaf_chain(tree: &BpTree, root: NodeId) {
    let mut leaves = Vec::new();
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        let guard = tree.arena.lock(id);
        match &guard.body {
            NodeBody::Leaf { .. } => leaves.push(id),
            NodeBody::Internal { children, .. } => {
                stack.extend(children.iter().rev().copied());
            }
        }
    }
    for window in leaves.windows(2) {
        set_next(tree, window[0], Some(window[1]));
    }
    if let Some(&last) = leaves.last() {
        set_next(tree, last, None);
    }
}

fn set_next(tree: &BpTree, leaf: NodeId, to: Option<NodeId>) {
    let mut guard = tree.arena.lock(leaf);
    let NodeBody::Leaf { next, .. } = &mut guard.body else {
        unreachable!("chain repair visits leaves only")
    };
    *next = to;
}
