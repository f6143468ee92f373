//! Stage 3: propagate structural changes one internal level per round.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;

use tracing::trace;

use crate::arena::NodeId;
use crate::node::Node;
use crate::palm::{self, ModKind, ModMap, Modification, RoundState};
use crate::tree::BpTree;

/// Apply one round of accumulated modifications.
///
/// The first-claim rule is re-applied to this level's modification
/// targets: the owner of a target is the lowest-indexed worker whose map
/// mentions it, and the owner applies *every* worker's modifications for
/// that target, not just its own. After absorbing them the node is
/// re-evaluated and may emit exactly one modification of its own for the
/// next level up.
pub(crate) fn propagate(tree: &BpTree, state: &RoundState, index: usize) {
    let mut claimed: HashSet<Option<NodeId>> = HashSet::new();
    for earlier in &state.mods[..index] {
        claimed.extend(earlier.lock().keys().copied());
    }
    let targets: Vec<Option<NodeId>> = state.mods[index]
        .lock()
        .keys()
        .copied()
        .filter(|target| !claimed.contains(target))
        .collect();
    if targets.is_empty() {
        return;
    }

    let mut gathered: HashMap<Option<NodeId>, Vec<Modification>> =
        targets.iter().map(|&t| (t, Vec::new())).collect();
    for slot in &state.mods {
        let map = slot.lock();
        for (target, mods) in gathered.iter_mut() {
            if let Some(found) = map.get(target) {
                mods.extend(found.iter().cloned());
            }
        }
    }
    trace!(worker = index, targets = gathered.len(), "propagating modifications");

    let mut next = ModMap::new();
    let mut orphans = Vec::new();
    let mut removed = 0usize;
    for (target, mods) in gathered {
        let Some(node_id) = target else {
            // A root-emitted modification belongs to the finalize step;
            // keep forwarding it so it is never lost mid-propagation.
            next.entry(None).or_default().extend(mods);
            continue;
        };
        let mut node = tree.arena.lock(node_id);
        apply_mods(tree, &mut node, &mods);

        if node.is_overfull(tree.config().max_order) {
            let splits = palm::big_split(tree, &mut node);
            next.entry(node.parent).or_default().push(Modification {
                node: node_id,
                kind: ModKind::Split(splits),
            });
        } else if node.parent.is_some() && node.is_underfull(tree.config().min_order) {
            // The whole subtree dissolves; its entries come back through
            // reinsertion once the round settles.
            let survivors = palm::collect_entries(tree, &node);
            removed += survivors.len();
            orphans.extend(survivors);
            state.chain_dirty.store(true, Ordering::Relaxed);
            next.entry(node.parent).or_default().push(Modification {
                node: node_id,
                kind: ModKind::Dissolve,
            });
        }
    }

    state.removed.fetch_add(removed, Ordering::Relaxed);
    *state.next_mods[index].lock() = next;
    state.orphans[index].lock().extend(orphans);
}

/// Absorb a set of modifications into their common target node.
///
/// Split siblings are spliced in by separator order and adopt the target
/// as parent; dissolved children are unlinked by identity.
pub(crate) fn apply_mods(tree: &BpTree, node: &mut Node, mods: &[Modification]) {
    for modification in mods {
        match &modification.kind {
            ModKind::Split(splits) => {
                for &(sep, sibling) in splits {
                    node.insert_child_by_key(sep, sibling);
                    tree.arena.lock(sibling).parent = Some(node.id);
                }
            }
            ModKind::Dissolve => {
                node.remove_child(modification.node);
            }
        }
    }
}
