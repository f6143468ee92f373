//! Stage 2: claim leaves, answer finds, mutate.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;

use tracing::trace;

use crate::arena::NodeId;
use crate::node::{Entry, NodeBody};
use crate::palm::{self, ModKind, ModMap, Modification, RoundState};
use crate::query::{FindResult, Method, Query};
use crate::tree::BpTree;

/// Resolve leaf ownership for this worker, answer its finds, and apply
/// its inserts and deletes.
///
/// Ownership follows the first-claim rule: worker `i` owns a leaf iff the
/// leaf is in its stage-1 set and in no earlier worker's set. The owner
/// services every live query in the whole batch that lands in one of its
/// leaves, in batch order, so conflicting queries on one leaf resolve
/// deterministically. Finds are answered before any mutation and so
/// observe the pre-batch state.
pub(crate) fn own_and_mutate(
    tree: &BpTree,
    batch: &[Query],
    state: &RoundState,
    index: usize,
) {
    let mut claimed: HashSet<NodeId> = HashSet::new();
    for earlier in &state.leaves[..index] {
        claimed.extend(earlier.lock().iter().copied());
    }
    let owned: HashSet<NodeId> = state.leaves[index]
        .lock()
        .iter()
        .copied()
        .filter(|leaf| !claimed.contains(leaf))
        .collect();
    if owned.is_empty() {
        return;
    }
    trace!(worker = index, owned = owned.len(), "claimed leaves");

    // Scan the whole batch: answer finds now, queue mutations per leaf.
    let mut results: Vec<FindResult> = Vec::new();
    let mut serviced: Vec<usize> = Vec::new();
    let mut pending: HashMap<NodeId, Vec<usize>> = HashMap::new();
    for (idx, query) in batch.iter().enumerate() {
        if query.done {
            continue;
        }
        let Some(leaf) = tree.find_leaf(query.key) else {
            continue;
        };
        if !owned.contains(&leaf) {
            continue;
        }
        match query.method {
            Method::Find => {
                let record = tree.arena.lock(leaf).leaf_lookup(query.key);
                results.push(FindResult {
                    key: query.key,
                    record,
                });
            }
            Method::Insert | Method::Delete => pending.entry(leaf).or_default().push(idx),
        }
        serviced.push(idx);
    }

    // Mutate each owned leaf and classify the result.
    let mut added = 0usize;
    let mut removed = 0usize;
    let mut mods = ModMap::new();
    let mut orphans: Vec<Entry> = Vec::new();
    for (&leaf_id, indices) in &pending {
        let mut leaf = tree.arena.lock(leaf_id);
        for &idx in indices {
            let query = &batch[idx];
            match query.method {
                Method::Insert => {
                    let record = query.record.clone().unwrap_or_else(palm::empty_record);
                    if leaf.insert_into_leaf(query.key, record).is_none() {
                        added += 1;
                    }
                }
                Method::Delete => {
                    if leaf.remove_from_leaf(query.key).is_some() {
                        removed += 1;
                    }
                }
                Method::Find => unreachable!("finds were answered before mutation"),
            }
        }

        if leaf.is_overfull(tree.config().max_order) {
            let splits = palm::big_split(tree, &mut leaf);
            mods.entry(leaf.parent).or_default().push(Modification {
                node: leaf_id,
                kind: ModKind::Split(splits),
            });
        } else if leaf.parent.is_some() && leaf.is_underfull(tree.config().min_order) {
            // Dissolve: the parent will unlink this leaf, its survivors
            // come back through reinsertion. The root is exempt.
            let NodeBody::Leaf { entries, .. } = &mut leaf.body else {
                unreachable!("stage 2 mutates leaves only")
            };
            let survivors: Vec<Entry> = entries.drain(..).collect();
            removed += survivors.len();
            orphans.extend(survivors);
            state.chain_dirty.store(true, Ordering::Relaxed);
            mods.entry(leaf.parent).or_default().push(Modification {
                node: leaf_id,
                kind: ModKind::Dissolve,
            });
        }
    }

    state.added.fetch_add(added, Ordering::Relaxed);
    state.removed.fetch_add(removed, Ordering::Relaxed);
    *state.results[index].lock() = results;
    *state.serviced[index].lock() = serviced;
    *state.mods[index].lock() = mods;
    *state.orphans[index].lock() = orphans;
}
