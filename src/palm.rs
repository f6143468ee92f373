//! Bulk-synchronous batch processing of mixed find/insert/delete queries.
//!
//! A batch is processed in four stages separated by barriers:
//!
//! 1. **Locate** — each worker descends for its slice of the batch and
//!    records the candidate leaves.
//! 2. **Own and mutate** — leaves are partitioned by the first-claim rule,
//!    finds are answered against the pre-batch state, and each owner
//!    applies every insert/delete destined for its leaves.
//! 3. **Propagate** — structural changes climb one internal level per
//!    round, re-partitioned by first claim at every level.
//! 4. **Finalize** — the root absorbs the last round's changes, grows or
//!    shrinks, and entries orphaned by dissolved nodes are reinserted.
//!
//! Ownership replaces locking: a node is written by exactly one worker per
//! phase, so the per-node mutexes are never contended inside a round. The
//! round holds `&mut self` for its whole duration, which keeps the
//! single-operation engine out by construction.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::arena::NodeId;
use crate::error::TreeError;
use crate::node::{Entry, Key, Node, NodeBody};
use crate::query::{FindResult, Query};
use crate::record::Record;
use crate::tree::BpTree;

pub(crate) mod bsp;
mod stage1;
mod stage2;
mod stage3;
mod stage4;

use bsp::PhasedPool;

/// Rounds of orphan reinsertion attempted through the batch path before
/// falling back to lock-coupling inserts. Cascading coalescing has no
/// proven termination bound, so the recursion is cut off rather than
/// trusted.
const REINSERT_DEPTH_LIMIT: usize = 4;

// ============================================================================
//  Modification
// ============================================================================

/// Structural change a node asks its parent to absorb.
#[derive(Debug, Clone)]
pub(crate) struct Modification {
    /// The node the change happened in.
    pub node: NodeId,

    /// What the parent must do about it.
    pub kind: ModKind,
}

#[derive(Debug, Clone)]
pub(crate) enum ModKind {
    /// The node split; the parent gains one `(separator, sibling)` pair
    /// per new piece, in ascending key order.
    Split(Vec<(Key, NodeId)>),

    /// The node underflowed and was dissolved; the parent must unlink it.
    /// The subtree's surviving entries travel separately as orphans.
    Dissolve,
}

/// Modifications accumulated during one level, keyed by the parent that
/// must absorb them. A `None` key means the emitting node was the root.
pub(crate) type ModMap = std::collections::HashMap<Option<NodeId>, Vec<Modification>>;

// ============================================================================
//  RoundState
// ============================================================================

/// Shared state of one batch round.
///
/// Every vector is indexed by worker: a worker writes only its own slot
/// and reads other slots only after the barrier that ends the phase in
/// which they were written.
pub(crate) struct RoundState {
    /// Stage 1 output: candidate leaves per worker, deduplicated.
    pub leaves: Vec<parking_lot::Mutex<Vec<NodeId>>>,

    /// Find answers, in per-worker servicing order.
    pub results: Vec<parking_lot::Mutex<Vec<FindResult>>>,

    /// Indices into the caller's batch of the queries this worker serviced.
    pub serviced: Vec<parking_lot::Mutex<Vec<usize>>>,

    /// Modifications awaiting application at the current level.
    pub mods: Vec<parking_lot::Mutex<ModMap>>,

    /// Modifications emitted for the next level up.
    pub next_mods: Vec<parking_lot::Mutex<ModMap>>,

    /// Entries evicted by dissolved nodes, pending reinsertion.
    pub orphans: Vec<parking_lot::Mutex<Vec<Entry>>>,

    /// Entries added to / removed from leaves this round.
    pub added: std::sync::atomic::AtomicUsize,
    pub removed: std::sync::atomic::AtomicUsize,

    /// Set when a dissolve may have torn the leaf chain.
    pub chain_dirty: std::sync::atomic::AtomicBool,
}

impl RoundState {
    fn new(threads: usize) -> Self {
        fn slots<T: Default>(threads: usize) -> Vec<parking_lot::Mutex<T>> {
            (0..threads)
                .map(|_| parking_lot::Mutex::new(T::default()))
                .collect()
        }
        Self {
            leaves: slots(threads),
            results: slots(threads),
            serviced: slots(threads),
            mods: slots(threads),
            next_mods: slots(threads),
            orphans: slots(threads),
            added: std::sync::atomic::AtomicUsize::new(0),
            removed: std::sync::atomic::AtomicUsize::new(0),
            chain_dirty: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Make worker `index`'s freshly emitted modifications the input of
    /// the next propagate round. Runs between the two barriers of a
    /// round, each worker touching only its own slots.
    fn promote_mods(&self, index: usize) {
        let next = std::mem::take(&mut *self.next_mods[index].lock());
        *self.mods[index].lock() = next;
    }
}

// ============================================================================
//  Batch driver
// ============================================================================

impl BpTree {
    /// Process a whole batch of queries across `threads` workers.
    ///
    /// Returns one list of find answers per worker, in per-worker
    /// servicing order; correlate answers by key, not position. Serviced
    /// queries get their `done` flag set, so a batch may be resubmitted
    /// without double-applying mutations.
    ///
    /// The exclusive borrow is deliberate: a round must not overlap with
    /// single operations on the same tree.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::InvalidConfig`] when `threads` is zero.
    ///
    /// # Panics
    ///
    /// A panic in any worker aborts the whole round; no partial batch is
    /// ever committed silently.
    pub fn palm(
        &mut self,
        queries: &mut [Query],
        threads: usize,
    ) -> Result<Vec<Vec<FindResult>>, TreeError> {
        if threads == 0 {
            return Err(TreeError::InvalidConfig(
                "batch processing requires at least one worker thread",
            ));
        }
        self.palm_inner(queries, threads, 0)
    }

    fn palm_inner(
        &mut self,
        queries: &mut [Query],
        threads: usize,
        depth: usize,
    ) -> Result<Vec<Vec<FindResult>>, TreeError> {
        // An empty tree gets a bare leaf root so every descent has a
        // destination; stage 4 takes it back out if it stays empty.
        if self.root.get_mut().is_none() {
            let id = self.arena.alloc_leaf();
            *self.root.get_mut() = Some(id);
        }

        let rounds = self.height().saturating_sub(1);
        debug!(
            queries = queries.len(),
            threads, rounds, depth, "starting batch round"
        );

        let state = RoundState::new(threads);
        {
            let tree = &*self;
            let state = &state;
            let batch: &[Query] = queries;
            PhasedPool::new(threads).run(|ctx| {
                stage1::locate(tree, batch, state, ctx.index, threads);
                ctx.phase_boundary();
                stage2::own_and_mutate(tree, batch, state, ctx.index);
                ctx.phase_boundary();
                for _ in 0..rounds {
                    stage3::propagate(tree, state, ctx.index);
                    ctx.phase_boundary();
                    state.promote_mods(ctx.index);
                    ctx.phase_boundary();
                }
            });
        }

        for slot in &state.serviced {
            for &idx in slot.lock().iter() {
                queries[idx].done = true;
            }
        }
        let results: Vec<Vec<FindResult>> = state
            .results
            .iter()
            .map(|slot| std::mem::take(&mut *slot.lock()))
            .collect();

        let orphans = stage4::finalize(self, &state);

        let added = state.added.into_inner();
        let removed = state.removed.into_inner();
        let count = self.count.get_mut();
        *count = (*count + added)
            .checked_sub(removed)
            .expect("live key counter underflow");

        if !orphans.is_empty() {
            self.reinsert_orphans(orphans, threads, depth)?;
        }
        Ok(results)
    }

    /// Re-drive orphaned entries through a fresh batch round, bounded by
    /// [`REINSERT_DEPTH_LIMIT`]; past the bound the lock-coupling path
    /// takes over, which always terminates.
    fn reinsert_orphans(
        &mut self,
        orphans: Vec<Entry>,
        threads: usize,
        depth: usize,
    ) -> Result<(), TreeError> {
        if depth >= REINSERT_DEPTH_LIMIT {
            warn!(
                orphans = orphans.len(),
                depth, "reinsertion depth exhausted, falling back to single inserts"
            );
            for (key, record) in orphans {
                self.insert_record(key, record)?;
            }
            return Ok(());
        }
        debug!(orphans = orphans.len(), depth, "reinserting orphaned entries");
        let mut batch: Vec<Query> = orphans
            .into_iter()
            .map(|(key, record)| Query::insert_record(key, record))
            .collect();
        self.palm_inner(&mut batch, threads, depth + 1)?;
        Ok(())
    }
}

// ============================================================================
//  Shared structural helpers
// ============================================================================

/// Size of piece `index` when `total` items are spread over `pieces`
/// near-equal pieces, extras going to the earlier pieces.
const fn piece_len(total: usize, pieces: usize, index: usize) -> usize {
    total / pieces + (index < total % pieces) as usize
}

/// Multi-way split of an overfull node into evenly sized pieces.
///
/// The node keeps the first piece in place; every further piece becomes a
/// fresh sibling under the same parent. Returns the `(separator, sibling)`
/// pairs the parent must absorb, in ascending order. Leaf pieces are
/// linked into the chain locally; internal pieces adopt their children.
pub(crate) fn big_split(tree: &BpTree, node: &mut Node) -> Vec<(Key, NodeId)> {
    let parent = node.parent;
    let max_order = tree.config().max_order;

    match &mut node.body {
        NodeBody::Leaf { entries, next } => {
            let total = entries.len();
            let pieces = total.div_ceil(max_order);
            let mut rest = entries.split_off(piece_len(total, pieces, 0));
            let old_next = *next;

            let mut splits = Vec::with_capacity(pieces - 1);
            let mut chunks = Vec::with_capacity(pieces - 1);
            for index in 1..pieces {
                let len = piece_len(total, pieces, index);
                let chunk: Vec<Entry> = rest.drain(..len).collect();
                let id = tree.arena.alloc_leaf();
                splits.push((chunk[0].0, id));
                chunks.push(chunk);
            }
            debug_assert!(rest.is_empty());

            for (index, chunk) in chunks.into_iter().enumerate() {
                let id = splits[index].1;
                let mut sibling = tree.arena.lock(id);
                sibling.parent = parent;
                let NodeBody::Leaf {
                    entries: s_entries,
                    next: s_next,
                } = &mut sibling.body
                else {
                    unreachable!("allocated as a leaf")
                };
                *s_entries = chunk;
                *s_next = splits.get(index + 1).map(|&(_, id)| id).or(old_next);
            }
            *next = Some(splits[0].1);
            trace!(node = ?node.id, pieces, "leaf split");
            splits
        }

        NodeBody::Internal { keys, children } => {
            let total = keys.len();
            let pieces = total.div_ceil(max_order);
            // Children drive the partition: piece i takes g_i children
            // and the g_i - 1 keys between them; the key between two
            // pieces moves up as their separator.
            let groups = children.len();
            let mut key_stream = std::mem::take(keys).into_iter();
            let mut child_stream = std::mem::take(children).into_iter();

            let keep = piece_len(groups, pieces, 0);
            *keys = key_stream.by_ref().take(keep - 1).collect();
            *children = child_stream.by_ref().take(keep).collect();

            let mut splits = Vec::with_capacity(pieces - 1);
            for index in 1..pieces {
                let sep = key_stream
                    .next()
                    .expect("a separator precedes every extra piece");
                let len = piece_len(groups, pieces, index);
                let piece_keys: Vec<Key> = key_stream.by_ref().take(len - 1).collect();
                let piece_children: Vec<NodeId> = child_stream.by_ref().take(len).collect();
                let id = tree.arena.alloc_internal(piece_keys, piece_children.clone());
                tree.arena.lock(id).parent = parent;
                tree.reparent(&piece_children, id);
                splits.push((sep, id));
            }
            trace!(node = ?node.id, pieces, "internal split");
            splits
        }
    }
}

/// Every surviving leaf entry under `node`, gathered for reinsertion.
pub(crate) fn collect_entries(tree: &BpTree, node: &Node) -> Vec<Entry> {
    let mut out = Vec::new();
    let mut stack: Vec<NodeId> = match &node.body {
        NodeBody::Leaf { entries, .. } => {
            out.extend(entries.iter().cloned());
            return out;
        }
        NodeBody::Internal { children, .. } => children.clone(),
    };
    while let Some(id) = stack.pop() {
        let guard = tree.arena.lock(id);
        match &guard.body {
            NodeBody::Leaf { entries, .. } => out.extend(entries.iter().cloned()),
            NodeBody::Internal { children, .. } => stack.extend(children.iter().copied()),
        }
    }
    out
}

/// Empty-payload record for an insert query submitted without one.
pub(crate) fn empty_record() -> Arc<Record> {
    Arc::new(Record::new(Vec::new()))
}

// ============================================================================
//  Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Method;
    use crate::tree::TreeConfig;

    fn small_tree() -> BpTree {
        BpTree::with_config(TreeConfig {
            max_order: 4,
            min_order: 2,
        })
        .expect("valid config")
    }

    #[test]
    fn test_piece_len_partitions_exactly() {
        for total in 1..50 {
            for pieces in 1..=total {
                let sum: usize = (0..pieces).map(|i| piece_len(total, pieces, i)).sum();
                assert_eq!(sum, total);
                let min = (0..pieces).map(|i| piece_len(total, pieces, i)).min();
                let max = (0..pieces).map(|i| piece_len(total, pieces, i)).max();
                assert!(max.unwrap() - min.unwrap() <= 1);
            }
        }
    }

    #[test]
    fn test_batch_insert_then_find() {
        let mut tree = small_tree();
        let mut batch: Vec<Query> = (0..100u64).map(|k| Query::insert(k, k.to_be_bytes())).collect();
        tree.palm(&mut batch, 4).unwrap();

        assert_eq!(tree.len(), 100);
        tree.check_invariants();
        assert!(batch.iter().all(|q| q.done));
        for k in 0..100u64 {
            assert_eq!(tree.find(k).unwrap().value(), &k.to_be_bytes());
        }
    }

    #[test]
    fn test_batch_on_empty_tree_bootstraps_and_cleans_up() {
        let mut tree = small_tree();

        // All-find batch on an empty tree must not leave a root behind.
        let mut finds: Vec<Query> = (0..8u64).map(Query::find).collect();
        let results = tree.palm(&mut finds, 2).unwrap();
        assert!(results.iter().flatten().all(|r| r.record.is_none()));
        assert!(tree.is_empty());
        assert_eq!(tree.find(0), Err(TreeError::NotFound));
        tree.check_invariants();
    }

    #[test]
    fn test_batch_mixed_methods_single_round() {
        let mut tree = small_tree();
        let mut seed: Vec<Query> = (0..40u64).map(|k| Query::insert(k, b"seed".as_slice())).collect();
        tree.palm(&mut seed, 3).unwrap();

        let mut batch = vec![
            Query::find(5),
            Query::delete(5),
            Query::insert(100, b"new".as_slice()),
            Query::find(999),
        ];
        let results = tree.palm(&mut batch, 2).unwrap();
        tree.check_invariants();

        // Finds answer against the pre-batch state, correlated by key.
        let flat: Vec<&FindResult> = results.iter().flatten().collect();
        assert_eq!(flat.len(), 2);
        for r in flat {
            match r.key {
                5 => assert_eq!(r.record.as_ref().unwrap().value(), b"seed"),
                999 => assert!(r.record.is_none()),
                other => panic!("unexpected find answer for key {other}"),
            }
        }
        assert_eq!(tree.find(5), Err(TreeError::NotFound));
        assert_eq!(tree.find(100).unwrap().value(), b"new");
        assert_eq!(tree.len(), 40);
    }

    #[test]
    fn test_done_queries_are_skipped() {
        let mut tree = small_tree();
        let mut batch = vec![Query::insert(1, b"a".as_slice()), Query::insert(2, b"b".as_slice())];
        batch[0].done = true;
        tree.palm(&mut batch, 2).unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.find(1), Err(TreeError::NotFound));
        assert!(tree.find(2).is_ok());
    }

    #[test]
    fn test_duplicate_keys_in_one_batch_resolve_in_order() {
        let mut tree = small_tree();
        let mut batch = vec![
            Query::insert(7, b"first".as_slice()),
            Query::insert(7, b"second".as_slice()),
        ];
        tree.palm(&mut batch, 2).unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.find(7).unwrap().value(), b"second");
        tree.check_invariants();
    }

    #[test]
    fn test_batch_delete_to_empty() {
        let mut tree = small_tree();
        let mut seed: Vec<Query> = (0..30u64).map(|k| Query::insert(k, b"v".as_slice())).collect();
        tree.palm(&mut seed, 4).unwrap();

        let mut wipe: Vec<Query> = (0..30u64).map(Query::delete).collect();
        tree.palm(&mut wipe, 4).unwrap();
        assert!(tree.is_empty());
        tree.check_invariants();

        // The tree restarts cleanly after emptying.
        tree.insert(1, b"back").unwrap();
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_zero_threads_is_an_error() {
        let mut tree = small_tree();
        let mut batch = vec![Query::find(1)];
        assert!(matches!(
            tree.palm(&mut batch, 0),
            Err(TreeError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_more_threads_than_queries() {
        let mut tree = small_tree();
        let mut batch = vec![Query::insert(1, b"x".as_slice())];
        tree.palm(&mut batch, 8).unwrap();
        assert_eq!(tree.len(), 1);
        tree.check_invariants();
    }

    #[test]
    fn test_big_split_leaf_preserves_chain_and_order() {
        let tree = small_tree();
        let root = tree.arena.alloc_leaf();
        {
            let mut leaf = tree.arena.lock(root);
            for k in 0..10u64 {
                leaf.insert_into_leaf(k, Arc::new(Record::new(vec![u8::try_from(k).unwrap()])));
            }
            let splits = big_split(&tree, &mut leaf);
            // 10 entries over max_order 4 make 3 pieces.
            assert_eq!(splits.len(), 2);
            assert!(splits.windows(2).all(|w| w[0].0 < w[1].0));
            assert_eq!(leaf.num_keys(), 4);
        }
        // Chain: root piece -> sibling 1 -> sibling 2 -> None.
        let mut seen = Vec::new();
        let mut cursor = Some(root);
        while let Some(id) = cursor {
            let guard = tree.arena.lock(id);
            seen.extend(guard.keys_vec());
            let NodeBody::Leaf { next, .. } = &guard.body else {
                panic!("chain left the leaf level")
            };
            cursor = *next;
        }
        assert_eq!(seen, (0..10u64).collect::<Vec<_>>());
    }

    #[test]
    fn test_big_split_internal_redistributes_children() {
        let tree = small_tree();
        let children: Vec<NodeId> = (0..10).map(|_| tree.arena.alloc_leaf()).collect();
        let keys: Vec<Key> = (1..10u64).map(|k| k * 10).collect();
        let id = tree.arena.alloc_internal(keys, children.clone());

        let mut guard = tree.arena.lock(id);
        let splits = big_split(&tree, &mut guard);
        let own_children = match &guard.body {
            NodeBody::Internal { children, .. } => children.clone(),
            NodeBody::Leaf { .. } => panic!("node changed shape"),
        };
        drop(guard);

        // Every child is accounted for exactly once and knows its parent.
        let mut all = own_children.clone();
        let mut total_keys = tree.arena.lock(id).num_keys();
        for &(_, sib) in &splits {
            let sib_guard = tree.arena.lock(sib);
            total_keys += sib_guard.num_keys();
            match &sib_guard.body {
                NodeBody::Internal { children, .. } => {
                    for &c in children {
                        assert_eq!(tree.arena.lock(c).parent, Some(sib));
                    }
                    all.extend(children.iter().copied());
                }
                NodeBody::Leaf { .. } => panic!("sibling changed shape"),
            }
        }
        assert_eq!(all, children);
        // One key per piece boundary moved up.
        assert_eq!(total_keys + splits.len(), 9);
    }

    #[test]
    fn test_methods_route_as_expected() {
        // Guard against Query constructors drifting from their methods.
        assert_eq!(Query::find(1).method, Method::Find);
        assert_eq!(Query::insert(1, b"v".as_slice()).method, Method::Insert);
        assert_eq!(Query::delete(1).method, Method::Delete);
    }
}
