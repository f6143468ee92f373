//! Stage 1: locate candidate leaves.

use tracing::trace;

use crate::palm::bsp::chunk;
use crate::palm::RoundState;
use crate::query::Query;
use crate::tree::BpTree;

/// Descend for every live query in this worker's slice and publish the
/// deduplicated set of leaves touched.
///
/// The descents are unlocked reads of a structure nobody mutates during
/// this phase, so no coordination is needed beyond the closing barrier.
pub(crate) fn locate(
    tree: &BpTree,
    batch: &[Query],
    state: &RoundState,
    index: usize,
    threads: usize,
) {
    let slice = &batch[chunk(batch.len(), threads, index)];
    let mut leaves = Vec::new();
    for query in slice.iter().filter(|q| !q.done) {
        if let Some(leaf) = tree.find_leaf(query.key) {
            if !leaves.contains(&leaf) {
                leaves.push(leaf);
            }
        }
    }
    trace!(worker = index, leaves = leaves.len(), "located candidate leaves");
    *state.leaves[index].lock() = leaves;
}
