//! The contract every tree variant in a benchmark harness implements.

use std::sync::Arc;

use crate::error::TreeError;
use crate::node::Key;
use crate::query::{FindResult, Query};
use crate::record::Record;
use crate::tree::BpTree;

/// Common surface of all benchmark subjects.
///
/// Baselines (a sequential tree, a single-global-mutex wrapper) can
/// implement this same trait to stay drop-in interchangeable with
/// [`BpTree`] in a throughput harness.
pub trait TreeApi {
    /// Insert or replace the record for `key`.
    ///
    /// # Errors
    ///
    /// Implementation-defined; [`BpTree`] never fails on a valid tree.
    fn insert(&self, key: Key, value: &[u8]) -> Result<(), TreeError>;

    /// Remove `key`; absent keys are a no-op.
    ///
    /// # Errors
    ///
    /// Implementation-defined; [`BpTree`] never fails on a valid tree.
    fn delete(&self, key: Key) -> Result<(), TreeError>;

    /// Look up `key`.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::NotFound`] when the key is absent.
    fn find(&self, key: Key) -> Result<Arc<Record>, TreeError>;

    /// Process a whole batch across `threads` workers, returning one
    /// find-answer list per worker.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::InvalidConfig`] when `threads` is zero.
    fn palm(
        &mut self,
        queries: &mut [Query],
        threads: usize,
    ) -> Result<Vec<Vec<FindResult>>, TreeError>;
}

impl TreeApi for BpTree {
    fn insert(&self, key: Key, value: &[u8]) -> Result<(), TreeError> {
        Self::insert(self, key, value)
    }

    fn delete(&self, key: Key) -> Result<(), TreeError> {
        Self::delete(self, key)
    }

    fn find(&self, key: Key) -> Result<Arc<Record>, TreeError> {
        Self::find(self, key)
    }

    fn palm(
        &mut self,
        queries: &mut [Query],
        threads: usize,
    ) -> Result<Vec<Vec<FindResult>>, TreeError> {
        Self::palm(self, queries, threads)
    }
}
