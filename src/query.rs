//! Batch wire shapes: queries submitted to a Palm round and the results it
//! hands back.

use std::sync::Arc;

use crate::node::Key;
use crate::record::Record;

/// Operation requested by a [`Query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Point lookup; answered in stage 2 against the pre-batch tree state.
    Find,
    /// Insert or replace the record for a key.
    Insert,
    /// Remove a key; absent keys are a no-op.
    Delete,
}

/// One unit of work submitted to a Palm round.
#[derive(Debug, Clone)]
pub struct Query {
    /// Requested operation.
    pub method: Method,

    /// Target key.
    pub key: Key,

    /// Set when this query was already serviced in an earlier round.
    ///
    /// Palm skips done queries, so a caller may resubmit a partially
    /// processed batch without double-applying mutations.
    pub done: bool,

    /// Payload for [`Method::Insert`]; `None` otherwise.
    pub record: Option<Arc<Record>>,
}

impl Query {
    /// Build a find query.
    #[must_use]
    pub const fn find(key: Key) -> Self {
        Self {
            method: Method::Find,
            key,
            done: false,
            record: None,
        }
    }

    /// Build an insert query carrying `value`.
    #[must_use]
    pub fn insert(key: Key, value: impl Into<Box<[u8]>>) -> Self {
        Self::insert_record(key, Arc::new(Record::new(value)))
    }

    /// Build an insert query reusing an existing record allocation.
    ///
    /// Orphan reinsertion uses this to preserve the original payloads.
    #[must_use]
    pub const fn insert_record(key: Key, record: Arc<Record>) -> Self {
        Self {
            method: Method::Insert,
            key,
            done: false,
            record: Some(record),
        }
    }

    /// Build a delete query.
    #[must_use]
    pub const fn delete(key: Key) -> Self {
        Self {
            method: Method::Delete,
            key,
            done: false,
            record: None,
        }
    }
}

/// Answer to a single [`Method::Find`] query.
///
/// Palm result lists preserve per-thread servicing order, not global
/// submission order, so each answer carries its key for correlation.
#[derive(Debug, Clone)]
pub struct FindResult {
    /// The key that was looked up.
    pub key: Key,

    /// The record found, or `None` when the key was absent.
    pub record: Option<Arc<Record>>,
}
