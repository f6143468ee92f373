//! # `palmtree`
//!
//! A concurrent in-memory B+ tree with two interchangeable concurrency
//! strategies:
//!
//! - **Lock-coupling ("crabbing")** single operations: insert, delete and
//!   find descend root-to-leaf taking per-node locks, releasing everything
//!   held the moment a node is found safe to absorb the mutation.
//! - **Bulk-synchronous batch rounds**: a whole batch of mixed
//!   find/insert/delete queries is processed by `P` workers in lock-step
//!   phases separated by barriers, with deterministic first-claim
//!   ownership replacing per-node locking entirely.
//!
//! | Feature | Status |
//! |---------|--------|
//! | Concurrent find/insert/delete | Works (lock-coupling) |
//! | Batch rounds | Works (exclusive `&mut self` per round) |
//! | Memory reclamation | Partial (detached nodes freed at tree drop) |
//! | Range scans | Not implemented |
//! | Persistence | Not implemented |
//!
//! ## Thread Safety
//!
//! [`BpTree`] is `Send + Sync`; the single-operation methods take `&self`
//! and may run from any number of threads:
//!
//! ```rust
//! use palmtree::BpTree;
//!
//! let tree = BpTree::new();
//! std::thread::scope(|s| {
//!     s.spawn(|| tree.insert(1, b"one").unwrap());
//!     s.spawn(|| tree.insert(2, b"two").unwrap());
//! });
//! assert_eq!(tree.find(1).unwrap().value(), b"one");
//! ```
//!
//! Batch rounds take `&mut self`, so the borrow checker guarantees a
//! round never overlaps with single operations on the same tree:
//!
//! ```rust
//! use palmtree::{BpTree, Query};
//!
//! let mut tree = BpTree::new();
//! let mut batch: Vec<Query> = (0..100u64)
//!     .map(|k| Query::insert(k, k.to_be_bytes()))
//!     .collect();
//! tree.palm(&mut batch, 4).unwrap();
//! assert_eq!(tree.len(), 100);
//! ```
//!
//! ## Keys and Values
//!
//! Keys are `u64`; values are opaque byte payloads stored behind
//! [`Record`] handles at leaf level only.

#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod api;
mod arena;
mod error;
mod node;
mod palm;
mod query;
mod record;
mod tree;

pub use api::TreeApi;
pub use error::TreeError;
pub use node::Key;
pub use query::{FindResult, Method, Query};
pub use record::Record;
pub use tree::{BpTree, TreeConfig};
