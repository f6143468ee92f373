//! Error types shared by both tree engines.

use std::fmt as StdFmt;

/// Errors surfaced through the tree contract.
///
/// Internal invariant violations (a retained lock above a safe node, a
/// final-round modification addressed below the root) are programming
/// errors and panic instead of returning a variant here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    /// The requested key is not present in the tree.
    ///
    /// Non-fatal: callers decide how to proceed.
    NotFound,

    /// The tree configuration is unusable.
    ///
    /// Produced by [`TreeConfig::validate`](crate::TreeConfig::validate)
    /// and by batch entry points handed a zero thread count.
    InvalidConfig(&'static str),
}

impl StdFmt::Display for TreeError {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        match self {
            Self::NotFound => write!(f, "key not found"),

            Self::InvalidConfig(reason) => {
                write!(f, "invalid tree configuration: {reason}")
            }
        }
    }
}

impl std::error::Error for TreeError {}
