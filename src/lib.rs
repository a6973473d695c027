//! S+tree balancing engine.
//!
//! Keeps variable-length items in key order across fixed-size nodes, and
//! rebalances the tree after every insert, paste, cut or delete by shifting
//! into neighbours, merging, or splitting.

#![warn(missing_docs)]

pub mod options;
pub mod primitives;
pub mod storage;
pub mod types;

/// Tree configuration.
pub use options::TreeOptions;

/// Tree facade and the items it stores.
pub use storage::stree::{BalanceOutcome, BalanceStatsSnapshot, Item, Operation, STree, TreeSummary};

/// Keys, identifiers and errors.
pub use types::{BlockId, ItemHead, ItemKind, Key, Result, StreeError};
