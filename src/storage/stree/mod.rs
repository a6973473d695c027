#![forbid(unsafe_code)]

//! Balanced S+tree over fixed-size nodes.
//!
//! A change to a leaf is first planned bottom-up by [`fix_nodes`] against
//! immutable [`VirtualNode`]s, then executed bottom-up by [`do_balance`],
//! shifting into neighbours, merging, or splitting into up to three nodes
//! per level and growing or collapsing the root as needed.

/// Plan execution and root maintenance.
pub mod do_balance;
/// Balance planner.
pub mod fix_nodes;
/// Internal-level execution primitives.
pub mod internal;
/// Leaf-level mutation primitives.
pub mod leaf;
/// Fixed-capacity nodes.
pub mod node;
/// Root-to-leaf paths and key search.
pub mod path;
/// Per-level models of pending changes.
pub mod virtual_node;

mod stats;
mod tree;
mod verify;

pub use do_balance::{do_balance, BalanceOutcome, ChildEdit};
pub use fix_nodes::{fix_nodes, BalanceContext, LevelPlan, Neighbor, Strategy, TreeBalance};
pub use internal::ChildRun;
pub use node::{DiskChild, Item, Node, NodeLayout, LEAF_LEVEL};
pub use path::{item_at_or_after, item_before, search_by_key, Path, PathElement, SearchResult};
pub use stats::{BalanceStats, BalanceStatsSnapshot};
pub use tree::{STree, TreeState};
pub use verify::{collect_items, verify, TreeSummary};
pub use virtual_node::{ChildChange, Cut, OpMode, Operation, VirtualItem, VirtualNode};
