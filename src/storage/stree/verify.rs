//! Whole-tree invariant checks.

use serde::Serialize;

use super::node::{Item, Node};
use crate::primitives::store::BlockArena;
use crate::types::{BlockId, Key, Result, StreeError};

/// Shape of a verified tree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TreeSummary {
    /// Number of levels.
    pub height: usize,
    /// Reachable nodes.
    pub nodes: usize,
    /// Reachable leaves.
    pub leaves: usize,
    /// Items stored in leaves.
    pub items: usize,
    /// Bytes used across all nodes.
    pub used_bytes: usize,
}

/// Checks every structural invariant of the tree rooted at `root`.
///
/// Verifies per-node capacity and counters, that all leaves sit at level 0
/// with the root at `height - 1`, that every recorded child size matches the
/// child, that keys respect the pivots of every ancestor, that only the root
/// may be empty, that no node outside the tree is left in the arena, and
/// that no item starts inside the unit range of the item before it or
/// reaches past the pivot above its leaf.
pub fn verify(arena: &BlockArena<Node>, root: BlockId, height: usize) -> Result<TreeSummary> {
    let root_node = arena.get(root)?;
    if root_node.level() + 1 != height {
        return Err(StreeError::Corruption("root level does not match height"));
    }
    if !root_node.is_leaf() && root_node.child_count() < 2 {
        return Err(StreeError::Corruption("internal root with fewer than two children"));
    }
    let mut summary = TreeSummary {
        height,
        ..TreeSummary::default()
    };
    let mut stack = vec![(root, None::<Key>, None::<Key>)];
    while let Some((block, lower, upper)) = stack.pop() {
        let node = arena.get(block)?;
        node.check()?;
        summary.nodes += 1;
        summary.used_bytes += node.used();
        let in_range = |key: &Key| {
            lower.map_or(true, |low| *key >= low) && upper.map_or(true, |high| *key < high)
        };
        if node.is_leaf() {
            if node.level() != 0 {
                return Err(StreeError::Corruption("leaf above level zero"));
            }
            if block != root && node.item_count() == 0 {
                return Err(StreeError::Corruption("empty non-root leaf"));
            }
            if !node.items().iter().all(|item| in_range(&item.key())) {
                return Err(StreeError::Corruption("leaf key outside its pivot range"));
            }
            let crosses = |item: &Item| upper.is_some_and(|high| item.head.end_key() > high);
            if node.items().iter().any(crosses) {
                return Err(StreeError::Corruption("item range crosses a pivot"));
            }
            summary.leaves += 1;
            summary.items += node.item_count();
            continue;
        }
        if node.child_count() == 0 {
            return Err(StreeError::Corruption("internal node without children"));
        }
        if !node.keys().iter().all(in_range) {
            return Err(StreeError::Corruption("pivot outside its parent's range"));
        }
        for (i, child) in node.children().iter().enumerate() {
            let child_node = arena.get(child.block)?;
            if child_node.level() + 1 != node.level() {
                return Err(StreeError::Corruption("child on the wrong level"));
            }
            if child_node.used() != child.size {
                return Err(StreeError::Corruption("recorded child size out of date"));
            }
            let child_lower = if i == 0 { lower } else { Some(node.key(i - 1)?) };
            let child_upper = node.keys().get(i).copied().or(upper);
            stack.push((child.block, child_lower, child_upper));
        }
    }
    if summary.nodes != arena.len() {
        return Err(StreeError::Corruption("arena holds nodes unreachable from the root"));
    }
    let mut previous: Option<&Item> = None;
    for leaf in leaves_in_order(arena, root)? {
        for item in leaf.items() {
            if previous.is_some_and(|prev| !prev.head.precedes(&item.key())) {
                return Err(StreeError::Corruption("overlapping item ranges"));
            }
            previous = Some(item);
        }
    }
    Ok(summary)
}

fn leaves_in_order(arena: &BlockArena<Node>, root: BlockId) -> Result<Vec<&Node>> {
    let mut leaves = Vec::new();
    let mut stack = vec![root];
    while let Some(block) = stack.pop() {
        let node = arena.get(block)?;
        if node.is_leaf() {
            leaves.push(node);
        } else {
            stack.extend(node.children().iter().rev().map(|child| child.block));
        }
    }
    Ok(leaves)
}

/// Items in key order, collected by walking the leaves left to right.
pub fn collect_items(arena: &BlockArena<Node>, root: BlockId) -> Result<Vec<Item>> {
    Ok(leaves_in_order(arena, root)?
        .into_iter()
        .flat_map(|leaf| leaf.items().iter().cloned())
        .collect())
}
