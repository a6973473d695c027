//! Plan execution.
//!
//! [`do_balance`] consumes a [`TreeBalance`] bottom-up: the leaf level first,
//! then every internal level the change propagated to, then root
//! maintenance. Each level hands its parent a [`ChildEdit`] and updates the
//! delimiting keys of its common ancestors plus the child sizes recorded in
//! the parents of every node it touched.

use serde::Serialize;

use super::fix_nodes::{LevelPlan, TreeBalance};
use super::internal::{balance_internal, ChildRun};
use super::leaf::balance_leaf;
use super::node::{DiskChild, Node, LEAF_LEVEL};
use crate::primitives::store::BlockArena;
use crate::types::{BlockId, Key, Result, StreeError};

/// Change of a parent's child list produced by the level below.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChildEdit {
    /// New children to place right after child `after`, each with the key in front of it.
    Insert {
        /// Position of the node that was split.
        after: usize,
        /// Separator and pointer of every new node, left to right.
        entries: Vec<(Key, DiskChild)>,
    },
    /// Child `pos` was merged away.
    Remove {
        /// Position of the removed node.
        pos: usize,
    },
}

/// What executing one level changed.
#[derive(Debug, Default)]
pub(super) struct LevelOutcome {
    pub in_place: bool,
    pub removed: bool,
    pub node_size: Option<usize>,
    pub left_size: Option<usize>,
    pub right_size: Option<usize>,
    /// New value of the key delimiting the node from its left neighbour.
    pub left_key: Option<Key>,
    /// New value of the key delimiting the node from its right neighbour.
    pub right_key: Option<Key>,
    /// Key separating the neighbours once the node is gone.
    pub separator: Option<Key>,
    pub new_nodes: Vec<(Key, DiskChild)>,
}

impl LevelOutcome {
    pub(super) fn for_plan(plan: &LevelPlan) -> Self {
        Self {
            removed: plan.removes_node(),
            ..Self::default()
        }
    }

    pub(super) fn in_place(plan: &LevelPlan) -> Self {
        Self {
            in_place: true,
            ..Self::for_plan(plan)
        }
    }
}

/// Working copies of the node of a level and its neighbours.
///
/// The arena keeps the originals until [`LevelParts::attach`] has checked
/// every rewritten node, so a level that fails half way leaves its nodes
/// where they were.
pub(super) struct LevelParts {
    block: BlockId,
    pub node: Node,
    left_block: Option<BlockId>,
    pub left: Option<Node>,
    right_block: Option<BlockId>,
    pub right: Option<Node>,
    /// Current value of the key between the left neighbour and the node.
    pub left_delimiter: Option<Key>,
    /// Current value of the key between the node and the right neighbour.
    pub right_delimiter: Option<Key>,
}

impl LevelParts {
    /// Neighbours are only copied when the plan moves anything.
    pub(super) fn detach(arena: &BlockArena<Node>, plan: &LevelPlan) -> Result<Self> {
        let neighbours = !plan.is_in_place();
        let left_delimiter = plan
            .left
            .map(|n| arena.get(n.common_parent)?.key(n.delimiting_key))
            .transpose()?;
        let right_delimiter = plan
            .right
            .map(|n| arena.get(n.common_parent)?.key(n.delimiting_key))
            .transpose()?;
        let node = arena.get(plan.node)?.clone();
        let left_block = plan.left.filter(|_| neighbours).map(|n| n.block);
        let right_block = plan.right.filter(|_| neighbours).map(|n| n.block);
        let left = left_block.map(|block| arena.get(block).cloned()).transpose()?;
        let right = right_block.map(|block| arena.get(block).cloned()).transpose()?;
        Ok(Self {
            block: plan.node,
            node,
            left_block,
            left,
            right_block,
            right,
            left_delimiter,
            right_delimiter,
        })
    }

    /// Checks every rewritten node, then replaces the originals in one go.
    pub(super) fn attach(
        self,
        arena: &mut BlockArena<Node>,
        mut outcome: LevelOutcome,
    ) -> Result<LevelOutcome> {
        let left = self.left_block.zip(self.left);
        let right = self.right_block.zip(self.right);
        for (_, node) in left.iter().chain(right.iter()) {
            node.check()?;
        }
        if !outcome.removed {
            self.node.check()?;
        }

        if let Some((block, node)) = left {
            outcome.left_size = Some(node.used());
            arena.insert(block, node);
        }
        if let Some((block, node)) = right {
            outcome.right_size = Some(node.used());
            arena.insert(block, node);
        }
        if outcome.removed {
            arena.remove(self.block)?;
        } else {
            outcome.node_size = Some(self.node.used());
            arena.insert(self.block, self.node);
        }
        Ok(outcome)
    }
}

/// Summary of one executed balance.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BalanceOutcome {
    /// Root after the balance.
    pub root: BlockId,
    /// Tree height after the balance.
    pub height: usize,
    /// Whether every level was changed in place.
    pub in_place: bool,
    /// New leaf nodes.
    pub leaf_splits: u64,
    /// New internal nodes.
    pub internal_splits: u64,
    /// Leaf nodes merged away.
    pub leaf_merges: u64,
    /// Internal nodes merged away.
    pub internal_merges: u64,
    /// Levels that shifted into a left neighbour.
    pub left_shifts: u64,
    /// Levels that shifted into a right neighbour.
    pub right_shifts: u64,
    /// Levels that split an item across nodes.
    pub flow_shifts: u64,
    /// Whether a new root was added.
    pub root_grown: bool,
    /// Number of root levels removed.
    pub root_collapses: u64,
    /// Blocks returned to the allocator.
    pub freed: Vec<BlockId>,
}

/// Executes `tb` against `arena`.
///
/// Must run under the exclusive tree lock with the generation the plan was
/// made at. Any error is a corruption: the plan was validated against the
/// same tree and cannot fail on a consistent one.
pub fn do_balance(arena: &mut BlockArena<Node>, mut tb: TreeBalance) -> Result<BalanceOutcome> {
    let height = tb.path.height();
    let root = tb
        .path
        .block_at(height.saturating_sub(1))
        .ok_or(StreeError::Corruption("empty path"))?;
    let mut outcome = BalanceOutcome {
        root,
        height,
        in_place: true,
        ..BalanceOutcome::default()
    };
    let levels = std::mem::take(&mut tb.levels);
    let mut edit: Option<ChildEdit> = None;

    for plan in &levels {
        let level = if plan.level == LEAF_LEVEL {
            balance_leaf(arena, plan, &tb.op, &mut tb.reservation)?
        } else {
            balance_internal(arena, plan, edit.take(), &mut tb.reservation)?
        };
        update_keys(arena, plan, &level)?;
        update_sizes(arena, plan, &level)?;
        record(&mut outcome, plan, &level);
        if level.removed {
            tb.reservation.release(plan.node);
            outcome.freed.push(plan.node);
        }
        tracing::trace!(
            target: "stree::balance",
            level = plan.level,
            node = %plan.node,
            in_place = level.in_place,
            removed = level.removed,
            new_nodes = level.new_nodes.len(),
            "level executed"
        );
        let after = plan.parent.map_or(0, |(_, pos)| pos);
        edit = if level.removed {
            Some(ChildEdit::Remove { pos: after })
        } else if !level.new_nodes.is_empty() {
            Some(ChildEdit::Insert {
                after,
                entries: level.new_nodes,
            })
        } else {
            None
        };
    }

    match edit {
        Some(ChildEdit::Insert { entries, .. }) if tb.grow_root => {
            grow_root(arena, &mut tb, &mut outcome, entries)?;
        }
        Some(_) => return Err(StreeError::Corruption("child edit left above the top level")),
        None => {}
    }
    collapse_root(arena, &tb, &mut outcome)?;
    Ok(outcome)
}

fn update_keys(arena: &mut BlockArena<Node>, plan: &LevelPlan, level: &LevelOutcome) -> Result<()> {
    if let Some(key) = level.left_key {
        let left = plan
            .left
            .ok_or(StreeError::Corruption("left key without left neighbour"))?;
        arena
            .get_mut(left.common_parent)?
            .replace_key(left.delimiting_key, key)?;
    }
    if let Some(key) = level.right_key {
        let right = plan
            .right
            .ok_or(StreeError::Corruption("right key without right neighbour"))?;
        arena
            .get_mut(right.common_parent)?
            .replace_key(right.delimiting_key, key)?;
    }
    if let (true, Some(separator)) = (level.removed, level.separator) {
        // The parent drops the key in front of the removed child, or the one
        // after it for the first child; the other delimiter survives.
        let pos = plan
            .parent
            .map(|(_, pos)| pos)
            .ok_or(StreeError::Corruption("removed node without parent"))?;
        let survivor = if pos == 0 { plan.left } else { plan.right };
        if let Some(neighbor) = survivor {
            arena
                .get_mut(neighbor.common_parent)?
                .replace_key(neighbor.delimiting_key, separator)?;
        }
    }
    Ok(())
}

fn update_sizes(arena: &mut BlockArena<Node>, plan: &LevelPlan, level: &LevelOutcome) -> Result<()> {
    if let (Some((parent, pos)), Some(size)) = (plan.parent, level.node_size) {
        arena.get_mut(parent)?.set_child_size(pos, size)?;
    }
    if let (Some(left), Some(size)) = (plan.left, level.left_size) {
        arena.get_mut(left.parent)?.set_child_size(left.position, size)?;
    }
    if let (Some(right), Some(size)) = (plan.right, level.right_size) {
        arena
            .get_mut(right.parent)?
            .set_child_size(right.position, size)?;
    }
    Ok(())
}

fn record(outcome: &mut BalanceOutcome, plan: &LevelPlan, level: &LevelOutcome) {
    let leaf = plan.level == LEAF_LEVEL;
    outcome.in_place &= level.in_place;
    let splits = level.new_nodes.len() as u64;
    if leaf {
        outcome.leaf_splits += splits;
    } else {
        outcome.internal_splits += splits;
    }
    if level.removed {
        if leaf {
            outcome.leaf_merges += 1;
        } else {
            outcome.internal_merges += 1;
        }
    }
    if plan.lnum > 0 {
        outcome.left_shifts += 1;
    }
    if plan.rnum > 0 {
        outcome.right_shifts += 1;
    }
    if plan.flow {
        outcome.flow_shifts += 1;
    }
}

fn grow_root(
    arena: &mut BlockArena<Node>,
    tb: &mut TreeBalance,
    outcome: &mut BalanceOutcome,
    entries: Vec<(Key, DiskChild)>,
) -> Result<()> {
    let old_root = arena.get(outcome.root)?;
    let layout = old_root.layout();
    let first = DiskChild {
        block: outcome.root,
        size: old_root.used(),
    };
    let block = tb.reservation.take()?;
    let mut root = Node::new_internal(outcome.height, layout);
    root.append_children(
        Key::MIN,
        ChildRun {
            keys: Vec::new(),
            children: vec![first],
        },
    )?;
    root.insert_children(0, entries)?;
    root.check()?;
    arena.insert(block, root);
    tracing::debug!(
        target: "stree::balance",
        old_root = %outcome.root,
        new_root = %block,
        height = outcome.height + 1,
        "tree grew a level"
    );
    outcome.root = block;
    outcome.height += 1;
    outcome.root_grown = true;
    Ok(())
}

fn collapse_root(
    arena: &mut BlockArena<Node>,
    tb: &TreeBalance,
    outcome: &mut BalanceOutcome,
) -> Result<()> {
    loop {
        let root = arena.get(outcome.root)?;
        if root.is_leaf() || root.child_count() > 1 {
            return Ok(());
        }
        let child = root
            .child(0)
            .map_err(|_| StreeError::Corruption("internal root without children"))?;
        arena.remove(outcome.root)?;
        tb.reservation.release(outcome.root);
        outcome.freed.push(outcome.root);
        tracing::debug!(
            target: "stree::balance",
            old_root = %outcome.root,
            new_root = %child.block,
            height = outcome.height - 1,
            "tree lost a level"
        );
        outcome.root = child.block;
        outcome.height -= 1;
        outcome.root_collapses += 1;
    }
}
