//! Balance planner.
//!
//! [`fix_nodes`] walks the path bottom-up and decides, level by level, how
//! the pending change is absorbed: in place, by shifting into the left
//! and/or right neighbour, by merging the node away, or by splitting it into
//! two or three nodes. Nothing is modified; the result is a [`TreeBalance`]
//! that [`super::do_balance::do_balance`] executes under the exclusive lock.

use std::sync::Arc;

use super::leaf::{check_cut, check_paste};
use super::node::Node;
use super::path::Path;
use super::virtual_node::{ChildChange, Cut, OpMode, Operation, VirtualNode};
use crate::options::TreeOptions;
use crate::primitives::store::{Allocator, BlockArena, Reservation};
use crate::types::{BlockId, Result, StreeError};

/// Inputs the planner needs besides the tree itself.
#[derive(Clone)]
pub struct BalanceContext<'a> {
    /// Tree configuration.
    pub options: &'a TreeOptions,
    /// Source of blocks for new nodes.
    pub allocator: Arc<dyn Allocator>,
    /// Generation the caller observed when it took the shared lock.
    pub generation: u64,
}

/// Left or right neighbour of a node on the same level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Neighbor {
    /// Neighbour node (L or R).
    pub block: BlockId,
    /// Parent of the neighbour (FL or FR).
    pub parent: BlockId,
    /// Neighbour's position inside its parent.
    pub position: usize,
    /// Lowest common ancestor with the node (CFL or CFR).
    pub common_parent: BlockId,
    /// Index of the key in the common ancestor that separates the two subtrees.
    pub delimiting_key: usize,
    /// Free bytes in the neighbour as recorded by its parent.
    pub free_space: usize,
    /// Whether the neighbour was touched recently.
    pub resident: bool,
}

/// Which neighbours take part in a level's plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Only the node itself (and new nodes) change.
    ShiftNone,
    /// Leading items move into the left neighbour.
    ShiftLeft,
    /// Trailing items move into the right neighbour.
    ShiftRight,
    /// Items move into both neighbours.
    ShiftBoth,
}

/// Plan for one level.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LevelPlan {
    /// Level number; 0 is the leaf level.
    pub level: usize,
    /// Node on the path at this level (S).
    pub node: BlockId,
    /// Path position at this level (item index or child index).
    pub position: usize,
    /// Parent of the node and the node's position in it; `None` for the root.
    pub parent: Option<(BlockId, usize)>,
    /// Left neighbour, if any.
    pub left: Option<Neighbor>,
    /// Right neighbour, if any.
    pub right: Option<Neighbor>,
    /// Whether the level grows or shrinks.
    pub mode: OpMode,
    /// Child list change handed up from the level below.
    pub child_change: Option<ChildChange>,
    /// Chosen neighbour participation.
    pub strategy: Strategy,
    /// Whether an item is split across a node boundary.
    pub flow: bool,
    /// Number of items (or children) after the change.
    pub item_count: usize,
    /// The left neighbour receives everything before this cut.
    pub left_cut: Cut,
    /// The right neighbour receives everything from this cut on.
    pub right_cut: Cut,
    /// Boundaries between the node and its new siblings, left to right.
    pub splits: Vec<Cut>,
    /// Items moving to the left neighbour, counting a partial one.
    pub lnum: usize,
    /// Units of the last left-moving item when it moves partially.
    pub lbytes: Option<usize>,
    /// Items moving to the right neighbour, counting a partial one.
    pub rnum: usize,
    /// Units of the first right-moving item when it moves partially.
    pub rbytes: Option<usize>,
    /// Nodes holding this level's content afterwards, counting the node itself.
    pub blknum: usize,
    /// Bytes the change adds to this level (negative when shrinking).
    pub insert_size: isize,
}

impl LevelPlan {
    /// Whether the change is applied inside the node without touching anything else.
    pub fn is_in_place(&self) -> bool {
        self.lnum == 0 && self.rnum == 0 && self.blknum == 1
    }

    /// Whether the node disappears.
    pub fn removes_node(&self) -> bool {
        self.blknum == 0
    }
}

/// Complete plan for one operation.
///
/// Blocks reserved for new nodes are held by the plan and returned to the
/// allocator when it is dropped without being executed.
pub struct TreeBalance {
    pub(super) path: Path,
    pub(super) op: Operation,
    pub(super) levels: Vec<LevelPlan>,
    pub(super) grow_root: bool,
    pub(super) reservation: Reservation,
}

impl TreeBalance {
    /// Path the plan was derived from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Leaf-level operation.
    pub fn operation(&self) -> &Operation {
        &self.op
    }

    /// Per-level plans, leaf level first.
    pub fn levels(&self) -> &[LevelPlan] {
        &self.levels
    }

    /// Plan of `level`, if the change reaches it.
    pub fn level(&self, level: usize) -> Option<&LevelPlan> {
        self.levels.get(level)
    }

    /// Whether a new root is added on top.
    pub fn grows_root(&self) -> bool {
        self.grow_root
    }

    /// Blocks currently reserved.
    pub fn reserved(&self) -> usize {
        self.reservation.len()
    }

    /// Generation the plan is valid for.
    pub fn generation(&self) -> u64 {
        self.path.generation()
    }
}

#[derive(Clone, Debug)]
struct Distribution {
    strategy: Strategy,
    flow: bool,
    left_cut: Cut,
    right_cut: Cut,
    splits: Vec<Cut>,
    blknum: usize,
}

impl Distribution {
    fn in_place(vn: &VirtualNode) -> Self {
        Self {
            strategy: Strategy::ShiftNone,
            flow: false,
            left_cut: Cut::START,
            right_cut: vn.end(),
            splits: Vec::new(),
            blknum: 1,
        }
    }

    fn merge(strategy: Strategy, cut: Cut) -> Self {
        Self {
            strategy,
            flow: false,
            left_cut: cut,
            right_cut: cut,
            splits: Vec::new(),
            blknum: 0,
        }
    }
}

/// Plans the change `op` at the leaf addressed by `path`.
///
/// Fails with [`StreeError::RepeatSearch`] when the path no longer matches
/// the tree, [`StreeError::NoDiskSpace`] when new nodes cannot be reserved
/// and [`StreeError::Invalid`] when the operation can never fit a node.
pub fn fix_nodes(
    arena: &BlockArena<Node>,
    path: &Path,
    op: Operation,
    ctx: &BalanceContext<'_>,
) -> Result<TreeBalance> {
    path.validate(arena, ctx.generation)?;
    check_operation(arena, path, &op, ctx.options)?;
    let height = path.height();
    let mut reservation = Reservation::new(Arc::clone(&ctx.allocator));
    let mut levels: Vec<LevelPlan> = Vec::with_capacity(height);
    let mut grow_root = false;
    let mut change: Option<ChildChange> = None;

    for level in 0..height {
        if level > 0 && change.is_none() {
            break;
        }
        let block = path
            .block_at(level)
            .ok_or(StreeError::Corruption("path shorter than tree"))?;
        let position = path
            .position_at(level)
            .ok_or(StreeError::Corruption("path shorter than tree"))?;
        let node = arena.get(block)?;
        if node.level() != level {
            return Err(StreeError::RepeatSearch);
        }
        let is_root = level + 1 == height;
        let (left, right) = if is_root {
            (None, None)
        } else {
            (
                left_neighbor(arena, path, level, ctx.options)?,
                right_neighbor(arena, path, level, ctx.options)?,
            )
        };
        let vn = match change {
            None => {
                let left_node = left.map(|n| arena.get(n.block)).transpose()?;
                let right_node = right.map(|n| arena.get(n.block)).transpose()?;
                VirtualNode::leaf(node, position, &op, ctx.options, left_node, right_node)?
            }
            Some(child_change) => VirtualNode::internal(node, position, child_change)?,
        };
        let insert_size = match change {
            None => leaf_insert_size(node, position, &op, ctx.options)?,
            Some(ChildChange::Insert(count)) => (count * ctx.options.internal_entry_len()) as isize,
            Some(ChildChange::Remove) => -(ctx.options.internal_entry_len() as isize),
        };
        let dist = plan_distribution(&vn, left.as_ref(), right.as_ref(), is_root)?;
        if dist.blknum > 1 {
            reservation.reserve(dist.blknum - 1)?;
        }
        if is_root && dist.blknum > 1 {
            reservation.reserve(1)?;
            grow_root = true;
        }
        let plan = level_plan(LevelInputs {
            vn: &vn,
            level,
            block,
            position,
            parent: path.parent_of(level),
            left,
            right,
            child_change: change,
            insert_size,
            dist,
        });
        tracing::trace!(
            target: "stree::fix_nodes",
            level,
            node = %block,
            strategy = ?plan.strategy,
            flow = plan.flow,
            lnum = plan.lnum,
            rnum = plan.rnum,
            blknum = plan.blknum,
            insert_size = plan.insert_size,
            "level planned"
        );
        change = ChildChange::from_blknum(plan.blknum);
        levels.push(plan);
    }

    Ok(TreeBalance {
        path: path.clone(),
        op,
        levels,
        grow_root,
        reservation,
    })
}

fn check_operation(
    arena: &BlockArena<Node>,
    path: &Path,
    op: &Operation,
    opts: &TreeOptions,
) -> Result<()> {
    let leaf = arena.get(path.leaf()?)?;
    let pos = path.leaf_position()?;
    match op {
        Operation::Insert(item) => {
            if item.len() > opts.max_item_len() {
                return Err(StreeError::Invalid("item larger than a node"));
            }
        }
        Operation::Paste { offset, bytes } => {
            let item = leaf.item(pos).map_err(|_| StreeError::NotFound)?;
            check_paste(item, *offset, bytes.len())?;
            if item.len() + bytes.len() > opts.max_item_len() {
                return Err(StreeError::Invalid("item larger than a node"));
            }
        }
        Operation::Cut { offset, len } => {
            let item = leaf.item(pos).map_err(|_| StreeError::NotFound)?;
            check_cut(item, *offset, *len)?;
        }
        Operation::Delete => {
            leaf.item(pos).map_err(|_| StreeError::NotFound)?;
        }
    }
    Ok(())
}

fn leaf_insert_size(node: &Node, pos: usize, op: &Operation, opts: &TreeOptions) -> Result<isize> {
    let size = match op {
        Operation::Insert(item) => (opts.item_head_size + item.len()) as isize,
        Operation::Paste { bytes, .. } => bytes.len() as isize,
        Operation::Cut { len, .. } => -(*len as isize),
        Operation::Delete => -((opts.item_head_size + node.item_len(pos)?) as isize),
    };
    Ok(size)
}

/// Finds the left neighbour of the path node at `level`.
///
/// Walks up to the nearest ancestor where the path does not take the
/// leftmost child, then descends along the rightmost spine of the subtree
/// to the left.
pub fn left_neighbor(
    arena: &BlockArena<Node>,
    path: &Path,
    level: usize,
    opts: &TreeOptions,
) -> Result<Option<Neighbor>> {
    for upper in level + 1..path.height() {
        let pos = path
            .position_at(upper)
            .ok_or(StreeError::Corruption("path shorter than tree"))?;
        if pos == 0 {
            continue;
        }
        let common = path
            .block_at(upper)
            .ok_or(StreeError::Corruption("path shorter than tree"))?;
        let mut parent = common;
        let mut child_pos = pos - 1;
        for _ in level + 1..upper {
            parent = arena.get(parent)?.child(child_pos)?.block;
            child_pos = arena
                .get(parent)?
                .child_count()
                .checked_sub(1)
                .ok_or(StreeError::Corruption("internal node without children"))?;
        }
        return neighbor_at(arena, parent, child_pos, common, pos - 1, level, opts).map(Some);
    }
    Ok(None)
}

/// Finds the right neighbour of the path node at `level`.
pub fn right_neighbor(
    arena: &BlockArena<Node>,
    path: &Path,
    level: usize,
    opts: &TreeOptions,
) -> Result<Option<Neighbor>> {
    for upper in level + 1..path.height() {
        let pos = path
            .position_at(upper)
            .ok_or(StreeError::Corruption("path shorter than tree"))?;
        let common = path
            .block_at(upper)
            .ok_or(StreeError::Corruption("path shorter than tree"))?;
        if pos + 1 >= arena.get(common)?.child_count() {
            continue;
        }
        let mut parent = common;
        let mut child_pos = pos + 1;
        for _ in level + 1..upper {
            parent = arena.get(parent)?.child(child_pos)?.block;
            child_pos = 0;
        }
        return neighbor_at(arena, parent, child_pos, common, pos, level, opts).map(Some);
    }
    Ok(None)
}

fn neighbor_at(
    arena: &BlockArena<Node>,
    parent: BlockId,
    position: usize,
    common_parent: BlockId,
    delimiting_key: usize,
    level: usize,
    opts: &TreeOptions,
) -> Result<Neighbor> {
    let child = arena.get(parent)?.child(position)?;
    let resident = arena.is_resident(child.block);
    if arena.get(child.block)?.level() != level {
        return Err(StreeError::Corruption("neighbour on the wrong level"));
    }
    Ok(Neighbor {
        block: child.block,
        parent,
        position,
        common_parent,
        delimiting_key,
        free_space: opts.capacity().saturating_sub(child.size),
        resident,
    })
}

fn plan_distribution(
    vn: &VirtualNode,
    left: Option<&Neighbor>,
    right: Option<&Neighbor>,
    is_root: bool,
) -> Result<Distribution> {
    if vn.mode().is_growing() {
        if vn.total_cost() <= vn.node_capacity() {
            return Ok(Distribution::in_place(vn));
        }
        let flows: &[bool] = if vn.has_flow() { &[false, true] } else { &[false] };
        let mut best: Option<((usize, usize, bool), Distribution)> = None;
        for &flow in flows {
            for strategy in [
                Strategy::ShiftNone,
                Strategy::ShiftLeft,
                Strategy::ShiftRight,
                Strategy::ShiftBoth,
            ] {
                let Some(dist) = growth_candidate(vn, strategy, flow, left, right) else {
                    continue;
                };
                let rank = (dist.blknum, strategy_rank(strategy, left, right), flow);
                if best.as_ref().map_or(true, |(current, _)| rank < *current) {
                    best = Some((rank, dist));
                }
            }
        }
        return best
            .map(|(_, dist)| dist)
            .ok_or(StreeError::Corruption("change does not fit into three nodes"));
    }

    if is_root {
        return Ok(Distribution::in_place(vn));
    }
    if vn.is_empty() {
        return Ok(Distribution::merge(Strategy::ShiftNone, Cut::START));
    }
    let mut order = [Strategy::ShiftLeft, Strategy::ShiftRight, Strategy::ShiftBoth];
    if strategy_rank(Strategy::ShiftRight, left, right) < strategy_rank(Strategy::ShiftLeft, left, right) {
        order.swap(0, 1);
    }
    for strategy in order {
        if let Some(dist) = merge_candidate(vn, strategy, left, right) {
            return Ok(dist);
        }
    }
    Ok(Distribution::in_place(vn))
}

/// Tie-break order: no shift, the resident sibling (left first), both.
fn strategy_rank(strategy: Strategy, left: Option<&Neighbor>, right: Option<&Neighbor>) -> usize {
    let left_first = left.is_some_and(|n| n.resident) || !right.is_some_and(|n| n.resident);
    match strategy {
        Strategy::ShiftNone => 0,
        Strategy::ShiftLeft if left_first => 1,
        Strategy::ShiftLeft => 2,
        Strategy::ShiftRight if left_first => 2,
        Strategy::ShiftRight => 1,
        Strategy::ShiftBoth => 3,
    }
}

fn growth_candidate(
    vn: &VirtualNode,
    strategy: Strategy,
    flow: bool,
    left: Option<&Neighbor>,
    right: Option<&Neighbor>,
) -> Option<Distribution> {
    let n = vn.len();
    if n == 0 {
        return None;
    }
    let end = vn.end();
    // The node keeps at least one item while growing.
    let left_limit = Cut::at(n - 1);
    let right_limit = Cut::at(1);
    let (left_cut, right_cut) = match strategy {
        Strategy::ShiftNone => (Cut::START, end),
        Strategy::ShiftLeft => {
            let l = left?;
            let cut = vn.fill_forward(Cut::START, left_limit, l.free_space, vn.left_mergeable(), flow);
            if cut == Cut::START {
                return None;
            }
            (cut, end)
        }
        Strategy::ShiftRight => {
            let r = right?;
            let cut = vn.fill_backward(end, right_limit, r.free_space, vn.right_mergeable(), flow);
            if cut == end {
                return None;
            }
            (Cut::START, cut)
        }
        Strategy::ShiftBoth => {
            let l = left?;
            let r = right?;
            let lcut = vn.fill_forward(Cut::START, left_limit, l.free_space, vn.left_mergeable(), flow);
            if lcut == Cut::START {
                return None;
            }
            let mut rcut = vn.fill_backward(end, lcut, r.free_space, vn.right_mergeable(), flow);
            if rcut == end {
                return None;
            }
            if rcut <= lcut {
                rcut = Cut::at(lcut.item + 1);
                if rcut >= end {
                    return None;
                }
            }
            (lcut, rcut)
        }
    };
    let blknum = vn.count_nodes(left_cut, right_cut, flow)?;
    if blknum == 0 || blknum > 3 {
        return None;
    }
    let splits = vn.balanced_cuts(left_cut, right_cut, blknum, flow);
    Some(Distribution {
        strategy,
        flow,
        left_cut,
        right_cut,
        blknum: splits.len() + 1,
        splits,
    })
}

fn merge_candidate(
    vn: &VirtualNode,
    strategy: Strategy,
    left: Option<&Neighbor>,
    right: Option<&Neighbor>,
) -> Option<Distribution> {
    let end = vn.end();
    match strategy {
        Strategy::ShiftLeft => {
            let l = left?;
            let cut = vn.fill_forward(Cut::START, end, l.free_space, vn.left_mergeable(), false);
            (cut == end).then(|| Distribution::merge(strategy, end))
        }
        Strategy::ShiftRight => {
            let r = right?;
            let cut = vn.fill_backward(end, Cut::START, r.free_space, vn.right_mergeable(), false);
            (cut == Cut::START).then(|| Distribution::merge(strategy, Cut::START))
        }
        Strategy::ShiftBoth => {
            let l = left?;
            let r = right?;
            let lcut = vn.fill_forward(Cut::START, end, l.free_space, vn.left_mergeable(), false);
            let rcut = vn.fill_backward(end, lcut, r.free_space, vn.right_mergeable(), false);
            (rcut == lcut).then(|| Distribution::merge(strategy, lcut))
        }
        Strategy::ShiftNone => None,
    }
}

struct LevelInputs<'a> {
    vn: &'a VirtualNode,
    level: usize,
    block: BlockId,
    position: usize,
    parent: Option<(BlockId, usize)>,
    left: Option<Neighbor>,
    right: Option<Neighbor>,
    child_change: Option<ChildChange>,
    insert_size: isize,
    dist: Distribution,
}

fn level_plan(inputs: LevelInputs<'_>) -> LevelPlan {
    let LevelInputs {
        vn,
        level,
        block,
        position,
        parent,
        left,
        right,
        child_change,
        insert_size,
        dist,
    } = inputs;
    let n = vn.len();
    let lnum = dist.left_cut.item + usize::from(dist.left_cut.unit > 0);
    let lbytes = (dist.left_cut.unit > 0).then_some(dist.left_cut.unit);
    let rnum = n - dist.right_cut.item;
    let rbytes = (dist.right_cut.unit > 0)
        .then(|| vn.items()[dist.right_cut.item].units - dist.right_cut.unit);
    let flow = lbytes.is_some()
        || rbytes.is_some()
        || dist.splits.iter().any(|cut| cut.unit > 0);
    LevelPlan {
        level,
        node: block,
        position,
        parent,
        left,
        right,
        mode: vn.mode(),
        child_change,
        strategy: dist.strategy,
        flow: dist.flow && flow,
        item_count: n,
        left_cut: dist.left_cut,
        right_cut: dist.right_cut,
        splits: dist.splits,
        lnum,
        lbytes,
        rnum,
        rbytes,
        blknum: dist.blknum,
        insert_size,
    }
}
