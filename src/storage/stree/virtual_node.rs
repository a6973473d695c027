//! Immutable per-level model of a node after its pending change.
//!
//! The planner never edits storage while it decides; instead it builds a
//! [`VirtualNode`] describing the items (leaf level) or child entries
//! (internal levels) the node would hold once the change is applied, and
//! measures candidate distributions over it. Positions inside a virtual node
//! are [`Cut`]s: an item index plus a unit offset into that item.

use super::node::{Item, Node};
use crate::options::TreeOptions;
use crate::types::{ItemHead, Result, StreeError};

/// Change requested at the leaf level, addressed by the path's leaf position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Insert a whole new item before the leaf position.
    Insert(Item),
    /// Insert bytes into the body of the item at the leaf position.
    Paste {
        /// Byte offset inside the body; aligned to the item's unit.
        offset: usize,
        /// Bytes to insert.
        bytes: Vec<u8>,
    },
    /// Remove bytes from the body of the item at the leaf position.
    Cut {
        /// Byte offset inside the body; aligned to the item's unit.
        offset: usize,
        /// Number of bytes to remove.
        len: usize,
    },
    /// Remove the item at the leaf position.
    Delete,
}

/// Whether a level grows or shrinks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpMode {
    /// New item.
    Insert,
    /// Item body grows.
    Paste,
    /// Item body shrinks.
    Cut,
    /// Item removed.
    Delete,
}

impl OpMode {
    /// Whether the level may overflow.
    pub fn is_growing(self) -> bool {
        matches!(self, OpMode::Insert | OpMode::Paste)
    }
}

impl Operation {
    /// Mode of the operation.
    pub fn mode(&self) -> OpMode {
        match self {
            Operation::Insert(_) => OpMode::Insert,
            Operation::Paste { .. } => OpMode::Paste,
            Operation::Cut { .. } => OpMode::Cut,
            Operation::Delete => OpMode::Delete,
        }
    }
}

/// Change of the child list of an internal node caused by the level below.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildChange {
    /// `count` new children right after the path position.
    Insert(usize),
    /// The child at the path position disappears.
    Remove,
}

impl ChildChange {
    /// Child change implied by the node count of the level below.
    pub fn from_blknum(blknum: usize) -> Option<Self> {
        match blknum {
            0 => Some(ChildChange::Remove),
            1 => None,
            n => Some(ChildChange::Insert(n - 1)),
        }
    }

    /// Mode the internal level runs in.
    pub fn mode(self) -> OpMode {
        match self {
            ChildChange::Insert(_) => OpMode::Insert,
            ChildChange::Remove => OpMode::Delete,
        }
    }
}

/// Position inside a virtual node: before unit `unit` of item `item`.
///
/// `unit` is always smaller than the item's unit count; the end of the node
/// is `Cut { item: n, unit: 0 }`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Cut {
    /// Item (or child entry) index.
    pub item: usize,
    /// Units of `item` on the left side of the cut.
    pub unit: usize,
}

impl Cut {
    /// Start of a node.
    pub const START: Cut = Cut { item: 0, unit: 0 };

    /// Cut before `item`.
    pub const fn at(item: usize) -> Self {
        Cut { item, unit: 0 }
    }
}

/// One item (or child entry) of a virtual node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VirtualItem {
    /// Fixed cost of the item inside a node (item header, or key + pointer).
    pub head: usize,
    /// Body length after the pending change.
    pub len: usize,
    /// Bytes per unit; equal to `len` for indivisible items.
    pub unit_len: usize,
    /// Number of units; 1 for indivisible items.
    pub units: usize,
    /// Whether the item may be split at unit granularity.
    pub flow: bool,
}

/// Immutable model of one level's node after its pending change.
#[derive(Clone, Debug)]
pub struct VirtualNode {
    level: usize,
    mode: OpMode,
    items: Vec<VirtualItem>,
    affected: Option<usize>,
    left_mergeable: bool,
    right_mergeable: bool,
    node_capacity: usize,
}

impl VirtualNode {
    /// Builds the leaf-level virtual node for `op` at item position `pos`.
    pub fn leaf(
        node: &Node,
        pos: usize,
        op: &Operation,
        opts: &TreeOptions,
        left: Option<&Node>,
        right: Option<&Node>,
    ) -> Result<Self> {
        if !node.is_leaf() {
            return Err(StreeError::Corruption("leaf virtual node over internal node"));
        }
        let mut heads: Vec<ItemHead> = node.items().iter().map(|item| item.head).collect();
        let affected = match op {
            Operation::Insert(item) => {
                if pos > heads.len() {
                    return Err(StreeError::Corruption("insert position beyond leaf"));
                }
                heads.insert(pos, item.head);
                Some(pos)
            }
            Operation::Paste { bytes, .. } => {
                let head = heads
                    .get_mut(pos)
                    .ok_or(StreeError::Corruption("paste position beyond leaf"))?;
                head.len += bytes.len();
                Some(pos)
            }
            Operation::Cut { len, .. } => {
                let head = heads
                    .get_mut(pos)
                    .ok_or(StreeError::Corruption("cut position beyond leaf"))?;
                head.len = head
                    .len
                    .checked_sub(*len)
                    .ok_or(StreeError::Invalid("cut longer than item body"))?;
                Some(pos)
            }
            Operation::Delete => {
                if pos >= heads.len() {
                    return Err(StreeError::Corruption("delete position beyond leaf"));
                }
                heads.remove(pos);
                None
            }
        };
        let left_mergeable = match (left.and_then(Node::last_head), heads.first()) {
            (Some(l), Some(first)) => l.merges_with(first),
            _ => false,
        };
        let right_mergeable = match (heads.last(), right.and_then(Node::first_head)) {
            (Some(last), Some(r)) => last.merges_with(&r),
            _ => false,
        };
        let items = heads
            .iter()
            .map(|head| leaf_item(head, opts))
            .collect();
        Ok(Self {
            level: node.level(),
            mode: op.mode(),
            items,
            affected,
            left_mergeable,
            right_mergeable,
            node_capacity: node.layout().capacity,
        })
    }

    /// Builds the virtual node of internal `node` after `change` at child `pos`.
    pub fn internal(node: &Node, pos: usize, change: ChildChange) -> Result<Self> {
        if node.is_leaf() {
            return Err(StreeError::Corruption("internal virtual node over leaf"));
        }
        let before = node.child_count();
        if pos >= before {
            return Err(StreeError::Corruption("child position beyond node"));
        }
        let after = match change {
            ChildChange::Insert(count) => before + count,
            ChildChange::Remove => before - 1,
        };
        let layout = node.layout();
        let entry = VirtualItem {
            head: layout.entry_cost(),
            len: 0,
            unit_len: 0,
            units: 1,
            flow: false,
        };
        Ok(Self {
            level: node.level(),
            mode: change.mode(),
            items: vec![entry; after],
            affected: match change {
                ChildChange::Insert(_) => Some(pos + 1),
                ChildChange::Remove => None,
            },
            left_mergeable: false,
            right_mergeable: false,
            // The first child of a node carries no pivot key.
            node_capacity: layout.capacity + layout.key,
        })
    }

    /// Level of the modelled node.
    pub fn level(&self) -> usize {
        self.level
    }

    /// Mode the level runs in.
    pub fn mode(&self) -> OpMode {
        self.mode
    }

    /// Items after the pending change.
    pub fn items(&self) -> &[VirtualItem] {
        &self.items
    }

    /// Number of items after the pending change.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the node would be empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Index of the inserted or resized item.
    pub fn affected(&self) -> Option<usize> {
        self.affected
    }

    /// Whether item 0 continues the left neighbour's last item.
    pub fn left_mergeable(&self) -> bool {
        self.left_mergeable
    }

    /// Whether the last item is continued by the right neighbour's first item.
    pub fn right_mergeable(&self) -> bool {
        self.right_mergeable
    }

    /// Budget of a freshly allocated (or emptied) node in item cost terms.
    pub fn node_capacity(&self) -> usize {
        self.node_capacity
    }

    /// End of the node.
    pub fn end(&self) -> Cut {
        Cut::at(self.items.len())
    }

    /// Whether any item could be split at unit granularity.
    pub fn has_flow(&self) -> bool {
        self.items.iter().any(|item| item.flow)
    }

    fn piece_cost(&self, item: usize, from: usize, to: usize, head: usize) -> usize {
        let vi = &self.items[item];
        if from == 0 && to == vi.units {
            head + vi.len
        } else {
            head + (to - from) * vi.unit_len
        }
    }

    fn advance(&self, item: usize, to: usize) -> Cut {
        if to >= self.items[item].units {
            Cut::at(item + 1)
        } else {
            Cut { item, unit: to }
        }
    }

    /// Cost of everything in `[from, to)` placed in one node without merging.
    pub fn span_cost(&self, from: Cut, to: Cut) -> usize {
        let mut cost = 0;
        let mut pos = from;
        while pos < to {
            let end = if pos.item == to.item {
                to.unit
            } else {
                self.items[pos.item].units
            };
            cost += self.piece_cost(pos.item, pos.unit, end, self.items[pos.item].head);
            pos = self.advance(pos.item, end);
        }
        cost
    }

    /// Cost of the whole node.
    pub fn total_cost(&self) -> usize {
        self.span_cost(Cut::START, self.end())
    }

    /// Packs greedily forward from `start` into `budget` bytes, stopping at `limit`.
    ///
    /// With `merge_first`, item 0 glues onto the receiver and pays no header.
    /// With `flow`, the first piece that does not fit is split when its kind allows.
    pub fn fill_forward(
        &self,
        start: Cut,
        limit: Cut,
        budget: usize,
        merge_first: bool,
        flow: bool,
    ) -> Cut {
        let mut pos = start;
        let mut used = 0;
        while pos < limit {
            let vi = self.items[pos.item];
            let to = if pos.item == limit.item {
                limit.unit
            } else {
                vi.units
            };
            let head = if merge_first && pos == Cut::START { 0 } else { vi.head };
            let cost = self.piece_cost(pos.item, pos.unit, to, head);
            if used + cost <= budget {
                used += cost;
                pos = self.advance(pos.item, to);
                continue;
            }
            if flow && vi.flow && budget > used + head && vi.unit_len > 0 {
                let fit = ((budget - used - head) / vi.unit_len).min(to - pos.unit - 1);
                if fit > 0 {
                    pos = Cut {
                        item: pos.item,
                        unit: pos.unit + fit,
                    };
                }
            }
            break;
        }
        pos
    }

    /// Packs greedily backward from `end` into `budget` bytes, stopping at `limit`.
    ///
    /// With `merge_last`, the last item glues onto the receiver and pays no header.
    pub fn fill_backward(
        &self,
        end: Cut,
        limit: Cut,
        budget: usize,
        merge_last: bool,
        flow: bool,
    ) -> Cut {
        let mut pos = end;
        let mut used = 0;
        while pos > limit {
            let (item, to) = if pos.unit > 0 {
                (pos.item, pos.unit)
            } else {
                (pos.item - 1, self.items[pos.item - 1].units)
            };
            let vi = self.items[item];
            let from = if limit.item == item { limit.unit } else { 0 };
            let head = if merge_last && item + 1 == self.items.len() && to == vi.units {
                0
            } else {
                vi.head
            };
            let cost = self.piece_cost(item, from, to, head);
            if used + cost <= budget {
                used += cost;
                pos = Cut { item, unit: from };
                continue;
            }
            if flow && vi.flow && budget > used + head && vi.unit_len > 0 {
                let fit = ((budget - used - head) / vi.unit_len).min(to - from - 1);
                if fit > 0 {
                    pos = Cut {
                        item,
                        unit: to - fit,
                    };
                }
            }
            break;
        }
        pos
    }

    /// Minimal number of fresh nodes holding `[start, end)`, packed first-fit.
    ///
    /// `None` when some piece exceeds a whole node.
    pub fn count_nodes(&self, start: Cut, end: Cut, flow: bool) -> Option<usize> {
        let mut pos = start;
        let mut count = 0;
        while pos < end {
            let next = self.fill_forward(pos, end, self.node_capacity, false, flow);
            if next == pos {
                return None;
            }
            pos = next;
            count += 1;
        }
        Some(count)
    }

    /// Boundaries splitting `[start, end)` evenly into `nodes` fresh nodes.
    ///
    /// Each node is filled towards an equal share of what is left; a fill is
    /// only accepted when the remainder still packs into the remaining nodes,
    /// otherwise the node is filled to capacity.
    pub fn balanced_cuts(&self, start: Cut, end: Cut, nodes: usize, flow: bool) -> Vec<Cut> {
        let mut cuts = Vec::new();
        let mut pos = start;
        for placed in 0..nodes.saturating_sub(1) {
            if pos >= end {
                break;
            }
            let left = nodes - placed;
            let target = self.span_cost(pos, end).div_ceil(left);
            let mut next = self.fill_toward(pos, end, target, flow);
            let fits_rest = self
                .count_nodes(next, end, flow)
                .is_some_and(|rest| rest < left);
            if next == pos || !fits_rest {
                next = self.fill_forward(pos, end, self.node_capacity, false, flow);
            }
            if next >= end {
                break;
            }
            cuts.push(next);
            pos = next;
        }
        cuts
    }

    fn fill_toward(&self, start: Cut, end: Cut, target: usize, flow: bool) -> Cut {
        let mut pos = start;
        let mut used = 0;
        while pos < end {
            let vi = self.items[pos.item];
            let to = if pos.item == end.item {
                end.unit
            } else {
                vi.units
            };
            let cost = self.piece_cost(pos.item, pos.unit, to, vi.head);
            if used + cost <= self.node_capacity && used + cost / 2 <= target {
                used += cost;
                pos = self.advance(pos.item, to);
                continue;
            }
            if flow && vi.flow && target > used + vi.head && vi.unit_len > 0 {
                let fit = ((target - used - vi.head) / vi.unit_len).min(to - pos.unit - 1);
                if fit > 0 {
                    pos = Cut {
                        item: pos.item,
                        unit: pos.unit + fit,
                    };
                }
            }
            break;
        }
        pos
    }
}

fn leaf_item(head: &ItemHead, opts: &TreeOptions) -> VirtualItem {
    let kind = head.key.kind;
    match kind.unit_len() {
        Some(unit) if opts.can_flow(kind) && head.len % unit == 0 && head.len > 0 => VirtualItem {
            head: opts.item_head_size,
            len: head.len,
            unit_len: unit,
            units: head.len / unit,
            flow: true,
        },
        _ => VirtualItem {
            head: opts.item_head_size,
            len: head.len,
            unit_len: head.len,
            units: 1,
            flow: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::stree::node::NodeLayout;
    use crate::types::{ItemKind, Key};

    fn opts() -> TreeOptions {
        TreeOptions {
            block_size: 1024,
            block_head_size: 16,
            item_head_size: 24,
            ..TreeOptions::default()
        }
    }

    fn leaf(items: Vec<Item>) -> Node {
        let mut node = Node::new_leaf(NodeLayout::from_options(&opts()));
        for (i, item) in items.into_iter().enumerate() {
            node.insert_item(i, item).unwrap();
        }
        node
    }

    fn stat(object: u32) -> Item {
        Item::new(Key::new(1, object, 0, ItemKind::StatData), vec![0; 16])
    }

    #[test]
    fn leaf_virtual_node_reflects_insert() -> Result<()> {
        let node = leaf(vec![stat(1), stat(3)]);
        let vn = VirtualNode::leaf(&node, 1, &Operation::Insert(stat(2)), &opts(), None, None)?;
        assert_eq!(vn.len(), 3);
        assert_eq!(vn.affected(), Some(1));
        assert_eq!(vn.total_cost(), 3 * 40);
        assert_eq!(vn.mode(), OpMode::Insert);
        Ok(())
    }

    #[test]
    fn mergeable_edges_cost_no_header() -> Result<()> {
        let left = leaf(vec![Item::new(Key::new(1, 7, 0, ItemKind::Directory), vec![0; 32])]);
        let node = leaf(vec![
            Item::new(Key::new(1, 7, 2, ItemKind::Directory), vec![0; 32]),
            stat(9),
        ]);
        let vn = VirtualNode::leaf(&node, 1, &Operation::Delete, &opts(), Some(&left), None)?;
        assert!(vn.left_mergeable());
        assert_eq!(vn.fill_forward(Cut::START, vn.end(), 32, true, false), vn.end());
        assert_eq!(vn.fill_forward(Cut::START, vn.end(), 32, false, false), Cut::START);
        Ok(())
    }

    #[test]
    fn flow_splits_directory_items() -> Result<()> {
        let node = leaf(vec![Item::new(Key::new(1, 7, 0, ItemKind::Directory), vec![0; 160])]);
        let vn = VirtualNode::leaf(
            &node,
            0,
            &Operation::Paste {
                offset: 160,
                bytes: vec![0; 16],
            },
            &opts(),
            None,
            None,
        )?;
        let cut = vn.fill_forward(Cut::START, vn.end(), 24 + 48, false, true);
        assert_eq!(cut, Cut { item: 0, unit: 3 });
        let back = vn.fill_backward(vn.end(), Cut::START, 24 + 48, false, true);
        assert_eq!(back, Cut { item: 0, unit: 8 });
        assert_eq!(vn.fill_forward(Cut::START, vn.end(), 24 + 48, false, false), Cut::START);
        Ok(())
    }

    #[test]
    fn balanced_cuts_split_evenly() -> Result<()> {
        let items: Vec<Item> = (0..25).map(stat).collect();
        let node = leaf(items);
        let vn = VirtualNode::leaf(&node, 25, &Operation::Insert(stat(25)), &opts(), None, None)?;
        assert_eq!(vn.count_nodes(Cut::START, vn.end(), false), Some(2));
        assert_eq!(
            vn.balanced_cuts(Cut::START, vn.end(), 2, false),
            vec![Cut::at(13)]
        );
        Ok(())
    }

    #[test]
    fn internal_virtual_node_needs_a_child_position() -> Result<()> {
        let layout = NodeLayout::from_options(&opts());
        let node = Node::new_internal(1, layout);
        assert!(VirtualNode::internal(&node, 0, ChildChange::Remove).is_err());
        Ok(())
    }
}
