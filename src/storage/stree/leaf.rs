//! Leaf-level mutation primitives.
//!
//! Every primitive keeps the node's free-space counter exact and refuses to
//! overflow the node. Item runs (`Vec<Item>`) are the unit of transfer
//! between nodes; the boundary items of a run are glued to the receiving
//! node when they continue each other.

use super::do_balance::{LevelOutcome, LevelParts};
use super::fix_nodes::LevelPlan;
use super::node::{DiskChild, Item, Node};
use super::virtual_node::Operation;
use crate::primitives::store::{BlockArena, Reservation};
use crate::types::{Key, Result, StreeError};

/// Removes the first `count` items of `items`; with `partial`, only the first
/// `partial` units of the last of them leave and the rest stays in place.
pub(super) fn take_front(
    items: &mut Vec<Item>,
    count: usize,
    partial: Option<usize>,
) -> Result<Vec<Item>> {
    if count > items.len() || (count == 0 && partial.is_some()) {
        return Err(StreeError::Corruption("shift count exceeds item count"));
    }
    match partial {
        None => Ok(items.drain(..count).collect()),
        Some(units) => {
            let mut moved: Vec<Item> = items.drain(..count - 1).collect();
            let rest = items[0].split_off(units)?;
            moved.push(std::mem::replace(&mut items[0], rest));
            Ok(moved)
        }
    }
}

/// Removes the last `count` items of `items`; with `partial`, only the last
/// `partial` units of the first of them leave.
pub(super) fn take_back(
    items: &mut Vec<Item>,
    count: usize,
    partial: Option<usize>,
) -> Result<Vec<Item>> {
    let len = items.len();
    if count > len || (count == 0 && partial.is_some()) {
        return Err(StreeError::Corruption("shift count exceeds item count"));
    }
    match partial {
        None => Ok(items.split_off(len - count)),
        Some(units) => {
            let mut moved = items.split_off(len - count + 1);
            let last = items
                .last_mut()
                .ok_or(StreeError::Corruption("partial shift of missing item"))?;
            let keep = last
                .units()
                .checked_sub(units)
                .ok_or(StreeError::Corruption("partial shift larger than item"))?;
            let tail = last.split_off(keep)?;
            moved.insert(0, tail);
            Ok(moved)
        }
    }
}

/// Splits `items` before item `index`, or inside it after `units` units.
pub(super) fn split_run(items: &mut Vec<Item>, index: usize, units: usize) -> Result<Vec<Item>> {
    if units == 0 {
        if index > items.len() {
            return Err(StreeError::Corruption("split index out of range"));
        }
        return Ok(items.split_off(index));
    }
    if index >= items.len() {
        return Err(StreeError::Corruption("split index out of range"));
    }
    let mut tail = items.split_off(index + 1);
    let piece = items[index].split_off(units)?;
    tail.insert(0, piece);
    Ok(tail)
}

impl Node {
    fn run_cost(&self, run: &[Item]) -> usize {
        let layout = self.layout();
        run.iter().map(|item| layout.item_cost(item.len())).sum()
    }

    /// Inserts `item` at `pos`.
    pub fn insert_item(&mut self, pos: usize, item: Item) -> Result<()> {
        let cost = self.layout().item_cost(item.len());
        if pos > self.item_count() {
            return Err(StreeError::Corruption("insert position out of range"));
        }
        self.leaf_items_mut()?;
        self.consume(cost)?;
        self.leaf_items_mut()?.insert(pos, item);
        Ok(())
    }

    /// Inserts `bytes` into the body of item `pos` at byte `offset`.
    pub fn paste_into_item(&mut self, pos: usize, offset: usize, bytes: &[u8]) -> Result<()> {
        check_paste(self.item(pos)?, offset, bytes.len())?;
        self.consume(bytes.len())?;
        paste_bytes(&mut self.leaf_items_mut()?[pos], offset, bytes);
        Ok(())
    }

    /// Removes `len` bytes at byte `offset` from the body of item `pos`.
    pub fn cut_from_item(&mut self, pos: usize, offset: usize, len: usize) -> Result<()> {
        check_cut(self.item(pos)?, offset, len)?;
        cut_bytes(&mut self.leaf_items_mut()?[pos], offset, len);
        self.release(len)
    }

    /// Deletes `count` whole items starting at `pos`.
    pub fn delete_items(&mut self, pos: usize, count: usize) -> Result<()> {
        if pos + count > self.item_count() {
            return Err(StreeError::Corruption("delete range out of bounds"));
        }
        let removed: Vec<Item> = self.leaf_items_mut()?.drain(pos..pos + count).collect();
        let cost = self.run_cost(&removed);
        self.release(cost)
    }

    /// Appends a run, gluing its first item onto the last item when they continue each other.
    pub fn append_items(&mut self, run: Vec<Item>) -> Result<()> {
        if run.is_empty() {
            return Ok(());
        }
        let merge = match self.last_head() {
            Some(last) => last.merges_with(&run[0].head),
            None => false,
        };
        let mut cost = self.run_cost(&run);
        if merge {
            cost -= self.layout().item_head;
        }
        self.leaf_items_mut()?;
        self.consume(cost)?;
        let items = self.leaf_items_mut()?;
        let mut run = run.into_iter();
        if merge {
            if let (Some(last), Some(first)) = (items.last_mut(), run.next()) {
                last.merge(first)?;
            }
        }
        items.extend(run);
        Ok(())
    }

    /// Prepends a run, gluing its last item onto the first item when they continue each other.
    pub fn prepend_items(&mut self, mut run: Vec<Item>) -> Result<()> {
        if run.is_empty() {
            return Ok(());
        }
        let merge = match (run.last(), self.first_head()) {
            (Some(last), Some(first)) => last.head.merges_with(&first),
            _ => false,
        };
        let mut cost = self.run_cost(&run);
        if merge {
            cost -= self.layout().item_head;
        }
        self.leaf_items_mut()?;
        self.consume(cost)?;
        let items = self.leaf_items_mut()?;
        if merge {
            let first = items.remove(0);
            if let Some(last) = run.last_mut() {
                last.merge(first)?;
            }
        }
        items.splice(0..0, run);
        Ok(())
    }

    /// Detaches every item.
    pub fn take_all_items(&mut self) -> Result<Vec<Item>> {
        let run = std::mem::take(self.leaf_items_mut()?);
        let cost = self.run_cost(&run);
        self.release(cost)?;
        Ok(run)
    }
}

fn check_unit_range(item: &Item, offset: usize, len: usize) -> Result<()> {
    let unit = item
        .key()
        .kind
        .unit_len()
        .ok_or(StreeError::Invalid("item kind does not support partial edits"))?;
    if offset % unit != 0 || len % unit != 0 {
        return Err(StreeError::Invalid("edit not aligned to item units"));
    }
    if offset > item.len() {
        return Err(StreeError::Invalid("edit offset beyond item body"));
    }
    Ok(())
}

/// Rejects a paste of `len` bytes at `offset` that the item cannot take.
pub(super) fn check_paste(item: &Item, offset: usize, len: usize) -> Result<()> {
    check_unit_range(item, offset, len)?;
    if len == 0 {
        return Err(StreeError::Invalid("empty paste"));
    }
    Ok(())
}

/// Rejects a cut that is misaligned, out of range or would empty the item.
pub(super) fn check_cut(item: &Item, offset: usize, len: usize) -> Result<()> {
    check_unit_range(item, offset, len)?;
    if len == 0 || offset + len > item.len() {
        return Err(StreeError::Invalid("cut range beyond item body"));
    }
    if len >= item.len() {
        return Err(StreeError::Invalid("cut would empty the item; delete it instead"));
    }
    Ok(())
}

fn paste_bytes(item: &mut Item, offset: usize, bytes: &[u8]) {
    item.body.splice(offset..offset, bytes.iter().copied());
    item.head.len = item.body.len();
}

fn cut_bytes(item: &mut Item, offset: usize, len: usize) {
    item.body.drain(offset..offset + len);
    item.head.len = item.body.len();
}

fn apply_in_place(node: &mut Node, pos: usize, op: &Operation) -> Result<()> {
    match op {
        Operation::Insert(item) => node.insert_item(pos, item.clone()),
        Operation::Paste { offset, bytes } => node.paste_into_item(pos, *offset, bytes),
        Operation::Cut { offset, len } => node.cut_from_item(pos, *offset, *len),
        Operation::Delete => node.delete_items(pos, 1),
    }
}

fn apply_to_run(run: &mut Vec<Item>, pos: usize, op: &Operation) -> Result<()> {
    match op {
        Operation::Insert(item) => {
            if pos > run.len() {
                return Err(StreeError::Corruption("insert position out of range"));
            }
            run.insert(pos, item.clone());
        }
        Operation::Paste { offset, bytes } => {
            let item = run
                .get_mut(pos)
                .ok_or(StreeError::Corruption("paste position out of range"))?;
            check_paste(item, *offset, bytes.len())?;
            paste_bytes(item, *offset, bytes);
        }
        Operation::Cut { offset, len } => {
            let item = run
                .get_mut(pos)
                .ok_or(StreeError::Corruption("cut position out of range"))?;
            check_cut(item, *offset, *len)?;
            cut_bytes(item, *offset, *len);
        }
        Operation::Delete => {
            if pos >= run.len() {
                return Err(StreeError::Corruption("delete position out of range"));
            }
            run.remove(pos);
        }
    }
    Ok(())
}

/// First key of a surviving node when it no longer equals the key
/// delimiting the node from its left neighbour.
///
/// Keeping delimiting keys equal to the first key on their right stops an
/// item of the left neighbour from growing across the delimiter.
fn moved_left_key(parts: &LevelParts) -> Option<Key> {
    let delimiter = parts.left_delimiter?;
    parts.node.first_key().filter(|key| *key != delimiter)
}

/// Applies the leaf operation and distributes the resulting items between
/// the neighbours, the node and its new siblings as planned.
pub(super) fn balance_leaf(
    arena: &mut BlockArena<Node>,
    plan: &LevelPlan,
    op: &Operation,
    reservation: &mut Reservation,
) -> Result<LevelOutcome> {
    let mut parts = LevelParts::detach(arena, plan)?;

    if plan.is_in_place() {
        apply_in_place(&mut parts.node, plan.position, op)?;
        let mut outcome = LevelOutcome::in_place(plan);
        outcome.left_key = moved_left_key(&parts);
        return parts.attach(arena, outcome);
    }

    let mut run = parts.node.take_all_items()?;
    apply_to_run(&mut run, plan.position, op)?;
    if run.len() != plan.item_count {
        return Err(StreeError::Corruption("leaf change disagrees with plan"));
    }
    let right_run = take_back(&mut run, plan.rnum, plan.rbytes)?;
    let mut middles = Vec::with_capacity(plan.splits.len());
    for cut in plan.splits.iter().rev() {
        middles.push(split_run(&mut run, cut.item, cut.unit)?);
    }
    middles.reverse();
    let left_run = take_front(&mut run, plan.lnum, plan.lbytes)?;
    let node_run = run;

    match parts.left.as_mut() {
        Some(left) => left.append_items(left_run)?,
        None if left_run.is_empty() => {}
        None => return Err(StreeError::Corruption("items planned for a missing left neighbour")),
    }
    match parts.right.as_mut() {
        Some(right) => right.prepend_items(right_run)?,
        None if right_run.is_empty() => {}
        None => return Err(StreeError::Corruption("items planned for a missing right neighbour")),
    }

    let mut outcome = LevelOutcome::for_plan(plan);
    if plan.removes_node() {
        if !node_run.is_empty() {
            return Err(StreeError::Corruption("removed node still holds items"));
        }
        outcome.separator = parts.right.as_ref().and_then(Node::first_key);
    } else {
        parts.node.append_items(node_run)?;
        outcome.left_key = moved_left_key(&parts);
        if plan.rnum > 0 {
            outcome.right_key = parts.right.as_ref().and_then(Node::first_key);
        }
    }

    let layout = parts.node.layout();
    for items in middles {
        let block = reservation.take()?;
        let mut node = Node::new_leaf(layout);
        node.append_items(items)?;
        let key = node
            .first_key()
            .ok_or(StreeError::Corruption("new leaf without items"))?;
        outcome.new_nodes.push((
            key,
            DiskChild {
                block,
                size: node.used(),
            },
        ));
        node.check()?;
        arena.insert(block, node);
    }
    parts.attach(arena, outcome)
}
