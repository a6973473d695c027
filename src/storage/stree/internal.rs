//! Internal-level execution.
//!
//! Children travel between internal nodes as a [`ChildRun`]: `k` child
//! pointers with the `k - 1` keys separating them. Moving a run into a
//! non-empty neighbour needs the key that separated the two nodes in their
//! common ancestor; moving the run out of a node produces the key that now
//! separates what left from what stayed.

use std::mem;

use super::do_balance::{ChildEdit, LevelOutcome, LevelParts};
use super::fix_nodes::LevelPlan;
use super::node::{DiskChild, Node};
use crate::primitives::store::{BlockArena, Reservation};
use crate::types::{Key, Result, StreeError};

/// Children detached from an internal node together with their separators.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChildRun {
    /// Separator keys; `keys[i]` lies between `children[i]` and `children[i + 1]`.
    pub keys: Vec<Key>,
    /// Child pointers.
    pub children: Vec<DiskChild>,
}

impl ChildRun {
    /// Number of children.
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Whether the run holds no children.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Inserts `entries` right after child `after`; each key becomes the
    /// separator in front of its child.
    pub fn insert_children(&mut self, after: usize, entries: Vec<(Key, DiskChild)>) -> Result<()> {
        if after >= self.children.len() {
            return Err(StreeError::Corruption("child insert position out of range"));
        }
        let (keys, children): (Vec<Key>, Vec<DiskChild>) = entries.into_iter().unzip();
        self.keys.splice(after..after, keys);
        self.children.splice(after + 1..after + 1, children);
        Ok(())
    }

    /// Removes child `pos` with the key in front of it (or after it for the first child).
    pub fn remove_child(&mut self, pos: usize) -> Result<DiskChild> {
        if pos >= self.children.len() {
            return Err(StreeError::Corruption("child remove position out of range"));
        }
        let child = self.children.remove(pos);
        if !self.keys.is_empty() {
            self.keys.remove(pos.saturating_sub(1));
        }
        Ok(child)
    }

    /// Splits before child `at`, returning the separator and the tail.
    pub fn split_off(&mut self, at: usize) -> Result<(Key, ChildRun)> {
        if at == 0 || at >= self.children.len() {
            return Err(StreeError::Corruption("child split point out of range"));
        }
        let children = self.children.split_off(at);
        let keys = self.keys.split_off(at);
        let separator = self
            .keys
            .pop()
            .ok_or(StreeError::Corruption("child run without separator"))?;
        Ok((separator, ChildRun { keys, children }))
    }

    /// Splits before child `at`, allowing either side to end up empty.
    fn split_edge(&mut self, at: usize) -> Result<(Option<Key>, ChildRun)> {
        if at == 0 {
            return Ok((None, mem::take(self)));
        }
        if at == self.children.len() {
            return Ok((None, ChildRun::default()));
        }
        let (separator, tail) = self.split_off(at)?;
        Ok((Some(separator), tail))
    }
}

impl Node {
    /// Detaches every child.
    pub fn take_all_children(&mut self) -> Result<ChildRun> {
        let (keys, children) = self.internal_mut()?;
        let run = ChildRun {
            keys: mem::take(keys),
            children: mem::take(children),
        };
        let used = self.layout().internal_used(run.len());
        self.release(used)?;
        Ok(run)
    }

    fn child_growth(&self, added: usize) -> usize {
        let layout = self.layout();
        let before = self.child_count();
        layout.internal_used(before + added) - layout.internal_used(before)
    }

    /// Appends `run`; `delimiter` separates the current last child from the
    /// run's first child and is ignored when the node is empty.
    pub fn append_children(&mut self, delimiter: Key, run: ChildRun) -> Result<()> {
        if run.is_empty() {
            return Ok(());
        }
        self.internal_mut()?;
        self.consume(self.child_growth(run.len()))?;
        let (keys, children) = self.internal_mut()?;
        if !children.is_empty() {
            keys.push(delimiter);
        }
        keys.extend(run.keys);
        children.extend(run.children);
        Ok(())
    }

    /// Prepends `run`; `delimiter` separates the run's last child from the
    /// current first child and is ignored when the node is empty.
    pub fn prepend_children(&mut self, run: ChildRun, delimiter: Key) -> Result<()> {
        if run.is_empty() {
            return Ok(());
        }
        self.internal_mut()?;
        self.consume(self.child_growth(run.len()))?;
        let (keys, children) = self.internal_mut()?;
        if !children.is_empty() {
            keys.insert(0, delimiter);
        }
        keys.splice(0..0, run.keys);
        children.splice(0..0, run.children);
        Ok(())
    }

    /// Inserts new children right after child `after`.
    pub fn insert_children(&mut self, after: usize, entries: Vec<(Key, DiskChild)>) -> Result<()> {
        if after >= self.child_count() {
            return Err(StreeError::Corruption("child insert position out of range"));
        }
        self.internal_mut()?;
        self.consume(self.child_growth(entries.len()))?;
        let (keys, children) = self.internal_mut()?;
        let mut run = ChildRun {
            keys: mem::take(keys),
            children: mem::take(children),
        };
        run.insert_children(after, entries)?;
        *keys = run.keys;
        *children = run.children;
        Ok(())
    }

    /// Removes child `pos` and its separator.
    pub fn delete_child(&mut self, pos: usize) -> Result<DiskChild> {
        let count = self.child_count();
        if pos >= count {
            return Err(StreeError::Corruption("child remove position out of range"));
        }
        let layout = self.layout();
        let freed = layout.internal_used(count) - layout.internal_used(count - 1);
        let (keys, children) = self.internal_mut()?;
        let mut run = ChildRun {
            keys: mem::take(keys),
            children: mem::take(children),
        };
        let child = run.remove_child(pos)?;
        *keys = run.keys;
        *children = run.children;
        self.release(freed)?;
        Ok(child)
    }
}

/// Applies the child edit from the level below to the internal node of
/// `plan` and redistributes its children as planned.
pub(super) fn balance_internal(
    arena: &mut BlockArena<Node>,
    plan: &LevelPlan,
    edit: Option<ChildEdit>,
    reservation: &mut Reservation,
) -> Result<LevelOutcome> {
    let mut parts = LevelParts::detach(arena, plan)?;

    if plan.is_in_place() {
        match edit {
            Some(ChildEdit::Insert { after, entries }) => parts.node.insert_children(after, entries)?,
            Some(ChildEdit::Remove { pos }) => {
                parts.node.delete_child(pos)?;
            }
            None => {}
        }
        return parts.attach(arena, LevelOutcome::in_place(plan));
    }

    let mut run = parts.node.take_all_children()?;
    match edit {
        Some(ChildEdit::Insert { after, entries }) => run.insert_children(after, entries)?,
        Some(ChildEdit::Remove { pos }) => {
            run.remove_child(pos)?;
        }
        None => {}
    }
    let total = run.len();
    if total != plan.item_count || plan.lnum + plan.rnum > total {
        return Err(StreeError::Corruption("child edit disagrees with plan"));
    }

    let (right_sep, right_run) = run.split_edge(total - plan.rnum)?;
    let mut middles = Vec::with_capacity(plan.splits.len());
    for cut in plan.splits.iter().rev() {
        middles.push(run.split_off(cut.item)?);
    }
    middles.reverse();
    let (left_sep, node_run) = run.split_edge(plan.lnum)?;
    let left_run = run;

    let mut outcome = LevelOutcome::for_plan(plan);
    if let Some(left) = parts.left.as_mut() {
        let delimiter = parts.left_delimiter.ok_or(StreeError::Corruption("left neighbour without delimiting key"))?;
        left.append_children(delimiter, left_run)?;
    } else if !left_run.is_empty() {
        return Err(StreeError::Corruption("children planned for a missing left neighbour"));
    }
    if let Some(right) = parts.right.as_mut() {
        let delimiter = parts.right_delimiter.ok_or(StreeError::Corruption("right neighbour without delimiting key"))?;
        right.prepend_children(right_run, delimiter)?;
    } else if !right_run.is_empty() {
        return Err(StreeError::Corruption("children planned for a missing right neighbour"));
    }

    if plan.removes_node() {
        if !node_run.is_empty() {
            return Err(StreeError::Corruption("removed node still holds children"));
        }
        outcome.separator = if total == 0 {
            None
        } else if plan.lnum > 0 && plan.rnum > 0 {
            right_sep
        } else if plan.rnum == 0 {
            parts.right_delimiter
        } else {
            parts.left_delimiter
        };
    } else {
        parts.node.append_children(Key::MIN, node_run)?;
        if plan.lnum > 0 {
            outcome.left_key = left_sep;
        }
        if plan.rnum > 0 {
            outcome.right_key = right_sep;
        }
    }

    let level = parts.node.level();
    let layout = parts.node.layout();
    for (separator, child_run) in middles {
        let block = reservation.take()?;
        let mut node = Node::new_internal(level, layout);
        node.append_children(separator, child_run)?;
        outcome.new_nodes.push((
            separator,
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
