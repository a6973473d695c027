use crate::options::TreeOptions;
use crate::types::{BlockId, ItemHead, Key, Result, StreeError};
use serde::{Deserialize, Serialize};

/// Level number of leaf nodes.
pub const LEAF_LEVEL: usize = 0;

/// Byte accounting parameters shared by every node of a tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeLayout {
    /// Bytes available for items or children.
    pub capacity: usize,
    /// Bytes per leaf item header.
    pub item_head: usize,
    /// Bytes per pivot key.
    pub key: usize,
    /// Bytes per child pointer.
    pub disk_child: usize,
}

impl NodeLayout {
    /// Derives the layout from tree options.
    pub fn from_options(opts: &TreeOptions) -> Self {
        Self {
            capacity: opts.capacity(),
            item_head: opts.item_head_size,
            key: opts.key_size,
            disk_child: opts.disk_child_size,
        }
    }

    /// Bytes an item with a body of `len` bytes occupies in a leaf.
    pub fn item_cost(&self, len: usize) -> usize {
        self.item_head + len
    }

    /// Bytes one more child occupies in an internal node that already has children.
    pub fn entry_cost(&self) -> usize {
        self.key + self.disk_child
    }

    /// Bytes an internal node with `children` children occupies.
    pub fn internal_used(&self, children: usize) -> usize {
        if children == 0 {
            0
        } else {
            children * self.disk_child + (children - 1) * self.key
        }
    }
}

/// Leaf item: header plus opaque body bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Item {
    /// Key and length.
    pub head: ItemHead,
    /// Body bytes; `head.len == body.len()`.
    pub body: Vec<u8>,
}

impl Item {
    /// Builds an item from its key and body.
    pub fn new(key: Key, body: Vec<u8>) -> Self {
        Self {
            head: ItemHead::new(key, body.len()),
            body,
        }
    }

    /// Item key.
    pub fn key(&self) -> Key {
        self.head.key
    }

    /// Body length.
    pub fn len(&self) -> usize {
        self.head.len
    }

    /// Whether the body is empty.
    pub fn is_empty(&self) -> bool {
        self.head.len == 0
    }

    /// Number of units in the body.
    pub fn units(&self) -> usize {
        self.head.units()
    }

    /// Keeps the first `units` units and returns the rest as a new item keyed further into the object.
    pub fn split_off(&mut self, units: usize) -> Result<Item> {
        if units == 0 || units >= self.units() || self.key().kind.unit_len().is_none() {
            return Err(StreeError::Corruption("item split point out of range"));
        }
        let at = self.head.unit_bytes(units);
        let tail = self.body.split_off(at);
        self.head.len = self.body.len();
        Ok(Item::new(self.key().advanced(units), tail))
    }

    /// Appends the body of `right`, which must directly continue this item.
    pub fn merge(&mut self, right: Item) -> Result<()> {
        if !self.head.merges_with(&right.head) {
            return Err(StreeError::Corruption("merging items that do not continue each other"));
        }
        self.body.extend_from_slice(&right.body);
        self.head.len = self.body.len();
        Ok(())
    }
}

/// Child pointer of an internal node with the bytes used in that child.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskChild {
    /// Child block.
    pub block: BlockId,
    /// Bytes used in the child node.
    pub size: usize,
}

/// Contents of a node.
#[derive(Clone, Debug)]
pub enum NodeBody {
    /// Ordered items.
    Leaf(Vec<Item>),
    /// `k` children separated by `k - 1` pivot keys.
    Internal {
        /// Pivot keys; `keys[i]` separates `children[i]` and `children[i + 1]`.
        keys: Vec<Key>,
        /// Child pointers.
        children: Vec<DiskChild>,
    },
}

/// A fixed-capacity tree node.
#[derive(Clone, Debug)]
pub struct Node {
    level: usize,
    layout: NodeLayout,
    free_space: usize,
    pub(super) body: NodeBody,
}

impl Node {
    /// Creates an empty leaf.
    pub fn new_leaf(layout: NodeLayout) -> Self {
        Self {
            level: LEAF_LEVEL,
            layout,
            free_space: layout.capacity,
            body: NodeBody::Leaf(Vec::new()),
        }
    }

    /// Creates an empty internal node at `level`.
    pub fn new_internal(level: usize, layout: NodeLayout) -> Self {
        Self {
            level,
            layout,
            free_space: layout.capacity,
            body: NodeBody::Internal {
                keys: Vec::new(),
                children: Vec::new(),
            },
        }
    }

    /// Tree level; leaves are level 0.
    pub fn level(&self) -> usize {
        self.level
    }

    /// Whether this is a leaf.
    pub fn is_leaf(&self) -> bool {
        matches!(self.body, NodeBody::Leaf(_))
    }

    /// Byte accounting parameters.
    pub fn layout(&self) -> NodeLayout {
        self.layout
    }

    /// Free bytes according to the node's counter.
    pub fn free_space(&self) -> usize {
        self.free_space
    }

    /// Occupied bytes according to the node's counter.
    pub fn used(&self) -> usize {
        self.layout.capacity - self.free_space
    }

    /// Items in a leaf, pivot keys in an internal node.
    pub fn item_count(&self) -> usize {
        match &self.body {
            NodeBody::Leaf(items) => items.len(),
            NodeBody::Internal { keys, .. } => keys.len(),
        }
    }

    /// Body length of leaf item `i`, or the fixed entry size for internal nodes.
    pub fn item_len(&self, i: usize) -> Result<usize> {
        match &self.body {
            NodeBody::Leaf(items) => items
                .get(i)
                .map(Item::len)
                .ok_or(StreeError::Corruption("item index out of range")),
            NodeBody::Internal { keys, .. } if i < keys.len() => Ok(self.layout.entry_cost()),
            NodeBody::Internal { .. } => Err(StreeError::Corruption("item index out of range")),
        }
    }

    /// Leaf items.
    pub fn items(&self) -> &[Item] {
        match &self.body {
            NodeBody::Leaf(items) => items,
            NodeBody::Internal { .. } => &[],
        }
    }

    /// Leaf item `i`.
    pub fn item(&self, i: usize) -> Result<&Item> {
        self.items()
            .get(i)
            .ok_or(StreeError::Corruption("item index out of range"))
    }

    /// Pivot keys of an internal node.
    pub fn keys(&self) -> &[Key] {
        match &self.body {
            NodeBody::Leaf(_) => &[],
            NodeBody::Internal { keys, .. } => keys,
        }
    }

    /// Children of an internal node.
    pub fn children(&self) -> &[DiskChild] {
        match &self.body {
            NodeBody::Leaf(_) => &[],
            NodeBody::Internal { children, .. } => children,
        }
    }

    /// Number of children of an internal node.
    pub fn child_count(&self) -> usize {
        self.children().len()
    }

    /// Child pointer `i`.
    pub fn child(&self, i: usize) -> Result<DiskChild> {
        self.children()
            .get(i)
            .copied()
            .ok_or(StreeError::Corruption("child index out of range"))
    }

    /// Pivot key `i`.
    pub fn key(&self, i: usize) -> Result<Key> {
        self.keys()
            .get(i)
            .copied()
            .ok_or(StreeError::Corruption("key index out of range"))
    }

    /// Position of `block` among the children.
    pub fn child_position(&self, block: BlockId) -> Option<usize> {
        self.children().iter().position(|c| c.block == block)
    }

    /// Key of the first item of a leaf.
    pub fn first_key(&self) -> Option<Key> {
        self.items().first().map(Item::key)
    }

    /// Key of the last item of a leaf.
    pub fn last_key(&self) -> Option<Key> {
        self.items().last().map(Item::key)
    }

    /// Head of the first leaf item.
    pub fn first_head(&self) -> Option<ItemHead> {
        self.items().first().map(|item| item.head)
    }

    /// Head of the last leaf item.
    pub fn last_head(&self) -> Option<ItemHead> {
        self.items().last().map(|item| item.head)
    }

    /// Whether the first item continues the last item of `left`.
    pub fn is_left_mergeable(&self, left: &Node) -> bool {
        match (left.last_head(), self.first_head()) {
            (Some(l), Some(s)) => l.merges_with(&s),
            _ => false,
        }
    }

    /// Whether the first item of `right` continues this node's last item.
    pub fn is_right_mergeable(&self, right: &Node) -> bool {
        match (self.last_head(), right.first_head()) {
            (Some(s), Some(r)) => s.merges_with(&r),
            _ => false,
        }
    }

    /// Occupied bytes recounted from the contents.
    pub fn computed_used(&self) -> usize {
        match &self.body {
            NodeBody::Leaf(items) => items
                .iter()
                .map(|item| self.layout.item_cost(item.len()))
                .sum(),
            NodeBody::Internal { children, .. } => self.layout.internal_used(children.len()),
        }
    }

    /// Checks the free-space counter and the key/child count relation.
    pub fn check(&self) -> Result<()> {
        let used = self.computed_used();
        if used > self.layout.capacity {
            return Err(StreeError::Corruption("node contents exceed capacity"));
        }
        if used + self.free_space != self.layout.capacity {
            return Err(StreeError::Corruption("free space counter out of sync"));
        }
        match &self.body {
            NodeBody::Leaf(items) => {
                if items.iter().any(|item| item.head.len != item.body.len()) {
                    return Err(StreeError::Corruption("item head length mismatch"));
                }
                if items.windows(2).any(|w| w[0].key() >= w[1].key()) {
                    return Err(StreeError::Corruption("leaf keys not strictly increasing"));
                }
            }
            NodeBody::Internal { keys, children } => {
                if !children.is_empty() && keys.len() + 1 != children.len() {
                    return Err(StreeError::Corruption("internal node key/child count mismatch"));
                }
                if keys.windows(2).any(|w| w[0] >= w[1]) {
                    return Err(StreeError::Corruption("pivot keys not strictly increasing"));
                }
            }
        }
        Ok(())
    }

    /// Reserves `bytes` of free space, failing without change when they are not available.
    pub(super) fn consume(&mut self, bytes: usize) -> Result<()> {
        if bytes > self.free_space {
            return Err(StreeError::Corruption("node overflow"));
        }
        self.free_space -= bytes;
        Ok(())
    }

    /// Returns `bytes` to the free space.
    pub(super) fn release(&mut self, bytes: usize) -> Result<()> {
        if self.free_space + bytes > self.layout.capacity {
            return Err(StreeError::Corruption("free space above capacity"));
        }
        self.free_space += bytes;
        Ok(())
    }

    pub(super) fn leaf_items_mut(&mut self) -> Result<&mut Vec<Item>> {
        match &mut self.body {
            NodeBody::Leaf(items) => Ok(items),
            NodeBody::Internal { .. } => Err(StreeError::Corruption("leaf operation on internal node")),
        }
    }

    pub(super) fn internal_mut(&mut self) -> Result<(&mut Vec<Key>, &mut Vec<DiskChild>)> {
        match &mut self.body {
            NodeBody::Leaf(_) => Err(StreeError::Corruption("internal operation on leaf node")),
            NodeBody::Internal { keys, children } => Ok((keys, children)),
        }
    }

    /// Updates the recorded size of child `pos`.
    pub fn set_child_size(&mut self, pos: usize, size: usize) -> Result<()> {
        let (_, children) = self.internal_mut()?;
        let child = children
            .get_mut(pos)
            .ok_or(StreeError::Corruption("child index out of range"))?;
        child.size = size;
        Ok(())
    }

    /// Replaces pivot key `pos`.
    pub fn replace_key(&mut self, pos: usize, key: Key) -> Result<()> {
        let (keys, _) = self.internal_mut()?;
        let slot = keys
            .get_mut(pos)
            .ok_or(StreeError::Corruption("key index out of range"))?;
        *slot = key;
        Ok(())
    }
}
