use super::node::{Item, Node};
use crate::primitives::store::BlockArena;
use crate::types::{BlockId, Key, Result, StreeError};

/// One step of a root-to-leaf descent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PathElement {
    /// Node visited at this step.
    pub block: BlockId,
    /// Child index taken (internal) or item index (leaf).
    pub position: usize,
}

/// Root-to-leaf stack of nodes and positions, valid for one generation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Path {
    elements: Vec<PathElement>,
    generation: u64,
}

/// Outcome of a key search.
#[derive(Clone, Debug)]
pub struct SearchResult {
    /// Path to the leaf that holds or would hold the key.
    pub path: Path,
    /// Whether an item with exactly this key exists at the leaf position.
    pub found: bool,
}

impl Path {
    /// Builds a path from root-first elements.
    pub fn new(elements: Vec<PathElement>, generation: u64) -> Self {
        Self {
            elements,
            generation,
        }
    }

    /// Number of levels covered; equal to the tree height.
    pub fn height(&self) -> usize {
        self.elements.len()
    }

    /// Generation the path was derived at.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Root-first elements.
    pub fn elements(&self) -> &[PathElement] {
        &self.elements
    }

    fn element_at(&self, level: usize) -> Option<&PathElement> {
        let len = self.elements.len();
        if level >= len {
            return None;
        }
        self.elements.get(len - 1 - level)
    }

    /// Node at `level` (0 = leaf).
    pub fn block_at(&self, level: usize) -> Option<BlockId> {
        self.element_at(level).map(|e| e.block)
    }

    /// Position recorded at `level`.
    pub fn position_at(&self, level: usize) -> Option<usize> {
        self.element_at(level).map(|e| e.position)
    }

    /// Leaf node.
    pub fn leaf(&self) -> Result<BlockId> {
        self.block_at(0)
            .ok_or(StreeError::Corruption("empty path"))
    }

    /// Item position inside the leaf.
    pub fn leaf_position(&self) -> Result<usize> {
        self.position_at(0)
            .ok_or(StreeError::Corruption("empty path"))
    }

    /// Parent of the node at `level` and the node's position in it.
    pub fn parent_of(&self, level: usize) -> Option<(BlockId, usize)> {
        Some((self.block_at(level + 1)?, self.position_at(level + 1)?))
    }

    /// Checks that the path still describes the tree.
    ///
    /// Any mismatch means a structural change happened after the descent and
    /// yields [`StreeError::RepeatSearch`].
    pub fn validate(&self, arena: &BlockArena<Node>, generation: u64) -> Result<()> {
        if self.generation != generation {
            return Err(StreeError::RepeatSearch);
        }
        let height = self.elements.len();
        for (depth, pair) in self.elements.windows(2).enumerate() {
            let parent = arena.get(pair[0].block).map_err(|_| StreeError::RepeatSearch)?;
            if parent.level() != height - 1 - depth {
                return Err(StreeError::RepeatSearch);
            }
            match parent.children().get(pair[0].position) {
                Some(child) if child.block == pair[1].block => {}
                _ => return Err(StreeError::RepeatSearch),
            }
        }
        let leaf = arena
            .get(self.leaf()?)
            .map_err(|_| StreeError::RepeatSearch)?;
        if !leaf.is_leaf() || self.leaf_position()? > leaf.item_count() {
            return Err(StreeError::RepeatSearch);
        }
        Ok(())
    }
}

/// Descends from `root` towards `key`.
pub fn search_by_key(
    arena: &BlockArena<Node>,
    root: BlockId,
    key: &Key,
    generation: u64,
) -> Result<SearchResult> {
    let mut elements = Vec::new();
    let mut current = root;
    loop {
        let node = arena.get(current)?;
        if node.is_leaf() {
            let (position, found) = match node.items().binary_search_by(|item| item.key().cmp(key)) {
                Ok(pos) => (pos, true),
                Err(pos) => (pos, false),
            };
            elements.push(PathElement {
                block: current,
                position,
            });
            return Ok(SearchResult {
                path: Path::new(elements, generation),
                found,
            });
        }
        let position = node.keys().partition_point(|pivot| pivot <= key);
        let child = node.child(position)?;
        elements.push(PathElement {
            block: current,
            position,
        });
        current = child.block;
    }
}

/// Leaf next to the leaf of `path` in key order, in `direction`.
///
/// Climbs to the lowest ancestor that has a child beside the path and
/// descends along the near edge of that child's subtree.
fn adjacent_leaf<'a>(
    arena: &'a BlockArena<Node>,
    path: &Path,
    forward: bool,
) -> Result<Option<&'a Node>> {
    let elements = path.elements();
    for element in elements.iter().rev().skip(1) {
        let node = arena.get(element.block)?;
        let sibling = if forward {
            element.position + 1
        } else {
            match element.position.checked_sub(1) {
                Some(pos) => pos,
                None => continue,
            }
        };
        if sibling >= node.child_count() {
            continue;
        }
        let mut current = arena.get(node.child(sibling)?.block)?;
        while !current.is_leaf() {
            let edge = if forward {
                0
            } else {
                current
                    .child_count()
                    .checked_sub(1)
                    .ok_or(StreeError::Corruption("internal node without children"))?
            };
            current = arena.get(current.child(edge)?.block)?;
        }
        return Ok(Some(current));
    }
    Ok(None)
}

/// First item at or after leaf position `position` of `path`, continuing
/// into the following leaves.
pub fn item_at_or_after<'a>(
    arena: &'a BlockArena<Node>,
    path: &Path,
    position: usize,
) -> Result<Option<&'a Item>> {
    let leaf = arena.get(path.leaf()?)?;
    if let Some(item) = leaf.items().get(position) {
        return Ok(Some(item));
    }
    Ok(adjacent_leaf(arena, path, true)?.and_then(|node| node.items().first()))
}

/// Last item before leaf position `position` of `path`, continuing into the
/// preceding leaves.
pub fn item_before<'a>(
    arena: &'a BlockArena<Node>,
    path: &Path,
    position: usize,
) -> Result<Option<&'a Item>> {
    let leaf = arena.get(path.leaf()?)?;
    if let Some(item) = position.checked_sub(1).and_then(|pos| leaf.items().get(pos)) {
        return Ok(Some(item));
    }
    Ok(adjacent_leaf(arena, path, false)?.and_then(|node| node.items().last()))
}
