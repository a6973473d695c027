//! Configuration for a tree instance: block layout parameters and balancing knobs.

use serde::{Deserialize, Serialize};

use crate::types::{ItemKind, Result, StreeError};

/// Configuration knobs for the tree.
///
/// The layout fields describe the caller's on-disk format; the engine only
/// uses them for byte accounting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeOptions {
    /// Size of every block in bytes.
    pub block_size: usize,
    /// Bytes reserved at the start of each block for the node header.
    pub block_head_size: usize,
    /// Bytes taken by one leaf item header.
    pub item_head_size: usize,
    /// Bytes taken by one pivot key inside an internal node.
    pub key_size: usize,
    /// Bytes taken by one child pointer (block number + subtree size).
    pub disk_child_size: usize,
    /// Item kinds that may be split across a node boundary.
    pub flow_kinds: Vec<ItemKind>,
    /// Number of recently touched blocks considered resident when breaking ties.
    pub resident_blocks: usize,
    /// Upper bound on allocated blocks; `None` means unbounded.
    pub max_blocks: Option<u64>,
    /// Number of planning restarts tolerated per operation before giving up.
    pub max_restarts: usize,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            block_head_size: 24,
            item_head_size: 24,
            key_size: 16,
            disk_child_size: 8,
            flow_kinds: vec![ItemKind::Directory, ItemKind::Indirect],
            resident_blocks: 64,
            max_blocks: None,
            max_restarts: 16,
        }
    }
}

impl TreeOptions {
    /// Bytes available to items or children in one node.
    pub fn capacity(&self) -> usize {
        self.block_size - self.block_head_size
    }

    /// Bytes one additional child costs inside an internal node (pivot key + pointer).
    pub fn internal_entry_len(&self) -> usize {
        self.key_size + self.disk_child_size
    }

    /// Largest item body a leaf can hold.
    pub fn max_item_len(&self) -> usize {
        self.capacity() - self.item_head_size
    }

    /// Whether items of `kind` may be split at unit granularity.
    pub fn can_flow(&self, kind: ItemKind) -> bool {
        kind.unit_len().is_some() && self.flow_kinds.contains(&kind)
    }

    /// Rejects layouts the balancing engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.block_size <= self.block_head_size {
            return Err(StreeError::Invalid("block size smaller than block header"));
        }
        if self.key_size == 0 || self.disk_child_size == 0 {
            return Err(StreeError::Invalid("key and child pointer sizes must be non-zero"));
        }
        // An internal node must hold at least three children so splits make progress.
        if self.capacity() < 3 * self.disk_child_size + 2 * self.key_size {
            return Err(StreeError::Invalid("block too small for an internal node"));
        }
        if self.capacity() <= self.item_head_size {
            return Err(StreeError::Invalid("block too small for a leaf item"));
        }
        if self.flow_kinds.contains(&ItemKind::StatData) {
            return Err(StreeError::Invalid("stat data items cannot flow"));
        }
        Ok(())
    }
}
