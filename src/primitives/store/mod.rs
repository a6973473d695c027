#![forbid(unsafe_code)]

//! Block allocation and the in-memory block arena the tree operates on.

use std::collections::{BinaryHeap, HashMap};
use std::cmp::Reverse;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::types::{BlockId, Result, StreeError};

/// Source of empty blocks for new nodes and sink for blocks of discarded nodes.
pub trait Allocator: Send + Sync {
    /// Allocates `count` blocks at once; either all of them or none.
    fn allocate_nodes(&self, count: usize) -> Result<Vec<BlockId>>;

    /// Returns a block to the free pool.
    fn free_node(&self, block: BlockId);

    /// Number of blocks currently handed out.
    fn allocated(&self) -> u64;
}

/// Allocator over an in-memory block space with an optional size limit.
pub struct MemAllocator {
    limit: Option<u64>,
    state: Mutex<AllocState>,
}

#[derive(Default)]
struct AllocState {
    next: u64,
    allocated: u64,
    free: BinaryHeap<Reverse<u64>>,
}

impl MemAllocator {
    /// Creates an allocator that hands out at most `limit` blocks at a time.
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            limit,
            state: Mutex::new(AllocState {
                // Block 0 stays unused so it can never be mistaken for a live node.
                next: 1,
                ..AllocState::default()
            }),
        }
    }
}

impl Allocator for MemAllocator {
    fn allocate_nodes(&self, count: usize) -> Result<Vec<BlockId>> {
        let mut state = self.state.lock();
        if let Some(limit) = self.limit {
            if state.allocated + count as u64 > limit {
                tracing::debug!(
                    target: "stree::alloc",
                    requested = count,
                    allocated = state.allocated,
                    limit,
                    "allocation refused"
                );
                return Err(StreeError::NoDiskSpace);
            }
        }
        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            let id = match state.free.pop() {
                Some(Reverse(id)) => id,
                None => {
                    let id = state.next;
                    state.next += 1;
                    id
                }
            };
            blocks.push(BlockId(id));
        }
        state.allocated += count as u64;
        Ok(blocks)
    }

    fn free_node(&self, block: BlockId) {
        let mut state = self.state.lock();
        state.free.push(Reverse(block.0));
        state.allocated = state.allocated.saturating_sub(1);
    }

    fn allocated(&self) -> u64 {
        self.state.lock().allocated
    }
}

/// Blocks reserved for one balance; whatever is not consumed goes back on drop.
pub struct Reservation {
    allocator: Arc<dyn Allocator>,
    blocks: SmallVec<[BlockId; 4]>,
}

impl Reservation {
    /// Creates an empty reservation against `allocator`.
    pub fn new(allocator: Arc<dyn Allocator>) -> Self {
        Self {
            allocator,
            blocks: SmallVec::new(),
        }
    }

    /// Reserves `count` more blocks.
    pub fn reserve(&mut self, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let blocks = self.allocator.allocate_nodes(count)?;
        self.blocks.extend(blocks);
        Ok(())
    }

    /// Hands out the oldest reserved block.
    pub fn take(&mut self) -> Result<BlockId> {
        if self.blocks.is_empty() {
            return Err(StreeError::Corruption("balance consumed more blocks than reserved"));
        }
        Ok(self.blocks.remove(0))
    }

    /// Number of blocks still held.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether no blocks are held.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Returns a discarded block to the allocator.
    pub fn release(&self, block: BlockId) {
        self.allocator.free_node(block);
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        for block in self.blocks.drain(..) {
            self.allocator.free_node(block);
        }
    }
}

/// Map from block id to node, plus a record of recently touched blocks.
pub struct BlockArena<T> {
    blocks: HashMap<BlockId, T>,
    resident: Mutex<LruCache<BlockId, ()>>,
}

impl<T> BlockArena<T> {
    /// Creates an arena that remembers the `resident` most recently touched blocks.
    pub fn new(resident: usize) -> Self {
        let cap = NonZeroUsize::new(resident.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            blocks: HashMap::new(),
            resident: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Returns the node stored at `id`.
    pub fn get(&self, id: BlockId) -> Result<&T> {
        let node = self
            .blocks
            .get(&id)
            .ok_or(StreeError::Corruption("reference to unknown block"))?;
        self.resident.lock().put(id, ());
        Ok(node)
    }

    /// Returns the node stored at `id` for modification.
    pub fn get_mut(&mut self, id: BlockId) -> Result<&mut T> {
        self.resident.get_mut().put(id, ());
        self.blocks
            .get_mut(&id)
            .ok_or(StreeError::Corruption("reference to unknown block"))
    }

    /// Stores `node` at `id`, replacing any previous content.
    pub fn insert(&mut self, id: BlockId, node: T) {
        self.resident.get_mut().put(id, ());
        self.blocks.insert(id, node);
    }

    /// Removes the node stored at `id`.
    pub fn remove(&mut self, id: BlockId) -> Result<T> {
        self.resident.get_mut().pop(&id);
        self.blocks
            .remove(&id)
            .ok_or(StreeError::Corruption("reference to unknown block"))
    }

    /// Whether `id` was touched recently enough to count as cached.
    pub fn is_resident(&self, id: BlockId) -> bool {
        self.resident.lock().contains(&id)
    }

    /// Whether a node is stored at `id`.
    pub fn contains(&self, id: BlockId) -> bool {
        self.blocks.contains_key(&id)
    }

    /// Number of stored nodes.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the arena is empty.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Ids of all stored nodes, in no particular order.
    pub fn ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks.keys().copied()
    }
}
