use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::do_balance::{do_balance, BalanceOutcome};
use super::fix_nodes::{fix_nodes, BalanceContext, TreeBalance};
use super::node::{Item, Node, NodeLayout};
use super::path::{item_at_or_after, item_before, search_by_key, Path, SearchResult};
use super::stats::BalanceStats;
use super::verify::{collect_items, verify, TreeSummary};
use super::virtual_node::Operation;
use crate::options::TreeOptions;
use crate::primitives::concurrency::{LockSnapshot, TreeLock};
use crate::primitives::store::{Allocator, BlockArena, MemAllocator};
use crate::types::{BlockId, ItemHead, Key, Result, StreeError};

/// Everything guarded by the tree lock.
pub struct TreeState {
    arena: BlockArena<Node>,
    root: BlockId,
    height: usize,
}

impl TreeState {
    /// Node storage.
    pub fn arena(&self) -> &BlockArena<Node> {
        &self.arena
    }

    /// Current root.
    pub fn root(&self) -> BlockId {
        self.root
    }

    /// Current height.
    pub fn height(&self) -> usize {
        self.height
    }
}

/// Balanced tree of items over fixed-size nodes.
///
/// Every mutation plans under a shared lock, then executes under the
/// exclusive lock once the generation is confirmed unchanged; a concurrent
/// commit in between restarts the operation from the key search.
///
/// A failed balance halts the tree: every later call returns
/// [`StreeError::Corruption`].
pub struct STree {
    options: TreeOptions,
    allocator: Arc<dyn Allocator>,
    state: TreeLock<TreeState>,
    stats: BalanceStats,
    halted: AtomicBool,
}

impl STree {
    /// Creates an empty tree backed by an in-memory allocator.
    pub fn new(options: TreeOptions) -> Result<Self> {
        let allocator = Arc::new(MemAllocator::new(options.max_blocks));
        Self::with_allocator(options, allocator)
    }

    /// Creates an empty tree drawing blocks from `allocator`.
    pub fn with_allocator(options: TreeOptions, allocator: Arc<dyn Allocator>) -> Result<Self> {
        options.validate()?;
        let root = allocator
            .allocate_nodes(1)?
            .pop()
            .ok_or(StreeError::NoDiskSpace)?;
        let mut arena = BlockArena::new(options.resident_blocks);
        arena.insert(root, Node::new_leaf(NodeLayout::from_options(&options)));
        Ok(Self {
            options,
            allocator,
            state: TreeLock::new(TreeState {
                arena,
                root,
                height: 1,
            }),
            stats: BalanceStats::default(),
            halted: AtomicBool::new(false),
        })
    }

    /// Tree configuration.
    pub fn options(&self) -> &TreeOptions {
        &self.options
    }

    /// Balancing statistics.
    pub fn stats(&self) -> &BalanceStats {
        &self.stats
    }

    /// Lock counters.
    pub fn lock_snapshot(&self) -> LockSnapshot {
        self.state.snapshot()
    }

    /// Generation of the last committed change.
    pub fn generation(&self) -> u64 {
        self.state.generation()
    }

    /// Number of levels.
    pub fn height(&self) -> usize {
        self.state.read().height
    }

    /// Current root block.
    pub fn root(&self) -> BlockId {
        self.state.read().root
    }

    /// Whether a failed balance stopped the tree.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_halted() {
            return Err(StreeError::Corruption("tree halted after a failed balance"));
        }
        Ok(())
    }

    /// Blocks currently handed out by the allocator.
    pub fn allocated_blocks(&self) -> u64 {
        self.allocator.allocated()
    }

    /// Runs `f` against the locked state without modifying it.
    pub fn inspect<R>(&self, f: impl FnOnce(&TreeState) -> R) -> R {
        f(&self.state.read())
    }

    /// Returns the item stored under `key`.
    pub fn get(&self, key: &Key) -> Result<Option<Item>> {
        self.ensure_running()?;
        let state = self.state.read();
        self.stats.inc_searches();
        let found = search_by_key(&state.arena, state.root, key, state.generation())?;
        if !found.found {
            return Ok(None);
        }
        let leaf = state.arena.get(found.path.leaf()?)?;
        Ok(Some(leaf.item(found.path.leaf_position()?)?.clone()))
    }

    /// All items in key order.
    pub fn items(&self) -> Result<Vec<Item>> {
        self.ensure_running()?;
        let state = self.state.read();
        collect_items(&state.arena, state.root)
    }

    /// Checks every tree invariant.
    pub fn verify(&self) -> Result<TreeSummary> {
        self.ensure_running()?;
        let state = self.state.read();
        verify(&state.arena, state.root, state.height)
    }

    /// Inserts a new item; its key must not be present yet.
    ///
    /// The item's unit range must not overlap a piece of the same object
    /// already in the tree.
    pub fn insert_item(&self, item: Item) -> Result<BalanceOutcome> {
        check_new_item(&item, &self.options)?;
        let key = item.key();
        self.apply(&key, |found, arena| {
            if found.found {
                return Err(StreeError::ItemExists);
            }
            let pos = found.path.leaf_position()?;
            if let Some(prev) = item_before(arena, &found.path, pos)? {
                if !prev.head.precedes(&key) {
                    return Err(StreeError::Invalid("item overlaps the previous item of the object"));
                }
            }
            check_next_item(arena, &found.path, pos, &item.head)?;
            Ok(Operation::Insert(item.clone()))
        })
    }

    /// Inserts `bytes` into the body of the item under `key` at byte `offset`.
    ///
    /// The grown item must not reach into the unit range of the next item of
    /// the same object, wherever in the tree that item lives.
    pub fn paste_into_item(&self, key: &Key, offset: usize, bytes: &[u8]) -> Result<BalanceOutcome> {
        self.apply(key, |found, arena| {
            let leaf = existing_leaf(found, arena)?;
            let pos = found.path.leaf_position()?;
            let item = leaf.item(pos)?;
            let grown = ItemHead::new(*key, item.len() + bytes.len());
            check_next_item(arena, &found.path, pos + 1, &grown)?;
            Ok(Operation::Paste {
                offset,
                bytes: bytes.to_vec(),
            })
        })
    }

    /// Removes `len` bytes at byte `offset` from the body of the item under `key`.
    pub fn cut_from_item(&self, key: &Key, offset: usize, len: usize) -> Result<BalanceOutcome> {
        self.apply(key, |found, arena| {
            existing_leaf(found, arena)?;
            Ok(Operation::Cut { offset, len })
        })
    }

    /// Removes the item under `key`.
    pub fn delete_item(&self, key: &Key) -> Result<BalanceOutcome> {
        self.apply(key, |found, arena| {
            existing_leaf(found, arena)?;
            Ok(Operation::Delete)
        })
    }

    /// Plans `op` for the item position of `key` without executing it.
    pub fn plan(&self, key: &Key, op: Operation) -> Result<TreeBalance> {
        self.ensure_running()?;
        let state = self.state.read();
        let generation = state.generation();
        let found = search_by_key(&state.arena, state.root, key, generation)?;
        fix_nodes(&state.arena, &found.path, op, &self.context(generation))
    }

    fn context(&self, generation: u64) -> BalanceContext<'_> {
        BalanceContext {
            options: &self.options,
            allocator: Arc::clone(&self.allocator),
            generation,
        }
    }

    fn apply<F>(&self, key: &Key, build: F) -> Result<BalanceOutcome>
    where
        F: Fn(&SearchResult, &BlockArena<Node>) -> Result<Operation>,
    {
        let mut restarts = 0usize;
        loop {
            self.ensure_running()?;
            let (tb, snapshot) = {
                let state = self.state.read();
                let generation = state.generation();
                self.stats.inc_searches();
                let found = search_by_key(&state.arena, state.root, key, generation)?;
                let op = build(&found, &state.arena)?;
                match fix_nodes(&state.arena, &found.path, op, &self.context(generation)) {
                    Ok(tb) => (tb, generation),
                    Err(StreeError::RepeatSearch) => {
                        self.note_restart(&mut restarts)?;
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            };
            let mut state = match self.state.write_at(snapshot) {
                Ok(state) => state,
                Err(StreeError::RepeatSearch) => {
                    drop(tb);
                    self.note_restart(&mut restarts)?;
                    continue;
                }
                Err(err) => return Err(err),
            };
            self.ensure_running()?;
            state.mark_dirty();
            let outcome = match do_balance(&mut state.arena, tb) {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.halted.store(true, Ordering::Release);
                    tracing::error!(
                        target: "stree::balance",
                        error = %err,
                        key = %key,
                        "balance failed; tree halted"
                    );
                    return Err(err);
                }
            };
            state.root = outcome.root;
            state.height = outcome.height;
            self.record(&outcome);
            return Ok(outcome);
        }
    }

    fn note_restart(&self, restarts: &mut usize) -> Result<()> {
        *restarts += 1;
        self.stats.inc_restarts();
        if *restarts > self.options.max_restarts {
            tracing::warn!(
                target: "stree::balance",
                restarts = *restarts,
                "giving up after repeated restarts"
            );
            return Err(StreeError::RepeatSearch);
        }
        tracing::debug!(target: "stree::balance", restarts = *restarts, "restarting from search");
        Ok(())
    }

    fn record(&self, outcome: &BalanceOutcome) {
        if outcome.in_place {
            self.stats.inc_in_place_edits();
        }
        self.stats.add_splits(true, outcome.leaf_splits);
        self.stats.add_splits(false, outcome.internal_splits);
        for _ in 0..outcome.leaf_merges {
            self.stats.inc_merges(true);
        }
        for _ in 0..outcome.internal_merges {
            self.stats.inc_merges(false);
        }
        for _ in 0..outcome.left_shifts {
            self.stats.inc_left_shifts();
        }
        for _ in 0..outcome.right_shifts {
            self.stats.inc_right_shifts();
        }
        for _ in 0..outcome.flow_shifts {
            self.stats.inc_flow_shifts();
        }
        if outcome.root_grown {
            self.stats.inc_root_grows();
        }
        for _ in 0..outcome.root_collapses {
            self.stats.inc_root_collapses();
        }
    }
}

fn check_new_item(item: &Item, opts: &TreeOptions) -> Result<()> {
    if item.len() > opts.max_item_len() {
        return Err(StreeError::Invalid("item larger than a node"));
    }
    if let Some(unit) = item.key().kind.unit_len() {
        if item.is_empty() || item.len() % unit != 0 {
            return Err(StreeError::Invalid("item body is not a whole number of units"));
        }
    }
    Ok(())
}

/// Rejects `head` when it reaches past the start of the first item at or
/// after leaf position `pos` in key order.
fn check_next_item(arena: &BlockArena<Node>, path: &Path, pos: usize, head: &ItemHead) -> Result<()> {
    match item_at_or_after(arena, path, pos)? {
        Some(next) if !head.precedes(&next.key()) => {
            Err(StreeError::Invalid("item overlaps the next item of the object"))
        }
        _ => Ok(()),
    }
}

fn existing_leaf<'a>(found: &SearchResult, arena: &'a BlockArena<Node>) -> Result<&'a Node> {
    if !found.found {
        return Err(StreeError::NotFound);
    }
    arena.get(found.path.leaf()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ItemKind;

    fn opts() -> TreeOptions {
        TreeOptions {
            block_size: 1024,
            block_head_size: 16,
            ..TreeOptions::default()
        }
    }

    fn stat(object: u32) -> Item {
        Item::new(Key::new(1, object, 0, ItemKind::StatData), vec![object as u8; 16])
    }

    fn loaded() -> Result<STree> {
        let tree = STree::new(opts())?;
        for object in 0..60 {
            tree.insert_item(stat(object * 2))?;
        }
        Ok(tree)
    }

    #[test]
    fn failed_balance_halts_the_tree_and_keeps_its_nodes() -> Result<()> {
        let tree = loaded()?;
        let blocks: Vec<BlockId> = tree.inspect(|state| state.arena.ids().collect());
        {
            let generation = tree.generation();
            let mut state = tree.state.write_at(generation)?;
            let found = search_by_key(&state.arena, state.root, &stat(1).key(), generation)?;
            let leaf = found.path.leaf()?;
            // The body no longer matches its head.
            state.arena.get_mut(leaf)?.leaf_items_mut()?[0].body.push(0);
        }

        assert!(matches!(
            tree.insert_item(stat(1)),
            Err(StreeError::Corruption(_))
        ));
        assert!(tree.is_halted());
        assert!(matches!(tree.get(&stat(0).key()), Err(StreeError::Corruption(_))));
        assert!(matches!(tree.items(), Err(StreeError::Corruption(_))));
        assert!(matches!(tree.verify(), Err(StreeError::Corruption(_))));
        assert!(matches!(
            tree.insert_item(stat(3)),
            Err(StreeError::Corruption(_))
        ));
        assert!(matches!(
            tree.delete_item(&stat(2).key()),
            Err(StreeError::Corruption(_))
        ));
        tree.inspect(|state| {
            for block in &blocks {
                assert!(state.arena.contains(*block), "lost {block}");
            }
        });
        Ok(())
    }

    #[test]
    fn replanning_after_a_bare_generation_bump_gives_the_same_plan() -> Result<()> {
        let tree = loaded()?;
        let next = stat(41);
        let generation = tree.generation();
        let (path, first) = {
            let state = tree.state.read();
            let found = search_by_key(&state.arena, state.root, &next.key(), generation)?;
            let tb = fix_nodes(
                &state.arena,
                &found.path,
                Operation::Insert(next.clone()),
                &tree.context(generation),
            )?;
            (found.path, tb.levels().to_vec())
        };
        let allocated = tree.allocated_blocks();

        tree.state.write_at(generation)?.mark_dirty();
        let current = tree.generation();
        assert_eq!(current, generation + 1);
        let stale = tree.inspect(|state| {
            fix_nodes(
                &state.arena,
                &path,
                Operation::Insert(next.clone()),
                &tree.context(current),
            )
            .map(|_| ())
        });
        assert!(matches!(stale, Err(StreeError::RepeatSearch)));
        assert_eq!(tree.allocated_blocks(), allocated);

        let again = tree.plan(&next.key(), Operation::Insert(next.clone()))?;
        assert_eq!(again.levels(), first.as_slice());
        assert_eq!(again.generation(), current);
        drop(again);

        tree.insert_item(next.clone())?;
        assert_eq!(tree.get(&next.key())?, Some(next));
        tree.verify()?;
        Ok(())
    }
}
