#![allow(missing_docs)]

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use stree::primitives::store::{Allocator, MemAllocator};
use stree::types::{BlockId, ItemKind, Key, Result, StreeError};
use stree::{Item, STree, TreeOptions};

const SEED: u64 = 0x5eed_cafe;

fn tiny() -> TreeOptions {
    TreeOptions {
        block_size: 256,
        block_head_size: 16,
        ..TreeOptions::default()
    }
}

fn stat(object: u32) -> Item {
    Item::new(Key::new(1, object, 0, ItemKind::StatData), vec![object as u8; 16])
}

/// Counts every block handed out and returned.
struct CountingAllocator {
    inner: MemAllocator,
    handed_out: AtomicU64,
    returned: AtomicU64,
}

impl CountingAllocator {
    fn new() -> Self {
        Self {
            inner: MemAllocator::new(None),
            handed_out: AtomicU64::new(0),
            returned: AtomicU64::new(0),
        }
    }
}

impl Allocator for CountingAllocator {
    fn allocate_nodes(&self, count: usize) -> Result<Vec<BlockId>> {
        let blocks = self.inner.allocate_nodes(count)?;
        self.handed_out.fetch_add(count as u64, Ordering::Relaxed);
        Ok(blocks)
    }

    fn free_node(&self, block: BlockId) {
        self.returned.fetch_add(1, Ordering::Relaxed);
        self.inner.free_node(block);
    }

    fn allocated(&self) -> u64 {
        self.inner.allocated()
    }
}

#[test]
fn fill_orders_produce_the_same_items() -> Result<()> {
    for order in 0..3 {
        let tree = STree::new(tiny())?;
        let mut objects: Vec<u32> = (0..600).collect();
        match order {
            0 => {}
            1 => objects.reverse(),
            _ => objects.shuffle(&mut ChaCha8Rng::seed_from_u64(SEED)),
        }
        for object in objects {
            tree.insert_item(stat(object))?;
        }
        let summary = tree.verify()?;
        assert_eq!(summary.items, 600);
        assert!(summary.height >= 3);
        assert_eq!(tree.allocated_blocks(), summary.nodes as u64);
        let items = tree.items()?;
        let expected: Vec<Item> = (0..600).map(stat).collect();
        assert_eq!(items, expected);
        let stats = tree.stats().snapshot();
        assert!(stats.leaf_splits > 0);
        assert!(stats.internal_splits > 0);
        assert_eq!(stats.root_grows as usize, summary.height - 1);
    }
    Ok(())
}

#[test]
fn sequential_fill_keeps_leaves_half_full() -> Result<()> {
    let opts = TreeOptions {
        block_size: 1024,
        block_head_size: 16,
        ..TreeOptions::default()
    };
    let capacity = opts.capacity();
    let tree = STree::new(opts)?;
    for object in 0..2_000 {
        tree.insert_item(stat(object))?;
    }
    let summary = tree.verify()?;
    // Every leaf of a sequential fill is at least half full, so the leaf count
    // stays within twice the minimum.
    let minimum = (2_000 * 40 + capacity - 1) / capacity;
    assert!(summary.leaves <= 2 * minimum, "{} leaves", summary.leaves);
    Ok(())
}

#[test]
fn flowing_items_keep_their_bytes_in_order() -> Result<()> {
    let tree = STree::new(tiny())?;
    let mut rng = ChaCha8Rng::seed_from_u64(SEED);
    let mut bodies: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
    let mut objects: Vec<u32> = (0..120).collect();
    objects.shuffle(&mut rng);
    for object in objects {
        let (kind, unit) = if object % 2 == 0 {
            (ItemKind::Directory, 16)
        } else {
            (ItemKind::Indirect, 4)
        };
        let units = rng.gen_range(1..=(200 / unit));
        let body: Vec<u8> = (0..units * unit).map(|_| rng.gen()).collect();
        tree.insert_item(Item::new(Key::new(1, object, 0, kind), body.clone()))?;
        bodies.insert(object, body);
        tree.verify()?;
    }

    let mut rebuilt: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
    let mut next_offset: BTreeMap<u32, u64> = BTreeMap::new();
    for item in tree.items()? {
        let key = item.key();
        let expected = next_offset.entry(key.object_id).or_insert(0);
        assert_eq!(key.offset, *expected, "gap inside object {}", key.object_id);
        *expected += item.units() as u64;
        rebuilt
            .entry(key.object_id)
            .or_default()
            .extend_from_slice(&item.body);
    }
    assert_eq!(rebuilt, bodies);
    Ok(())
}

#[test]
fn draining_returns_every_block() -> Result<()> {
    let allocator = Arc::new(CountingAllocator::new());
    let tree = STree::with_allocator(tiny(), allocator.clone())?;
    let mut rng = ChaCha8Rng::seed_from_u64(SEED);
    let mut objects: Vec<u32> = (0..800).collect();
    objects.shuffle(&mut rng);
    for &object in &objects {
        tree.insert_item(stat(object))?;
    }
    let peak = tree.verify()?.nodes as u64;
    assert_eq!(allocator.allocated(), peak);

    objects.shuffle(&mut rng);
    for object in objects {
        tree.delete_item(&stat(object).key())?;
    }
    let summary = tree.verify()?;
    assert_eq!(summary.height, 1);
    assert_eq!(summary.items, 0);
    assert_eq!(allocator.allocated(), 1);
    assert_eq!(
        allocator.handed_out.load(Ordering::Relaxed) - allocator.returned.load(Ordering::Relaxed),
        1
    );
    let stats = tree.stats().snapshot();
    assert!(stats.internal_merges > 0);
    assert_eq!(stats.root_collapses, stats.root_grows);
    Ok(())
}

#[test]
fn exhausted_allocator_fails_cleanly_and_recovers() -> Result<()> {
    let opts = TreeOptions {
        max_blocks: Some(8),
        ..tiny()
    };
    let tree = STree::new(opts)?;
    let mut stored = Vec::new();
    let mut refused = 0;
    for object in 0..200 {
        match tree.insert_item(stat(object)) {
            Ok(_) => stored.push(stat(object)),
            Err(StreeError::NoDiskSpace) => refused += 1,
            Err(err) => return Err(err),
        }
        tree.verify()?;
    }
    assert!(refused > 0);
    assert!(tree.allocated_blocks() <= 8);
    assert_eq!(tree.items()?, stored);

    for item in stored.drain(..stored.len() / 2) {
        tree.delete_item(&item.key())?;
    }
    tree.verify()?;
    Ok(())
}

#[test]
fn mixed_edits_match_reference_map() -> Result<()> {
    let tree = STree::new(tiny())?;
    let mut rng = ChaCha8Rng::seed_from_u64(SEED ^ 1);
    let mut reference: BTreeMap<Key, Vec<u8>> = BTreeMap::new();
    let max = tiny().max_item_len();
    for step in 0..4_000 {
        let key = Key::new(1, rng.gen_range(0..256), 0, ItemKind::Direct);
        match rng.gen_range(0..10) {
            0..=4 => {
                let body = vec![step as u8; rng.gen_range(1..=max / 2)];
                match tree.insert_item(Item::new(key, body.clone())) {
                    Ok(_) => {
                        reference.insert(key, body);
                    }
                    Err(StreeError::ItemExists) => assert!(reference.contains_key(&key)),
                    Err(err) => return Err(err),
                }
            }
            5 | 6 => match tree.delete_item(&key) {
                Ok(_) => assert!(reference.remove(&key).is_some()),
                Err(StreeError::NotFound) => assert!(!reference.contains_key(&key)),
                Err(err) => return Err(err),
            },
            7 | 8 => {
                let Some(body) = reference.get_mut(&key) else {
                    continue;
                };
                let len = rng.gen_range(1..=24);
                if body.len() + len > max {
                    continue;
                }
                let at = rng.gen_range(0..=body.len());
                tree.paste_into_item(&key, at, &vec![0xEE; len])?;
                body.splice(at..at, std::iter::repeat(0xEE).take(len));
            }
            _ => {
                let Some(body) = reference.get_mut(&key) else {
                    continue;
                };
                if body.len() < 2 {
                    continue;
                }
                let len = rng.gen_range(1..body.len());
                let at = rng.gen_range(0..=body.len() - len);
                tree.cut_from_item(&key, at, len)?;
                body.drain(at..at + len);
            }
        }
        if step % 64 == 0 {
            tree.verify()?;
        }
    }
    tree.verify()?;
    let actual: BTreeMap<Key, Vec<u8>> = tree
        .items()?
        .into_iter()
        .map(|item| (item.key(), item.body))
        .collect();
    assert_eq!(actual, reference);
    Ok(())
}

#[test]
fn unit_pieces_never_overlap_under_random_edits() -> Result<()> {
    let tree = STree::new(tiny())?;
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let max = tiny().max_item_len();
    let kinds = [ItemKind::StatData, ItemKind::Indirect, ItemKind::Directory];
    let slot = |item: &Item| (item.key().object_id, item.key().kind);
    let mut bytes: BTreeMap<(u32, ItemKind), usize> = BTreeMap::new();
    for step in 0..3_000 {
        let items = tree.items()?;
        match rng.gen_range(0..10) {
            0..=4 => {
                let kind = kinds[rng.gen_range(0..kinds.len())];
                let (offset, len) = match kind.unit_len() {
                    Some(unit) => (rng.gen_range(0..400), unit * rng.gen_range(1..=max / unit / 2)),
                    None => (0, 16),
                };
                let item = Item::new(Key::new(1, rng.gen_range(0..8), offset, kind), vec![step as u8; len]);
                let piece = slot(&item);
                match tree.insert_item(item) {
                    Ok(_) => *bytes.entry(piece).or_default() += len,
                    Err(StreeError::Invalid(_) | StreeError::ItemExists) => {}
                    Err(err) => return Err(err),
                }
            }
            5 | 6 => {
                let Some(item) = items.choose(&mut rng) else {
                    continue;
                };
                let Some(unit) = item.key().kind.unit_len() else {
                    continue;
                };
                let len = unit * rng.gen_range(1..=8);
                match tree.paste_into_item(&item.key(), item.len(), &vec![0xEE; len]) {
                    Ok(_) => *bytes.entry(slot(item)).or_default() += len,
                    Err(StreeError::Invalid(_)) => {}
                    Err(err) => return Err(err),
                }
            }
            7 => {
                let Some(item) = items.choose(&mut rng) else {
                    continue;
                };
                let Some(unit) = item.key().kind.unit_len() else {
                    continue;
                };
                let units = item.len() / unit;
                if units < 2 {
                    continue;
                }
                let len = unit * rng.gen_range(1..units);
                tree.cut_from_item(&item.key(), item.len() - len, len)?;
                *bytes.entry(slot(item)).or_default() -= len;
            }
            _ => {
                let Some(item) = items.choose(&mut rng) else {
                    continue;
                };
                tree.delete_item(&item.key())?;
                *bytes.entry(slot(item)).or_default() -= item.len();
            }
        }
        tree.verify()?;
    }
    let mut actual: BTreeMap<(u32, ItemKind), usize> = BTreeMap::new();
    for item in tree.items()? {
        *actual.entry(slot(&item)).or_default() += item.len();
    }
    bytes.retain(|_, len| *len > 0);
    assert_eq!(actual, bytes);
    Ok(())
}
