#![allow(missing_docs)]

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use stree::types::{ItemKind, Key, Result};
use stree::{Item, STree, TreeOptions};

const NUM_THREADS: usize = 8;
const OBJECTS_PER_THREAD: u32 = 400;

fn shared_tree() -> Result<Arc<STree>> {
    let opts = TreeOptions {
        block_size: 512,
        block_head_size: 16,
        max_restarts: 10_000,
        ..TreeOptions::default()
    };
    Ok(Arc::new(STree::new(opts)?))
}

fn item(object: u32) -> Item {
    Item::new(
        Key::new(1, object, 0, ItemKind::Direct),
        vec![object as u8; 8 + (object % 48) as usize],
    )
}

#[test]
fn concurrent_writers_on_disjoint_keys() -> Result<()> {
    let tree = shared_tree()?;
    let barrier = Arc::new(Barrier::new(NUM_THREADS));
    let mut handles = Vec::new();

    for thread_id in 0..NUM_THREADS {
        let tree = Arc::clone(&tree);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || -> Result<Vec<u32>> {
            let mut rng = ChaCha8Rng::seed_from_u64(thread_id as u64);
            let base = thread_id as u32 * OBJECTS_PER_THREAD;
            let mut objects: Vec<u32> = (base..base + OBJECTS_PER_THREAD).collect();
            objects.shuffle(&mut rng);
            barrier.wait();
            for &object in &objects {
                tree.insert_item(item(object))?;
            }
            // Every odd object goes away again.
            let mut kept = Vec::new();
            for &object in &objects {
                if object % 2 == 1 {
                    tree.delete_item(&item(object).key())?;
                } else {
                    kept.push(object);
                }
            }
            Ok(kept)
        }));
    }

    let mut expected = Vec::new();
    for handle in handles {
        expected.extend(handle.join().unwrap()?);
    }
    expected.sort_unstable();

    let summary = tree.verify()?;
    assert_eq!(summary.items, expected.len());
    let stored: Vec<Item> = tree.items()?;
    let wanted: Vec<Item> = expected.into_iter().map(item).collect();
    assert_eq!(stored, wanted);
    assert_eq!(tree.allocated_blocks(), summary.nodes as u64);
    Ok(())
}

#[test]
fn readers_see_consistent_items_during_writes() -> Result<()> {
    let tree = shared_tree()?;
    for object in (0..2_000).step_by(2) {
        tree.insert_item(item(object))?;
    }
    let stop = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|reader| {
            let tree = Arc::clone(&tree);
            let stop = Arc::clone(&stop);
            thread::spawn(move || -> Result<u64> {
                let mut rng = ChaCha8Rng::seed_from_u64(100 + reader);
                let mut hits = 0;
                while !stop.load(Ordering::Acquire) {
                    // Even objects are never touched by the writer.
                    let object = rng.gen_range(0..1_000) * 2;
                    let found = tree.get(&item(object).key())?;
                    assert_eq!(found, Some(item(object)));
                    hits += 1;
                }
                Ok(hits)
            })
        })
        .collect();

    let writer = {
        let tree = Arc::clone(&tree);
        thread::spawn(move || -> Result<()> {
            for round in 0..3 {
                for object in (1..2_000).step_by(2) {
                    if round % 2 == 0 {
                        tree.insert_item(item(object))?;
                    } else {
                        tree.delete_item(&item(object).key())?;
                    }
                }
            }
            Ok(())
        })
    };

    writer.join().unwrap()?;
    stop.store(true, Ordering::Release);
    for reader in readers {
        assert!(reader.join().unwrap()? > 0);
    }

    let summary = tree.verify()?;
    assert_eq!(summary.items, 2_000);
    assert!(tree.lock_snapshot().generation >= 4_000);
    Ok(())
}

#[test]
fn competing_inserts_of_one_key_admit_exactly_one() -> Result<()> {
    let tree = shared_tree()?;
    for object in 0..500 {
        tree.insert_item(item(object * 3))?;
    }
    let barrier = Arc::new(Barrier::new(NUM_THREADS));
    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|_| {
            let tree = Arc::clone(&tree);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                (0..200u32)
                    .filter(|object| tree.insert_item(item(object * 3 + 1)).is_ok())
                    .count()
            })
        })
        .collect();
    let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(admitted, 200);
    let summary = tree.verify()?;
    assert_eq!(summary.items, 700);
    Ok(())
}
