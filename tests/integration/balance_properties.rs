#![allow(missing_docs)]

use proptest::prelude::*;
use std::collections::BTreeMap;

use stree::storage::stree::{Cut, Operation};
use stree::types::{ItemKind, Key};
use stree::{Item, STree, StreeError, TreeOptions};

fn layout(block_size: usize, flow: bool) -> TreeOptions {
    let mut opts = TreeOptions {
        block_size,
        block_head_size: 16,
        ..TreeOptions::default()
    };
    if !flow {
        opts.flow_kinds.clear();
    }
    opts
}

fn kind_for(object: u32) -> ItemKind {
    match object % 3 {
        0 => ItemKind::Directory,
        1 => ItemKind::Indirect,
        _ => ItemKind::Direct,
    }
}

fn body_for(object: u32, units: usize) -> Vec<u8> {
    let unit = kind_for(object).unit_len().unwrap_or(1);
    (0..units * unit).map(|i| (object as usize + i) as u8).collect()
}

/// Removes every piece of `object`, however it was split.
fn delete_object(tree: &STree, object: u32) -> stree::Result<()> {
    let keys: Vec<Key> = tree
        .items()?
        .iter()
        .map(Item::key)
        .filter(|key| key.object_id == object)
        .collect();
    for key in keys {
        tree.delete_item(&key)?;
    }
    Ok(())
}

fn object_bodies(tree: &STree) -> BTreeMap<u32, Vec<u8>> {
    let mut bodies: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
    for item in tree.items().unwrap() {
        bodies
            .entry(item.key().object_id)
            .or_default()
            .extend_from_slice(&item.body);
    }
    bodies
}

#[derive(Clone, Debug)]
enum Op {
    Insert { object: u32, units: usize },
    Remove { object: u32 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u32..96, 1usize..12).prop_map(|(object, units)| Op::Insert { object, units }),
        1 => (0u32..96).prop_map(|object| Op::Remove { object }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_objects_survive_any_split(
        ops in prop::collection::vec(op_strategy(), 1..200),
        block_size in prop_oneof![Just(256usize), Just(512), Just(1024)],
        flow in any::<bool>(),
    ) {
        let tree = STree::new(layout(block_size, flow)).unwrap();
        let mut reference: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
        for op in ops {
            match op {
                Op::Insert { object, units } => {
                    if reference.contains_key(&object) {
                        continue;
                    }
                    let body = body_for(object, units);
                    let item = Item::new(Key::new(1, object, 0, kind_for(object)), body.clone());
                    tree.insert_item(item).unwrap();
                    reference.insert(object, body);
                }
                Op::Remove { object } => {
                    delete_object(&tree, object).unwrap();
                    reference.remove(&object);
                }
            }
            tree.verify().unwrap();
        }
        prop_assert_eq!(object_bodies(&tree), reference);
    }

    #[test]
    fn prop_planning_never_changes_the_tree(
        objects in prop::collection::btree_set(0u32..400, 1..120),
        planned in 400u32..800,
        units in 1usize..40,
    ) {
        let tree = STree::new(layout(256, true)).unwrap();
        for &object in &objects {
            tree.insert_item(Item::new(
                Key::new(1, object, 0, ItemKind::Direct),
                body_for(2, 8),
            ))
            .unwrap();
        }
        let before = tree.items().unwrap();
        let generation = tree.generation();
        let allocated = tree.allocated_blocks();

        let item = Item::new(Key::new(1, planned, 0, ItemKind::Indirect), body_for(1, units));
        let tb = tree.plan(&item.key(), Operation::Insert(item)).unwrap();
        let leaf = tb.level(0).unwrap();
        prop_assert!(leaf.blknum >= 1 && leaf.blknum <= 3);
        prop_assert_eq!(leaf.splits.len(), leaf.blknum - 1);
        prop_assert!(leaf.splits.windows(2).all(|pair| pair[0] < pair[1]));
        prop_assert!(leaf.splits.iter().all(|cut| *cut > Cut::START));
        prop_assert_eq!(tree.allocated_blocks(), allocated + tb.reserved() as u64);
        drop(tb);

        prop_assert_eq!(tree.allocated_blocks(), allocated);
        prop_assert_eq!(tree.generation(), generation);
        prop_assert_eq!(tree.items().unwrap(), before);
    }

    #[test]
    fn prop_rejected_edits_leave_no_trace(
        objects in prop::collection::btree_set(0u32..200, 1..80),
        missing in 200u32..400,
    ) {
        let tree = STree::new(layout(512, true)).unwrap();
        for &object in &objects {
            tree.insert_item(Item::new(
                Key::new(1, object, 0, ItemKind::StatData),
                vec![0; 16],
            ))
            .unwrap();
        }
        let generation = tree.generation();
        let present = Key::new(1, *objects.iter().next().unwrap(), 0, ItemKind::StatData);
        let absent = Key::new(1, missing, 0, ItemKind::Direct);

        prop_assert!(matches!(
            tree.insert_item(Item::new(present, vec![1; 16])),
            Err(StreeError::ItemExists)
        ));
        prop_assert!(matches!(tree.delete_item(&absent), Err(StreeError::NotFound)));
        prop_assert!(matches!(
            tree.paste_into_item(&present, 0, &[1]),
            Err(StreeError::Invalid(_))
        ));
        prop_assert!(matches!(
            tree.cut_from_item(&absent, 0, 1),
            Err(StreeError::NotFound)
        ));
        prop_assert_eq!(tree.generation(), generation);
        tree.verify().unwrap();
    }
}
