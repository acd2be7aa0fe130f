#![forbid(unsafe_code)]

mod common;

use common::PhysStore;
use cowfs_error::FsError;
use cowfs_object::ObjectMap;
use cowfs_types::{BlockNumber, OBJ_VIRTUAL, OBJECT_TYPE_BTREE_NODE, ObjectId, Xid};
use proptest::prelude::*;
use std::collections::BTreeMap;

fn oid(n: u64) -> ObjectId {
    ObjectId(n)
}

#[test]
fn exact_lookup_requires_matching_xid() {
    let store = PhysStore::new(4096);
    let mut map = ObjectMap::create(&store).unwrap();
    assert!(map.create_record(&store, oid(1030), Xid(4), BlockNumber(700)).unwrap());
    assert!(map.create_record(&store, oid(1031), Xid(4), BlockNumber(701)).unwrap());

    let val = map.lookup(&store, oid(1030), Xid(4)).unwrap().unwrap();
    assert_eq!(val.paddr, BlockNumber(700));
    assert_eq!(val.size, 4096);
    assert_eq!(map.lookup(&store, oid(1030), Xid(5)).unwrap(), None);
    assert_eq!(map.lookup(&store, oid(1032), Xid(4)).unwrap(), None);
    assert_eq!(
        map.lookup_block(&store, oid(1031), Xid(4), false).unwrap(),
        Some(BlockNumber(701))
    );
}

#[test]
fn create_leaves_existing_record_alone() {
    let store = PhysStore::new(4096);
    let mut map = ObjectMap::create(&store).unwrap();
    assert!(map.create_record(&store, oid(1024), Xid(1), BlockNumber(50)).unwrap());
    assert!(!map.create_record(&store, oid(1024), Xid(1), BlockNumber(99)).unwrap());
    let val = map.lookup(&store, oid(1024), Xid(1)).unwrap().unwrap();
    assert_eq!(val.paddr, BlockNumber(50));
    assert_eq!(map.records(&store).unwrap().len(), 1);
}

#[test]
fn deleting_a_missing_record_is_corruption() {
    let store = PhysStore::new(4096);
    let mut map = ObjectMap::create(&store).unwrap();
    map.create_record(&store, oid(1024), Xid(1), BlockNumber(50)).unwrap();
    let err = map.delete_record(&store, oid(1024), Xid(2)).unwrap_err();
    assert!(matches!(err, FsError::Corruption { .. }));

    map.delete_record(&store, oid(1024), Xid(1)).unwrap();
    assert_eq!(map.lookup(&store, oid(1024), Xid(1)).unwrap(), None);
    assert!(map.records(&store).unwrap().is_empty());
}

#[test]
fn latest_version_not_after_the_limit() {
    let store = PhysStore::new(4096);
    let mut map = ObjectMap::create(&store).unwrap();
    for (xid, block) in [(2, 200), (5, 500), (9, 900)] {
        map.create_record(&store, oid(10), Xid(xid), BlockNumber(block)).unwrap();
    }
    map.create_record(&store, oid(9), Xid(20), BlockNumber(1)).unwrap();
    map.create_record(&store, oid(12), Xid(1), BlockNumber(2)).unwrap();

    let hit = map.lookup_latest(&store, oid(10), Xid(7)).unwrap().unwrap();
    assert_eq!(hit.key.xid, Xid(5));
    assert_eq!(hit.val.paddr, BlockNumber(500));

    let newest = map.lookup_latest(&store, oid(10), Xid(u64::MAX)).unwrap().unwrap();
    assert_eq!(newest.key.xid, Xid(9));
    assert_eq!(
        map.lookup_latest(&store, oid(10), Xid(9)).unwrap().unwrap().key.xid,
        Xid(9)
    );

    assert_eq!(map.lookup_latest(&store, oid(10), Xid(1)).unwrap(), None);
    assert_eq!(map.lookup_latest(&store, oid(11), Xid(50)).unwrap(), None);
    assert_eq!(map.lookup_latest(&store, oid(3), Xid(50)).unwrap(), None);
}

#[test]
fn write_lookup_repoints_the_record() {
    let store = PhysStore::new(4096);
    let mut map = ObjectMap::create(&store).unwrap();
    store.put_object(BlockNumber(5000), OBJECT_TYPE_BTREE_NODE | OBJ_VIRTUAL);
    map.create_record(&store, oid(1024), Xid(1), BlockNumber(5000)).unwrap();
    store.commit();

    let old_root = map.root();
    let moved = map
        .lookup_block(&store, oid(1024), Xid(1), true)
        .unwrap()
        .unwrap();
    assert_ne!(moved, BlockNumber(5000));
    assert!(store.freed.lock().contains(&BlockNumber(5000)));
    assert_ne!(map.root(), old_root, "the omap root is physical and moves too");
    assert_eq!(*store.relocations.lock(), vec![(ObjectId(old_root.0), ObjectId(map.root().0))]);

    let val = map.lookup(&store, oid(1024), Xid(1)).unwrap().unwrap();
    assert_eq!(val.paddr, moved);

    // Already part of the transaction: nothing moves again.
    let again = map
        .lookup_block(&store, oid(1024), Xid(1), true)
        .unwrap()
        .unwrap();
    assert_eq!(again, moved);
    assert_eq!(store.relocations.lock().len(), 1);

    // The committed map still points at the old copy.
    let old = ObjectMap::open(old_root);
    assert_eq!(
        old.lookup(&store, oid(1024), Xid(1)).unwrap().unwrap().paddr,
        BlockNumber(5000)
    );
}

#[test]
fn write_lookup_of_missing_record_is_none() {
    let store = PhysStore::new(4096);
    let mut map = ObjectMap::create(&store).unwrap();
    assert_eq!(map.lookup_block(&store, oid(1024), Xid(1), true).unwrap(), None);
}

#[test]
fn many_records_stay_ordered() {
    let store = PhysStore::new(1024);
    let mut map = ObjectMap::create(&store).unwrap();
    for n in (0..300_u64).rev() {
        map.create_record(&store, oid(2000 + n % 100), Xid(1 + n / 100), BlockNumber(n))
            .unwrap();
        if n % 64 == 0 {
            store.commit();
        }
    }
    let records = map.records(&store).unwrap();
    assert_eq!(records.len(), 300);
    for pair in records.windows(2) {
        assert_eq!(pair[0].key.compare(&pair[1].key, false), std::cmp::Ordering::Less);
    }
    let stats = cowfs_btree::verify_tree(&store, map.tree()).unwrap();
    assert!(stats.depth >= 2);
    assert_eq!(stats.records, 300);
}

#[derive(Debug, Clone)]
enum Op {
    Create(u8, u8),
    Delete(u8, u8),
    Commit,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0_u8..24, 1_u8..8).prop_map(|(o, x)| Op::Create(o, x)),
        2 => (0_u8..24, 1_u8..8).prop_map(|(o, x)| Op::Delete(o, x)),
        1 => Just(Op::Commit),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn object_map_matches_model(ops in proptest::collection::vec(op_strategy(), 1..200)) {
        let store = PhysStore::new(1024);
        let mut map = ObjectMap::create(&store).unwrap();
        let mut model = BTreeMap::<(u64, u64), u64>::new();
        let mut next_block = 10_000_u64;

        for op in ops {
            match op {
                Op::Create(o, x) => {
                    let key = (1024 + u64::from(o), u64::from(x));
                    next_block += 1;
                    let created = map
                        .create_record(&store, ObjectId(key.0), Xid(key.1), BlockNumber(next_block))
                        .unwrap();
                    prop_assert_eq!(created, !model.contains_key(&key));
                    model.entry(key).or_insert(next_block);
                }
                Op::Delete(o, x) => {
                    let key = (1024 + u64::from(o), u64::from(x));
                    let result = map.delete_record(&store, ObjectId(key.0), Xid(key.1));
                    prop_assert_eq!(result.is_ok(), model.remove(&key).is_some());
                }
                Op::Commit => store.commit(),
            }
        }

        let records: Vec<((u64, u64), u64)> = map
            .records(&store)
            .unwrap()
            .into_iter()
            .map(|r| ((r.key.oid.0, r.key.xid.0), r.val.paddr.0))
            .collect();
        let expected: Vec<((u64, u64), u64)> = model.clone().into_iter().collect();
        prop_assert_eq!(records, expected);

        for o in 0..24_u64 {
            for limit in [0_u64, 3, 8] {
                let want = model
                    .range((1024 + o, 0)..=(1024 + o, limit))
                    .next_back()
                    .map(|(&(_, x), &b)| (x, b));
                let got = map
                    .lookup_latest(&store, ObjectId(1024 + o), Xid(limit))
                    .unwrap()
                    .map(|r| (r.key.xid.0, r.val.paddr.0));
                prop_assert_eq!(got, want);
            }
        }
    }
}
