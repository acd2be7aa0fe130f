#![forbid(unsafe_code)]

mod common;

use common::{BLOCKS, formatted, insert_inodes, inode_key, value};
use cowfs_block::{ByteBlockDevice, FileByteDevice, MemBlockDevice};
use cowfs_btree::{KeyFamily, verify_tree};
use cowfs_core::{Catalog, Container, ContainerOptions, FormatOptions};
use cowfs_error::FsError;
use cowfs_types::{BlockNumber, FIRST_USER_OID, ObjectId, StorageClass, Xid};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Superblock, descriptor ring and data ring with default format options.
const FIXED_BLOCKS: u64 = 1 + 4 + 32;

// ── Format / open ───────────────────────────────────────────────────────────

#[test]
fn format_writes_empty_object_map_and_catalog() {
    let (_dev, fs) = formatted();
    let sb = fs.superblock();
    assert_eq!(sb.next_xid, Xid(2));
    assert_eq!(sb.catalog_root, ObjectId(FIRST_USER_OID));
    assert!(fs.is_block_used(sb.omap_root));

    let report = fs.verify().unwrap();
    assert_eq!(report.xid, Xid(1));
    assert_eq!(report.catalog.records, 0);
    assert_eq!(report.object_map.records, 1);
    assert_eq!(report.total_blocks, BLOCKS);
    assert_eq!(report.free_blocks, BLOCKS - FIXED_BLOCKS - 2);
    assert!(fs.diagnostics().is_empty());
}

#[test]
fn format_rejects_geometry_that_does_not_fit() {
    let dev = Arc::new(MemBlockDevice::new(4096, 512));
    let opts = FormatOptions {
        block_size: 1024,
        ..FormatOptions::default()
    };
    let err = Container::format(dev, &opts).unwrap_err();
    assert!(matches!(err, FsError::Format(_)));

    let tiny = Arc::new(MemBlockDevice::new(4096, 40));
    assert!(Container::format(tiny, &FormatOptions::default()).is_err());
}

#[test]
fn open_of_blank_device_fails() {
    let dev = Arc::new(MemBlockDevice::new(4096, 512));
    assert!(Container::open(dev).is_err());
}

#[test]
fn reopen_sees_committed_records_and_free_space() {
    let (dev, fs) = formatted();
    insert_inodes(&fs, 0..300, 64);
    let free = fs.free_blocks();
    let sb = fs.superblock();
    drop(fs);

    let fs = Container::open(dev).unwrap();
    assert_eq!(fs.superblock(), sb);
    assert_eq!(fs.free_blocks(), free);

    let session = fs.read();
    let catalog = session.catalog();
    for id in 0..300 {
        assert_eq!(catalog.get(&inode_key(id)).unwrap(), Some(value(id, 64)), "id {id}");
    }
    assert_eq!(catalog.get(&inode_key(300)).unwrap(), None);
    drop(session);

    let report = fs.verify().unwrap();
    assert_eq!(report.catalog.records, 300);
    assert!(report.catalog.depth >= 2);
}

#[test]
fn check_nodes_flag_forces_checksum_verification() {
    let dev = Arc::new(MemBlockDevice::new(4096, 512));
    let opts = FormatOptions {
        check_nodes: true,
        ..FormatOptions::default()
    };
    drop(Container::format(dev.clone(), &opts).unwrap());

    let relaxed = ContainerOptions {
        verify_checksums: false,
        ..ContainerOptions::default()
    };
    let fs = Container::open_with_options(dev, relaxed).unwrap();
    assert!(fs.verifies_checksums());
}

#[test]
fn file_backed_container_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("container.img");
    let len = BLOCKS * 4096;

    let file = FileByteDevice::create(&path, len).unwrap();
    let dev = Arc::new(ByteBlockDevice::new(file, 4096).unwrap());
    let fs = Container::format(dev, &FormatOptions::default()).unwrap();
    insert_inodes(&fs, 0..50, 100);
    drop(fs);

    let file = FileByteDevice::open(&path).unwrap();
    let dev = Arc::new(ByteBlockDevice::new(file, 4096).unwrap());
    let fs = Container::open(dev).unwrap();
    let session = fs.read();
    assert_eq!(session.catalog().records().unwrap().len(), 50);
    assert_eq!(session.catalog().get(&inode_key(7)).unwrap(), Some(value(7, 100)));
}

// ── Copy-on-write ───────────────────────────────────────────────────────────

#[test]
fn commit_relocates_nodes_and_keeps_the_omap_key() {
    let (dev, fs) = formatted();
    let session = fs.read();
    let before = session.object_map().records(&session).unwrap();
    drop(session);
    assert_eq!(before.len(), 1);
    let old_catalog = before[0].val.paddr;
    let old_omap_root = fs.superblock().omap_root;
    let old_bytes = dev.snapshot(old_catalog);

    let txn = fs.begin().unwrap();
    txn.catalog().insert(&inode_key(1), b"one").unwrap();
    let summary = txn.commit().unwrap();
    assert_eq!(summary.xid, Xid(2));
    assert_eq!(summary.allocated, 2);
    assert_eq!(summary.reclaimed, 2);

    let session = fs.read();
    let after = session.object_map().records(&session).unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].key, before[0].key);
    assert_ne!(after[0].val.paddr, old_catalog);
    assert_ne!(session.superblock().omap_root, old_omap_root);
    assert_eq!(session.superblock().next_xid, Xid(3));
    drop(session);

    // The old versions were never written, only released.
    assert_eq!(dev.snapshot(old_catalog), old_bytes);
    assert!(!fs.is_block_used(old_catalog));
    assert!(!fs.is_block_used(old_omap_root));
}

#[test]
fn read_session_refuses_to_write() {
    let (_dev, fs) = formatted();
    let session = fs.read();
    let mut catalog = session.catalog();
    let err = catalog.insert(&inode_key(1), b"x").unwrap_err();
    assert!(matches!(err, FsError::ReadOnly));
}

// ── Abort ───────────────────────────────────────────────────────────────────

#[test]
fn abort_restores_the_committed_state() {
    let (dev, fs) = formatted();
    insert_inodes(&fs, 0..10, 64);
    let sb = fs.superblock();
    let free = fs.free_blocks();
    let writes = dev.write_count();

    let txn = fs.begin().unwrap();
    let mut catalog = txn.catalog();
    for id in 10..400 {
        catalog.insert(&inode_key(id), &value(id, 64)).unwrap();
    }
    assert_eq!(catalog.get(&inode_key(399)).unwrap(), Some(value(399, 64)));
    drop(catalog);
    let summary = txn.abort().unwrap();
    assert!(summary.allocated > 2);

    assert_eq!(fs.superblock(), sb);
    assert_eq!(fs.free_blocks(), free);
    assert_eq!(dev.write_count(), writes);

    let session = fs.read();
    assert_eq!(session.catalog().get(&inode_key(399)).unwrap(), None);
    assert_eq!(session.catalog().get(&inode_key(5)).unwrap(), Some(value(5, 64)));
    drop(session);
    assert_eq!(fs.verify().unwrap().catalog.records, 10);
}

#[test]
fn dropping_a_transaction_aborts_it() {
    let (_dev, fs) = formatted();
    let free = fs.free_blocks();
    {
        let txn = fs.begin().unwrap();
        txn.catalog().insert(&inode_key(9), b"nine").unwrap();
    }
    assert_eq!(fs.free_blocks(), free);
    assert_eq!(fs.read().catalog().get(&inode_key(9)).unwrap(), None);

    // The lock was released with the dropped transaction.
    insert_inodes(&fs, [9], 4);
    assert_eq!(fs.read().catalog().get(&inode_key(9)).unwrap(), Some(value(9, 4)));
}

// ── Checksums ───────────────────────────────────────────────────────────────

#[test]
fn corrupted_node_reports_bad_checksum() {
    let (dev, fs) = formatted();
    insert_inodes(&fs, 0..5, 64);
    let session = fs.read();
    let catalog_block = session.object_map().records(&session).unwrap()[0].val.paddr;
    drop(session);
    drop(fs);

    let mut raw = dev.snapshot(catalog_block);
    raw[200] ^= 0xA5;
    dev.poke(catalog_block, raw);

    let fs = Container::open(dev).unwrap();
    let err = fs.read().catalog().get(&inode_key(1)).unwrap_err();
    assert!(
        matches!(err, FsError::BadChecksum { block } if block == catalog_block.0),
        "{err}"
    );
}

#[test]
fn corrupted_superblock_is_rejected() {
    let (dev, fs) = formatted();
    drop(fs);
    let mut raw = dev.snapshot(BlockNumber(0));
    raw[64] ^= 1;
    dev.poke(BlockNumber(0), raw);
    let err = Container::open(dev).unwrap_err();
    assert!(matches!(err, FsError::BadChecksum { block: 0 }));
}

// ── Concurrency ─────────────────────────────────────────────────────────────

#[test]
fn readers_only_ever_see_whole_transactions() {
    let (_dev, fs) = formatted();
    let done = AtomicBool::new(false);

    std::thread::scope(|s| {
        for _ in 0..3 {
            s.spawn(|| {
                let mut last = 0;
                loop {
                    let finished = done.load(Ordering::Acquire);
                    let session = fs.read();
                    let n = session.catalog().records().unwrap().len();
                    assert_eq!(n % 10, 0, "partial transaction visible");
                    assert!(n >= last);
                    last = n;
                    if finished {
                        break;
                    }
                }
                assert_eq!(last, 200);
            });
        }
        for batch in 0..20_u64 {
            insert_inodes(&fs, batch * 10..(batch + 1) * 10, 32);
        }
        done.store(true, Ordering::Release);
    });
}

// ── Additional trees ────────────────────────────────────────────────────────

#[test]
fn physical_trees_cannot_be_created() {
    let (_dev, fs) = formatted();
    let txn = fs.begin().unwrap();
    let err = txn.create_tree(StorageClass::Physical, KeyFamily::Bytes).unwrap_err();
    assert!(matches!(err, FsError::UnsupportedFeature(_)));
}

#[test]
fn ephemeral_tree_lives_in_the_checkpoint() {
    let (dev, fs) = formatted();
    let txn = fs.begin().unwrap();
    let root = txn.create_tree(StorageClass::Ephemeral, KeyFamily::Catalog).unwrap();
    let mut tree = Catalog::with_root(&txn, root);
    for id in 0..200 {
        tree.insert(&inode_key(id), &value(id, 64)).unwrap();
    }
    drop(tree);
    txn.commit().unwrap();
    drop(fs);

    let fs = Container::open(dev).unwrap();
    let session = fs.read();
    let areas = session.checkpoint();
    let grown = areas.data_len;
    assert!(grown > 2);
    assert_eq!(areas.mappings(&session).unwrap().len(), grown as usize);
    assert_eq!(Catalog::with_root(&session, root).records().unwrap().len(), 200);
    verify_tree(&session, root).unwrap();
    drop(session);

    let txn = fs.begin().unwrap();
    let mut tree = Catalog::with_root(&txn, root);
    for id in 0..150 {
        assert!(tree.delete(&inode_key(id)).unwrap());
    }
    drop(tree);
    txn.commit().unwrap();

    let session = fs.read();
    let areas = session.checkpoint();
    assert!(areas.data_len < grown);
    assert_eq!(areas.mappings(&session).unwrap().len(), areas.data_len as usize);
    let left: Vec<u64> = Catalog::with_root(&session, root)
        .records()
        .unwrap()
        .into_iter()
        .map(|(key, _)| key.id)
        .collect();
    assert_eq!(left, (150..200).collect::<Vec<_>>());
    let stats = verify_tree(&session, root).unwrap();
    assert_eq!(stats.nodes, u64::from(areas.data_len));
}

#[test]
fn verify_report_serializes() {
    let (_dev, fs) = formatted();
    insert_inodes(&fs, 0..20, 16);
    let report = fs.verify().unwrap();
    let json = serde_json::to_value(report).unwrap();
    assert_eq!(json["catalog"]["records"], 20);
    assert_eq!(json["xid"], 2);
}
