#![forbid(unsafe_code)]
#![allow(dead_code)]

use cowfs_block::MemBlockDevice;
use cowfs_core::{Container, FormatOptions};
use cowfs_ondisk::{CatalogKey, CatalogRecordType};
use std::sync::Arc;

pub const BLOCK_SIZE: u32 = 4096;
pub const BLOCKS: u64 = 512;

pub fn device() -> Arc<MemBlockDevice> {
    Arc::new(MemBlockDevice::new(BLOCK_SIZE, BLOCKS))
}

pub fn formatted() -> (Arc<MemBlockDevice>, Container) {
    let dev = device();
    let fs = Container::format(dev.clone(), &FormatOptions::default()).expect("format");
    (dev, fs)
}

pub fn inode_key(id: u64) -> CatalogKey {
    CatalogKey::new(id, CatalogRecordType::Inode)
}

pub fn dirent_key(parent: u64, name: &str) -> CatalogKey {
    CatalogKey::named(parent, CatalogRecordType::DirRec, name.as_bytes())
}

/// Deterministic value of `len` bytes for record `id`.
pub fn value(id: u64, len: usize) -> Vec<u8> {
    (0..len).map(|i| (id as u8).wrapping_add(i as u8)).collect()
}

/// Insert inode records `ids` and commit.
pub fn insert_inodes(fs: &Container, ids: impl IntoIterator<Item = u64>, len: usize) {
    let txn = fs.begin().expect("begin");
    let mut catalog = txn.catalog();
    for id in ids {
        catalog.insert(&inode_key(id), &value(id, len)).expect("insert");
    }
    drop(catalog);
    txn.commit().expect("commit");
}
