#![forbid(unsafe_code)]
#![allow(dead_code)]

use cowfs_block::Buffer;
use cowfs_btree::{
    Diagnostics, KeyFamily, Node, ObjectStore, Query, QueryFlags, SearchResult, TreeRoot,
    create_tree, insert, query, remove, replace,
};
use cowfs_error::{FsError, Result};
use cowfs_ondisk::ObjectHeader;
use cowfs_types::{BlockNumber, OBJECT_TYPE_BTREE_NODE, ObjectId, StorageClass, Xid};
use parking_lot::Mutex;
use std::collections::HashMap;

/// In-memory object store: every block stays resident, virtual ids resolve
/// through a plain map, and `commit` closes the current transaction.
pub struct TestStore {
    block_size: usize,
    xid: Mutex<Xid>,
    next_block: Mutex<u64>,
    next_oid: Mutex<u64>,
    blocks: Mutex<HashMap<BlockNumber, Buffer>>,
    omap: Mutex<HashMap<ObjectId, BlockNumber>>,
    pub freed: Mutex<Vec<BlockNumber>>,
    pub relocations: Mutex<Vec<(ObjectId, ObjectId)>>,
    diagnostics: Diagnostics,
}

impl TestStore {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            xid: Mutex::new(Xid(1)),
            next_block: Mutex::new(16),
            next_oid: Mutex::new(1024),
            blocks: Mutex::new(HashMap::new()),
            omap: Mutex::new(HashMap::new()),
            freed: Mutex::new(Vec::new()),
            relocations: Mutex::new(Vec::new()),
            diagnostics: Diagnostics::new(),
        }
    }

    /// Seal every joined block and start a new transaction.
    pub fn commit(&self) {
        for buf in self.blocks.lock().values() {
            buf.set_in_transaction(false);
        }
        let mut xid = self.xid.lock();
        *xid = xid.next();
    }

    pub fn block(&self, block: BlockNumber) -> Buffer {
        self.blocks.lock().get(&block).cloned().expect("block exists")
    }

    pub fn resolve(&self, oid: ObjectId, storage: StorageClass) -> Result<BlockNumber> {
        match storage {
            StorageClass::Physical => Ok(BlockNumber(oid.0)),
            _ => self
                .omap
                .lock()
                .get(&oid)
                .copied()
                .ok_or_else(|| FsError::corruption(oid.0, "unmapped virtual object")),
        }
    }

    pub fn live_virtual_objects(&self) -> usize {
        self.omap.lock().len()
    }

    fn alloc(&self) -> BlockNumber {
        let mut next = self.next_block.lock();
        let block = BlockNumber(*next);
        *next += 1;
        block
    }

    fn install(&self, buf: &Buffer) {
        self.blocks.lock().insert(buf.block(), buf.clone());
    }
}

impl ObjectStore for TestStore {
    fn xid(&self) -> Xid {
        *self.xid.lock()
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_node(&self, oid: ObjectId, storage: StorageClass, write: bool) -> Result<Node> {
        let block = self.resolve(oid, storage)?;
        let buf = self
            .blocks
            .lock()
            .get(&block)
            .cloned()
            .ok_or_else(|| FsError::corruption(block.0, "block never written"))?;
        if !write || buf.in_transaction() {
            return Node::parse(buf);
        }

        let target = self.alloc();
        let copy = Buffer::detached(target, buf.to_vec());
        let new_oid = if storage == StorageClass::Physical {
            ObjectId(target.0)
        } else {
            oid
        };
        {
            let mut data = copy.write();
            let mut hdr = ObjectHeader::parse(&data).expect("header");
            hdr.oid = new_oid;
            hdr.xid = self.xid();
            hdr.write(&mut data).expect("header");
        }
        copy.set_in_transaction(true);
        self.install(&copy);
        if storage != StorageClass::Physical {
            self.omap.lock().insert(oid, target);
        }
        self.freed.lock().push(block);
        Node::parse(copy)
    }

    fn read_object_block(&self, block: BlockNumber, _write: bool) -> Result<Buffer> {
        Ok(self.block(block))
    }

    fn create_node(&self, storage: StorageClass, subtype: u32) -> Result<Buffer> {
        let block = self.alloc();
        let oid = if storage == StorageClass::Physical {
            ObjectId(block.0)
        } else {
            let mut next = self.next_oid.lock();
            let oid = ObjectId(*next);
            *next += 1;
            oid
        };
        let buf = Buffer::detached(block, vec![0_u8; self.block_size]);
        {
            let mut data = buf.write();
            ObjectHeader {
                cksum: 0,
                oid,
                xid: self.xid(),
                obj_type: OBJECT_TYPE_BTREE_NODE | storage.type_flags(),
                subtype,
            }
            .write(&mut data)
            .expect("header");
        }
        buf.set_in_transaction(true);
        self.install(&buf);
        if storage != StorageClass::Physical {
            self.omap.lock().insert(oid, block);
        }
        Ok(buf)
    }

    fn delete_node(&self, node: &Node) -> Result<()> {
        if node.storage() != StorageClass::Physical {
            self.omap.lock().remove(&node.oid());
        }
        self.freed.lock().push(node.block());
        Ok(())
    }

    fn root_relocated(&self, old: ObjectId, new: ObjectId) -> Result<()> {
        self.relocations.lock().push((old, new));
        Ok(())
    }

    fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }
}

// ── Record helpers ──────────────────────────────────────────────────────────

/// A tree and the store it lives in, with map-like helpers.
pub struct Tree<'a> {
    pub store: &'a TestStore,
    pub root: TreeRoot,
    pub family: KeyFamily,
}

impl<'a> Tree<'a> {
    pub fn create(store: &'a TestStore, storage: StorageClass, family: KeyFamily) -> Self {
        let root = create_tree(store, storage, family).expect("create tree");
        Self {
            store,
            root,
            family,
        }
    }

    fn exact(&self, key: &[u8]) -> (Query, SearchResult) {
        let mut q = Query::new(self.root, self.family, key.to_vec(), QueryFlags::EXACT);
        let found = query(self.store, &mut q).expect("query");
        (q, found)
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let (q, found) = self.exact(key);
        (found == SearchResult::Found).then(|| q.current_value().expect("value"))
    }

    pub fn try_insert(&mut self, key: &[u8], val: &[u8]) -> Result<()> {
        let (mut q, found) = self.exact(key);
        if found == SearchResult::Found {
            return Err(FsError::Exists);
        }
        insert(self.store, &mut q, key, val)?;
        self.root = q.root;
        Ok(())
    }

    pub fn insert(&mut self, key: &[u8], val: &[u8]) {
        self.try_insert(key, val).expect("insert");
    }

    pub fn remove(&mut self, key: &[u8]) -> bool {
        let (mut q, found) = self.exact(key);
        if found == SearchResult::NotFound {
            return false;
        }
        remove(self.store, &mut q).expect("remove");
        self.root = q.root;
        true
    }

    pub fn set(&mut self, key: &[u8], val: &[u8]) {
        let (mut q, found) = self.exact(key);
        assert_eq!(found, SearchResult::Found, "set of a missing key");
        replace(self.store, &mut q, None, Some(val)).expect("replace");
        self.root = q.root;
    }

    pub fn rename(&mut self, key: &[u8], new_key: &[u8]) {
        let (mut q, found) = self.exact(key);
        assert_eq!(found, SearchResult::Found, "rename of a missing key");
        replace(self.store, &mut q, Some(new_key), None).expect("replace");
        self.root = q.root;
    }

    pub fn records(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        cowfs_btree::collect_records(self.store, self.root).expect("walk")
    }

    pub fn verify(&self) -> cowfs_btree::TreeStats {
        cowfs_btree::verify_tree(self.store, self.root).expect("verify")
    }

    pub fn root_node(&self) -> Node {
        self.store
            .read_node(self.root.oid, self.root.storage, false)
            .expect("root")
    }
}

pub fn be_key(n: u64) -> Vec<u8> {
    n.to_be_bytes().to_vec()
}
