#![forbid(unsafe_code)]
#![allow(dead_code)]

use cowfs_block::Buffer;
use cowfs_btree::{Diagnostics, Node, ObjectStore};
use cowfs_error::{FsError, Result};
use cowfs_ondisk::ObjectHeader;
use cowfs_types::{
    BlockNumber, OBJ_PHYSICAL, OBJECT_TYPE_BTREE_NODE, OBJECT_TYPE_TEST, ObjectId, StorageClass,
    Xid,
};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Physical-only store: object ids are block numbers, and any block read
/// for writing outside the open transaction is copied to a fresh block.
pub struct PhysStore {
    block_size: usize,
    xid: Mutex<Xid>,
    next_block: Mutex<u64>,
    blocks: Mutex<HashMap<BlockNumber, Buffer>>,
    pub freed: Mutex<Vec<BlockNumber>>,
    pub relocations: Mutex<Vec<(ObjectId, ObjectId)>>,
    diagnostics: Diagnostics,
}

impl PhysStore {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            xid: Mutex::new(Xid(1)),
            next_block: Mutex::new(100),
            blocks: Mutex::new(HashMap::new()),
            freed: Mutex::new(Vec::new()),
            relocations: Mutex::new(Vec::new()),
            diagnostics: Diagnostics::new(),
        }
    }

    pub fn commit(&self) {
        for buf in self.blocks.lock().values() {
            buf.set_in_transaction(false);
        }
        let mut xid = self.xid.lock();
        *xid = xid.next();
    }

    /// Place an object at a fixed block, outside any transaction.
    pub fn put_object(&self, block: BlockNumber, obj_type: u32) -> Buffer {
        let buf = Buffer::detached(block, vec![0_u8; self.block_size]);
        ObjectHeader {
            cksum: 0,
            oid: ObjectId(block.0),
            xid: self.xid(),
            obj_type,
            subtype: OBJECT_TYPE_TEST,
        }
        .write(&mut buf.write())
        .expect("header");
        self.blocks.lock().insert(block, buf.clone());
        buf
    }

    pub fn block(&self, block: BlockNumber) -> Option<Buffer> {
        self.blocks.lock().get(&block).cloned()
    }

    fn alloc(&self) -> BlockNumber {
        let mut next = self.next_block.lock();
        let block = BlockNumber(*next);
        *next += 1;
        block
    }

    fn copy_on_write(&self, buf: &Buffer) -> Buffer {
        let target = self.alloc();
        let copy = Buffer::detached(target, buf.to_vec());
        {
            let mut data = copy.write();
            let mut hdr = ObjectHeader::parse(&data).expect("header");
            if hdr.obj_type & OBJ_PHYSICAL != 0 {
                hdr.oid = ObjectId(target.0);
            }
            hdr.xid = self.xid();
            hdr.write(&mut data).expect("header");
        }
        copy.set_in_transaction(true);
        self.blocks.lock().insert(target, copy.clone());
        self.freed.lock().push(buf.block());
        copy
    }
}

impl ObjectStore for PhysStore {
    fn xid(&self) -> Xid {
        *self.xid.lock()
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_node(&self, oid: ObjectId, storage: StorageClass, write: bool) -> Result<Node> {
        assert_eq!(storage, StorageClass::Physical);
        let buf = self.read_object_block(BlockNumber(oid.0), write)?;
        Node::parse(buf)
    }

    fn read_object_block(&self, block: BlockNumber, write: bool) -> Result<Buffer> {
        let buf = self
            .block(block)
            .ok_or_else(|| FsError::corruption(block.0, "block never written"))?;
        if !write || buf.in_transaction() {
            return Ok(buf);
        }
        Ok(self.copy_on_write(&buf))
    }

    fn create_node(&self, storage: StorageClass, subtype: u32) -> Result<Buffer> {
        assert_eq!(storage, StorageClass::Physical);
        let block = self.alloc();
        let buf = Buffer::detached(block, vec![0_u8; self.block_size]);
        ObjectHeader {
            cksum: 0,
            oid: ObjectId(block.0),
            xid: self.xid(),
            obj_type: OBJECT_TYPE_BTREE_NODE | OBJ_PHYSICAL,
            subtype,
        }
        .write(&mut buf.write())
        .expect("header");
        buf.set_in_transaction(true);
        self.blocks.lock().insert(block, buf.clone());
        Ok(buf)
    }

    fn delete_node(&self, node: &Node) -> Result<()> {
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
