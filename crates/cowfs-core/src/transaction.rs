#![forbid(unsafe_code)]
//! The write transaction.
//!
//! A transaction holds the container lock exclusively from [`Container::begin`]
//! until it commits or aborts. Blocks written by earlier transactions are
//! never modified: the first write to one copies it to a freshly allocated
//! block and queues the original for release at commit. Checkpoint blocks
//! and ephemeral objects are the exception; they join at the start and are
//! rewritten where they stand.
//!
//! [`Container::begin`]: crate::Container::begin

use crate::catalog::Catalog;
use crate::container::Container;
use crate::session::{check_target, resolve_virtual, unmapped};
use cowfs_block::Buffer;
use cowfs_btree::{Diagnostics, KeyFamily, Node, ObjectStore, TreeRoot, corruption_at, create_tree};
use cowfs_error::{FsError, Result};
use cowfs_object::{CheckpointAreas, ObjectMap};
use cowfs_ondisk::{ObjectHeader, Superblock, set_checksum};
use cowfs_txn::{JoinKind, TxnState, TxnSummary};
use cowfs_types::{
    BlockNumber, NX_SUPERBLOCK_BLOCK, OBJECT_TYPE_BTREE_NODE, ObjectId, StorageClass, Xid,
};
use parking_lot::{Mutex, RwLockWriteGuard};
use tracing::{debug, error, trace, warn};

struct TxnInner {
    sb: Superblock,
    areas: CheckpointAreas,
    state: TxnState,
}

/// Exclusive, copy-on-write view of the container.
///
/// Dropping a transaction without committing aborts it.
pub struct Transaction<'a> {
    fs: &'a Container,
    xid: Xid,
    inner: Mutex<TxnInner>,
    finished: bool,
    _guard: RwLockWriteGuard<'a, ()>,
}

impl<'a> Transaction<'a> {
    pub(crate) fn start(
        fs: &'a Container,
        sb: Superblock,
        guard: RwLockWriteGuard<'a, ()>,
    ) -> Result<Self> {
        let xid = sb.next_xid;
        let areas = CheckpointAreas::from_superblock(&sb);
        let txn = Self {
            fs,
            xid,
            inner: Mutex::new(TxnInner {
                sb,
                areas,
                state: TxnState::new(xid),
            }),
            finished: false,
            _guard: guard,
        };
        for block in areas.mapping_blocks() {
            let buf = fs.fetch(block)?;
            txn.inner.lock().state.join(&buf, JoinKind::InPlace);
        }
        let mappings = areas.mappings(&txn)?;
        for mapping in &mappings {
            let buf = fs.fetch(mapping.paddr)?;
            txn.inner.lock().state.join(&buf, JoinKind::InPlace);
        }
        debug!(xid = xid.0, ephemeral = mappings.len(), "txn_begin");
        Ok(txn)
    }

    /// Working copy of the superblock, including this transaction's changes.
    #[must_use]
    pub fn superblock(&self) -> Superblock {
        self.inner.lock().sb
    }

    #[must_use]
    pub fn object_map(&self) -> ObjectMap {
        ObjectMap::open(self.inner.lock().sb.omap_root)
    }

    #[must_use]
    pub fn checkpoint(&self) -> CheckpointAreas {
        self.inner.lock().areas
    }

    #[must_use]
    pub fn catalog(&self) -> Catalog<'_> {
        Catalog::open(self, self.inner.lock().sb.catalog_root)
    }

    /// Create an empty virtual or ephemeral tree.
    ///
    /// Physical trees need their root pointer stored somewhere that follows
    /// relocation; only the object map has one.
    pub fn create_tree(&self, storage: StorageClass, family: KeyFamily) -> Result<TreeRoot> {
        if storage == StorageClass::Physical {
            return Err(FsError::UnsupportedFeature(
                "physical trees other than the object map".to_owned(),
            ));
        }
        create_tree(self, storage, family)
    }

    #[must_use]
    pub fn summary(&self) -> TxnSummary {
        self.inner.lock().state.summary()
    }

    pub(crate) fn set_omap_root(&self, root: BlockNumber) {
        self.inner.lock().sb.omap_root = root;
    }

    pub(crate) fn set_catalog_root(&self, root: ObjectId) {
        self.inner.lock().sb.catalog_root = root;
    }

    // ── Commit / abort ──────────────────────────────────────────────────────

    /// Make every change durable and visible.
    ///
    /// On failure the transaction is rolled back before the error returns.
    pub fn commit(mut self) -> Result<TxnSummary> {
        match self.write_out() {
            Ok(summary) => {
                self.finished = true;
                debug!(
                    xid = summary.xid.0,
                    written = summary.written,
                    allocated = summary.allocated,
                    reclaimed = summary.reclaimed,
                    "txn_commit"
                );
                Ok(summary)
            }
            Err(err) => {
                warn!(xid = self.xid.0, error = %err, "txn_commit_failed");
                if let Err(rollback) = self.rollback() {
                    error!(xid = self.xid.0, error = %rollback, "txn_rollback_failed");
                }
                Err(err)
            }
        }
    }

    /// Discard every change.
    pub fn abort(mut self) -> Result<TxnSummary> {
        self.rollback()
    }

    fn write_out(&mut self) -> Result<TxnSummary> {
        let xid = self.xid;
        let fs = self.fs;
        let cache = fs.cache();
        let inner = self.inner.get_mut();
        for buf in inner.state.write_set() {
            {
                let mut data = buf.write();
                let mut hdr = ObjectHeader::parse(&data).map_err(|e| corruption_at(buf.block(), &e))?;
                hdr.xid = xid;
                hdr.write(&mut data).map_err(|e| corruption_at(buf.block(), &e))?;
                set_checksum(&mut data).map_err(|e| corruption_at(buf.block(), &e))?;
            }
            cache.write_back(buf)?;
        }
        cache.device().sync()?;

        let mut sb = inner.sb;
        sb.next_xid = xid.next();
        inner.areas.store_into(&mut sb);
        fs.write_superblock(&sb, xid)?;
        cache.device().sync()?;

        // Durable from here on; a failed release must not undo the commit.
        let mut committed = fs.committed().lock();
        for &block in inner.state.reclaim_queue().iter().chain(inner.state.released()) {
            cache.forget(block);
            if let Err(err) = committed.alloc.free(block) {
                error!(
                    invariant = "reclaimed_block_allocated",
                    block = block.0,
                    error = %err,
                    "alloc_invariant_violation"
                );
            }
        }
        committed.sb = sb;
        drop(committed);

        let state = std::mem::replace(&mut inner.state, TxnState::new(xid));
        Ok(state.finish())
    }

    fn rollback(&mut self) -> Result<TxnSummary> {
        self.finished = true;
        let xid = self.xid;
        let fs = self.fs;
        let cache = fs.cache();
        let inner = self.inner.get_mut();
        let state = std::mem::replace(&mut inner.state, TxnState::new(xid));

        let mut first_err = None;
        {
            let mut committed = fs.committed().lock();
            for block in state.allocated().chain(state.released().iter().copied()) {
                cache.forget(block);
                if let Err(err) = committed.alloc.free(block) {
                    first_err.get_or_insert(err);
                }
            }
        }
        for buf in state.in_place() {
            if let Err(err) = cache.reload(buf) {
                error!(block = buf.block().0, error = %err, "txn_abort_reload_failed");
                first_err.get_or_insert(err);
            }
        }
        let summary = state.finish();
        debug!(xid = xid.0, discarded = summary.written, "txn_abort");
        match first_err {
            Some(err) => Err(err),
            None => Ok(summary),
        }
    }

    // ── Block plumbing ──────────────────────────────────────────────────────

    fn allocate(&self) -> Result<BlockNumber> {
        let backwards = self.fs.options().allocate_backwards;
        self.fs.committed().lock().alloc.allocate(backwards)
    }

    fn next_oid(&self) -> ObjectId {
        let mut inner = self.inner.lock();
        let oid = inner.sb.next_oid;
        inner.sb.next_oid = ObjectId(oid.0 + 1);
        oid
    }

    fn in_checkpoint(&self, block: BlockNumber) -> bool {
        let areas = self.inner.lock().areas;
        let inside = |base: BlockNumber, len: u32| {
            block.0 >= base.0 && block.0 - base.0 < u64::from(len)
        };
        block == NX_SUPERBLOCK_BLOCK
            || inside(areas.desc_base, areas.desc_blocks)
            || inside(areas.data_base, areas.data_blocks)
    }

    /// Copy `buf` to a new block owned by this transaction.
    fn relocate(&self, buf: &Buffer) -> Result<Buffer> {
        let from = buf.block();
        let target = self.allocate()?;
        let copy = self.fs.cache().get_zeroed(target);
        copy.copy_from(&buf.read());
        self.inner.lock().state.join(&copy, JoinKind::Allocated);
        {
            let mut data = copy.write();
            let mut hdr = ObjectHeader::parse(&data).map_err(|e| corruption_at(from, &e))?;
            if hdr.storage().map_err(|e| corruption_at(from, &e))? == StorageClass::Physical {
                hdr.oid = target.as_oid();
            }
            hdr.xid = self.xid;
            hdr.write(&mut data).map_err(|e| corruption_at(from, &e))?;
        }
        self.inner.lock().state.defer_free(from);
        trace!(from = from.0, to = target.0, xid = self.xid.0, "cow_relocate");
        Ok(copy)
    }

    /// Remove the ephemeral object at `block` and close the gap it leaves
    /// in the data ring.
    fn delete_ephemeral(&self, block: BlockNumber) -> Result<()> {
        let areas = self.inner.lock().areas;
        let offset = areas.data_offset(block)?;
        areas.remove_mapping(self, block)?;
        for off in offset + 1..areas.data_len {
            let src = self.fs.fetch(areas.data_block(off)?)?;
            let dst = self.read_object_block(areas.data_block(off - 1)?, true)?;
            dst.copy_from(&src.read());
        }
        let last = areas.data_block(areas.data_len.saturating_sub(1))?;
        let tail = self.read_object_block(last, true)?;
        tail.copy_from(&vec![0_u8; self.block_size()]);
        self.inner.lock().areas.data_len -= 1;
        trace!(block = block.0, offset, "ephemeral_delete");
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(err) = self.rollback() {
                error!(xid = self.xid.0, error = %err, "txn_rollback_failed");
            }
        }
    }
}

impl ObjectStore for Transaction<'_> {
    fn xid(&self) -> Xid {
        self.xid
    }

    fn block_size(&self) -> usize {
        self.fs.cache().block_size()
    }

    fn read_node(&self, oid: ObjectId, storage: StorageClass, write: bool) -> Result<Node> {
        let buf = match storage {
            StorageClass::Physical => self.read_object_block(oid.as_block(), write)?,
            StorageClass::Virtual => {
                let mut omap = self.object_map();
                let block = if write {
                    let Some(rec) = omap.lookup_latest(self, oid, self.xid)? else {
                        return Err(unmapped(omap, oid));
                    };
                    omap.lookup_block(self, oid, rec.key.xid, true)?
                        .ok_or_else(|| unmapped(omap, oid))?
                } else {
                    resolve_virtual(self, omap, oid)?
                };
                self.fs.fetch(block)?
            }
            StorageClass::Ephemeral => {
                let block = self.checkpoint().lookup(self, oid)?;
                self.read_object_block(block, write)?
            }
        };
        let node = Node::parse(buf)?;
        check_target(self, oid, storage, &node);
        Ok(node)
    }

    fn read_object_block(&self, block: BlockNumber, write: bool) -> Result<Buffer> {
        let buf = self.fs.fetch(block)?;
        if !write || buf.in_transaction() {
            return Ok(buf);
        }
        if self.in_checkpoint(block) {
            self.inner.lock().state.join(&buf, JoinKind::InPlace);
            return Ok(buf);
        }
        self.relocate(&buf)
    }

    fn create_node(&self, storage: StorageClass, subtype: u32) -> Result<Buffer> {
        let (oid, block) = match storage {
            StorageClass::Physical => {
                let block = self.allocate()?;
                (block.as_oid(), block)
            }
            StorageClass::Virtual => (self.next_oid(), self.allocate()?),
            StorageClass::Ephemeral => {
                let block = self.inner.lock().areas.allocate_data_block()?;
                (self.next_oid(), block)
            }
        };
        let buf = self.fs.cache().get_zeroed(block);
        ObjectHeader {
            cksum: 0,
            oid,
            xid: self.xid,
            obj_type: OBJECT_TYPE_BTREE_NODE | storage.type_flags(),
            subtype,
        }
        .write(&mut buf.write())
        .map_err(|e| corruption_at(block, &e))?;
        let kind = if storage == StorageClass::Ephemeral {
            JoinKind::InPlace
        } else {
            JoinKind::Allocated
        };
        self.inner.lock().state.join(&buf, kind);

        match storage {
            StorageClass::Physical => {}
            StorageClass::Virtual => {
                let mut omap = self.object_map();
                if !omap.create_record(self, oid, self.xid, block)? {
                    error!(
                        invariant = "fresh_oid_unmapped",
                        block = block.0,
                        oid = oid.0,
                        "omap_invariant_violation"
                    );
                    return Err(FsError::corruption(
                        omap.root().0,
                        format!("object map already maps new oid {}", oid.0),
                    ));
                }
            }
            StorageClass::Ephemeral => {
                self.checkpoint()
                    .create_mapping(self, oid, OBJECT_TYPE_BTREE_NODE, subtype, block)?;
            }
        }
        trace!(oid = oid.0, block = block.0, ?storage, "node_create");
        Ok(buf)
    }

    fn delete_node(&self, node: &Node) -> Result<()> {
        match node.storage() {
            StorageClass::Physical => self.inner.lock().state.defer_free(node.block()),
            StorageClass::Virtual => {
                let mut omap = self.object_map();
                let Some(rec) = omap.lookup_latest(self, node.oid(), self.xid)? else {
                    return Err(unmapped(omap, node.oid()));
                };
                omap.delete_record(self, node.oid(), rec.key.xid)?;
                self.inner.lock().state.defer_free(node.block());
            }
            StorageClass::Ephemeral => self.delete_ephemeral(node.block())?,
        }
        trace!(oid = node.oid().0, block = node.block().0, "node_delete");
        Ok(())
    }

    fn root_relocated(&self, old: ObjectId, new: ObjectId) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.sb.omap_root == old.as_block() {
            inner.sb.omap_root = new.as_block();
            debug!(from = old.0, to = new.0, "omap_root_relocated");
            return Ok(());
        }
        Err(FsError::UnsupportedFeature(format!(
            "relocation of physical root {} outside the object map",
            old.0
        )))
    }

    fn diagnostics(&self) -> &Diagnostics {
        self.fs.diagnostics()
    }
}
