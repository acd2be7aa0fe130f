#![forbid(unsafe_code)]
//! The container: one block device, its superblock and free space, and
//! the lock that admits readers or a single writer.

use crate::options::{ContainerOptions, FormatOptions};
use crate::session::ReadSession;
use crate::transaction::Transaction;
use cowfs_block::{BlockDevice, Buffer, BufferCache};
use cowfs_btree::{Diagnostics, KeyFamily, Node, TreeStats, verify_tree, walk};
use cowfs_error::{FsError, Result};
use cowfs_object::{CheckpointAreas, ObjectMap};
use cowfs_ondisk::{
    CHECKPOINT_MAP_LAST, CheckpointMap, NX_FLAG_CHECK_NODES, ObjectHeader, Superblock,
    set_checksum, verify_checksum,
};
use cowfs_txn::{BitmapAllocator, FsLock, SpaceAllocator};
use cowfs_types::{
    BlockNumber, FIRST_USER_OID, NX_SUPERBLOCK_BLOCK, OBJ_PHYSICAL, OBJECT_TYPE_CHECKPOINT_MAP,
    OBJECT_TYPE_NX_SUPERBLOCK, ObjectId, StorageClass, Xid,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Object id recorded in the superblock header.
const SUPERBLOCK_OID: ObjectId = ObjectId(1);

/// State as of the last commit, plus the allocator shared with the running
/// transaction.
pub(crate) struct Committed {
    pub(crate) sb: Superblock,
    pub(crate) alloc: Box<dyn SpaceAllocator>,
}

/// Structural summary of the container's trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ContainerReport {
    pub xid: Xid,
    pub object_map: TreeStats,
    pub catalog: TreeStats,
    pub free_blocks: u64,
    pub total_blocks: u64,
}

/// An opened copy-on-write container.
///
/// Any number of [`ReadSession`]s run against the last committed state, or
/// exactly one [`Transaction`] runs with exclusive access. Independent
/// containers share nothing, so tests may open several side by side.
pub struct Container {
    cache: BufferCache,
    lock: FsLock,
    committed: Mutex<Committed>,
    options: ContainerOptions,
    verify_checksums: bool,
    diagnostics: Diagnostics,
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let committed = self.committed.lock();
        f.debug_struct("Container")
            .field("superblock", &committed.sb)
            .field("free_blocks", &committed.alloc.free_blocks())
            .field("options", &self.options)
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}

impl Container {
    // ── Format / open ───────────────────────────────────────────────────────

    /// Write an empty container to `dev`: superblock, checkpoint areas, an
    /// empty object map and an empty catalog.
    pub fn format(dev: Arc<dyn BlockDevice>, opts: &FormatOptions) -> Result<Self> {
        let block_count = opts.validate(dev.block_size(), dev.block_count())?;
        let desc_base = BlockNumber(1);
        let data_base = BlockNumber(desc_base.0 + u64::from(opts.checkpoint_desc_blocks));
        let sb = Superblock {
            block_size: opts.block_size,
            block_count,
            next_oid: ObjectId(FIRST_USER_OID),
            next_xid: Xid(1),
            omap_root: BlockNumber(0),
            catalog_root: ObjectId(0),
            desc_base,
            desc_blocks: opts.checkpoint_desc_blocks,
            desc_index: 0,
            desc_len: 2,
            data_base,
            data_blocks: opts.checkpoint_data_blocks,
            data_index: 0,
            data_len: 0,
            flags: if opts.check_nodes { NX_FLAG_CHECK_NODES } else { 0 },
        };

        let areas = CheckpointAreas::from_superblock(&sb);
        let cpm_block = areas.current_mapping_block()?;
        let mut raw = vec![0_u8; opts.block_size as usize];
        ObjectHeader {
            cksum: 0,
            oid: cpm_block.as_oid(),
            xid: Xid(0),
            obj_type: OBJECT_TYPE_CHECKPOINT_MAP | OBJ_PHYSICAL,
            subtype: 0,
        }
        .write(&mut raw)
        .map_err(|e| FsError::Format(e.to_string()))?;
        CheckpointMap {
            flags: CHECKPOINT_MAP_LAST,
            mappings: Vec::new(),
        }
        .write(&mut raw)
        .map_err(|e| FsError::Format(e.to_string()))?;
        set_checksum(&mut raw).map_err(|e| FsError::Format(e.to_string()))?;
        dev.write_block(cpm_block, &raw)?;

        let fs = Self::assemble(dev, sb, ContainerOptions::default())?;
        let txn = fs.begin()?;
        let omap = ObjectMap::create(&txn)?;
        txn.set_omap_root(omap.root());
        let catalog = txn.create_tree(StorageClass::Virtual, KeyFamily::Catalog)?;
        txn.set_catalog_root(catalog.oid);
        txn.commit()?;

        let sb = fs.superblock();
        info!(
            block_size = sb.block_size,
            block_count = sb.block_count,
            omap_root = sb.omap_root.0,
            catalog_root = sb.catalog_root.0,
            "container_format"
        );
        Ok(fs)
    }

    /// Open a container with default options.
    pub fn open(dev: Arc<dyn BlockDevice>) -> Result<Self> {
        Self::open_with_options(dev, ContainerOptions::default())
    }

    /// Open a container: validate the superblock and rebuild free space by
    /// walking everything the object map reaches.
    pub fn open_with_options(dev: Arc<dyn BlockDevice>, options: ContainerOptions) -> Result<Self> {
        let raw = dev.read_block(NX_SUPERBLOCK_BLOCK)?;
        if !verify_checksum(raw.as_slice()) {
            error!(invariant = "fletcher64", block = 0_u64, "checksum_invariant_violation");
            return Err(FsError::BadChecksum { block: 0 });
        }
        let sb = Superblock::parse(raw.as_slice()).map_err(|e| FsError::Format(e.to_string()))?;
        if sb.block_size != dev.block_size() || sb.block_count > dev.block_count() {
            return Err(FsError::Format(format!(
                "superblock geometry {}x{} does not fit the device ({}x{})",
                sb.block_count,
                sb.block_size,
                dev.block_count(),
                dev.block_size()
            )));
        }
        let fs = Self::assemble(dev, sb, options)?;
        fs.rebuild_free_space()?;
        info!(
            xid = sb.next_xid.0.saturating_sub(1),
            free = fs.free_blocks(),
            verify_checksums = fs.verify_checksums,
            "container_open"
        );
        Ok(fs)
    }

    /// Build the in-memory container with the fixed areas already claimed.
    fn assemble(dev: Arc<dyn BlockDevice>, sb: Superblock, options: ContainerOptions) -> Result<Self> {
        let mut alloc = BitmapAllocator::new(sb.block_count)?;
        let areas = CheckpointAreas::from_superblock(&sb);
        alloc.mark_used(NX_SUPERBLOCK_BLOCK)?;
        for block in areas.descriptor_area().into_iter().chain(areas.data_area()) {
            alloc.mark_used(block)?;
        }
        Ok(Self {
            cache: BufferCache::new(dev),
            lock: FsLock::new(),
            committed: Mutex::new(Committed {
                sb,
                alloc: Box::new(alloc),
            }),
            options,
            verify_checksums: options.verify_checksums || sb.flags & NX_FLAG_CHECK_NODES != 0,
            diagnostics: Diagnostics::new(),
        })
    }

    fn rebuild_free_space(&self) -> Result<()> {
        let session = self.read();
        let omap = session.object_map();
        let mut used = Vec::new();
        walk(&session, omap.tree(), &mut |node: &Node| {
            used.push(node.block());
            Ok(())
        })?;
        used.extend(omap.records(&session)?.into_iter().map(|r| r.val.paddr));
        drop(session);

        let mut committed = self.committed.lock();
        for block in &used {
            committed.alloc.mark_used(*block)?;
        }
        debug!(claimed = used.len(), free = committed.alloc.free_blocks(), "free_space_rebuilt");
        Ok(())
    }

    // ── Sessions ────────────────────────────────────────────────────────────

    /// Shared access to the last committed state.
    #[must_use]
    pub fn read(&self) -> ReadSession<'_> {
        let guard = self.lock.read();
        let sb = self.committed.lock().sb;
        ReadSession::new(self, sb, guard)
    }

    /// Start the single write transaction, waiting for readers to finish.
    pub fn begin(&self) -> Result<Transaction<'_>> {
        let guard = self.lock.write();
        let sb = self.committed.lock().sb;
        Transaction::start(self, sb, guard)
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    /// Superblock as of the last commit.
    #[must_use]
    pub fn superblock(&self) -> Superblock {
        self.committed.lock().sb
    }

    #[must_use]
    pub fn options(&self) -> ContainerOptions {
        self.options
    }

    #[must_use]
    pub fn verifies_checksums(&self) -> bool {
        self.verify_checksums
    }

    #[must_use]
    pub fn free_blocks(&self) -> u64 {
        self.committed.lock().alloc.free_blocks()
    }

    #[must_use]
    pub fn is_block_used(&self, block: BlockNumber) -> bool {
        self.committed.lock().alloc.is_used(block)
    }

    /// Soft inconsistencies noticed by any session of this container.
    #[must_use]
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        self.cache.device()
    }

    /// Verify the object map and the catalog of the committed state.
    pub fn verify(&self) -> Result<ContainerReport> {
        let session = self.read();
        let object_map = verify_tree(&session, session.object_map().tree())?;
        let catalog = verify_tree(&session, session.catalog().root())?;
        let sb = session.superblock();
        drop(session);
        let committed = self.committed.lock();
        Ok(ContainerReport {
            xid: Xid(sb.next_xid.0.saturating_sub(1)),
            object_map,
            catalog,
            free_blocks: committed.alloc.free_blocks(),
            total_blocks: committed.alloc.total_blocks(),
        })
    }

    // ── Crate-internal plumbing ─────────────────────────────────────────────

    pub(crate) fn cache(&self) -> &BufferCache {
        &self.cache
    }

    pub(crate) fn committed(&self) -> &Mutex<Committed> {
        &self.committed
    }

    /// Cached block, checksum-verified unless it belongs to the running
    /// transaction.
    pub(crate) fn fetch(&self, block: BlockNumber) -> Result<Buffer> {
        let buf = self.cache.get(block)?;
        if self.verify_checksums && !buf.in_transaction() && !verify_checksum(&buf.read()) {
            self.cache.forget(block);
            error!(invariant = "fletcher64", block = block.0, "checksum_invariant_violation");
            return Err(FsError::BadChecksum { block: block.0 });
        }
        Ok(buf)
    }

    /// Write `sb` to block 0 and to the checkpoint's superblock copy.
    pub(crate) fn write_superblock(&self, sb: &Superblock, xid: Xid) -> Result<()> {
        let mut raw = vec![0_u8; self.cache.block_size()];
        ObjectHeader {
            cksum: 0,
            oid: SUPERBLOCK_OID,
            xid,
            obj_type: OBJECT_TYPE_NX_SUPERBLOCK | OBJ_PHYSICAL,
            subtype: 0,
        }
        .write(&mut raw)
        .map_err(|e| FsError::Format(e.to_string()))?;
        sb.write(&mut raw).map_err(|e| FsError::Format(e.to_string()))?;
        set_checksum(&mut raw).map_err(|e| FsError::Format(e.to_string()))?;

        let copy = CheckpointAreas::from_superblock(sb).superblock_copy();
        for block in [copy, NX_SUPERBLOCK_BLOCK] {
            self.cache.forget(block);
            self.cache.device().write_block(block, &raw)?;
        }
        Ok(())
    }
}
