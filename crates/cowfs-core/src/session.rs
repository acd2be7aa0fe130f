#![forbid(unsafe_code)]
//! Read-only access to the last committed state.

use crate::catalog::Catalog;
use crate::container::Container;
use cowfs_block::Buffer;
use cowfs_btree::{Diagnostic, Diagnostics, Node, ObjectStore};
use cowfs_error::{FsError, Result};
use cowfs_object::{CheckpointAreas, ObjectMap};
use cowfs_ondisk::Superblock;
use cowfs_types::{BlockNumber, ObjectId, StorageClass, Xid};
use parking_lot::RwLockReadGuard;
use tracing::error;

/// Shared-lock view of the container. Trees read through it see exactly
/// what the last commit wrote.
pub struct ReadSession<'a> {
    fs: &'a Container,
    sb: Superblock,
    _guard: RwLockReadGuard<'a, ()>,
}

impl<'a> ReadSession<'a> {
    pub(crate) fn new(fs: &'a Container, sb: Superblock, guard: RwLockReadGuard<'a, ()>) -> Self {
        Self {
            fs,
            sb,
            _guard: guard,
        }
    }

    #[must_use]
    pub fn superblock(&self) -> Superblock {
        self.sb
    }

    #[must_use]
    pub fn object_map(&self) -> ObjectMap {
        ObjectMap::open(self.sb.omap_root)
    }

    #[must_use]
    pub fn checkpoint(&self) -> CheckpointAreas {
        CheckpointAreas::from_superblock(&self.sb)
    }

    /// The catalog tree.
    #[must_use]
    pub fn catalog(&self) -> Catalog<'_> {
        Catalog::open(self, self.sb.catalog_root)
    }
}

impl ObjectStore for ReadSession<'_> {
    fn xid(&self) -> Xid {
        Xid(self.sb.next_xid.0.saturating_sub(1))
    }

    fn block_size(&self) -> usize {
        self.fs.cache().block_size()
    }

    fn read_node(&self, oid: ObjectId, storage: StorageClass, write: bool) -> Result<Node> {
        if write {
            return Err(FsError::ReadOnly);
        }
        let block = match storage {
            StorageClass::Physical => oid.as_block(),
            StorageClass::Virtual => resolve_virtual(self, self.object_map(), oid)?,
            StorageClass::Ephemeral => self.checkpoint().lookup(self, oid)?,
        };
        let node = Node::parse(self.fs.fetch(block)?)?;
        check_target(self, oid, storage, &node);
        Ok(node)
    }

    fn read_object_block(&self, block: BlockNumber, write: bool) -> Result<Buffer> {
        if write {
            return Err(FsError::ReadOnly);
        }
        self.fs.fetch(block)
    }

    fn create_node(&self, _storage: StorageClass, _subtype: u32) -> Result<Buffer> {
        Err(FsError::ReadOnly)
    }

    fn delete_node(&self, _node: &Node) -> Result<()> {
        Err(FsError::ReadOnly)
    }

    fn root_relocated(&self, _old: ObjectId, _new: ObjectId) -> Result<()> {
        Err(FsError::ReadOnly)
    }

    fn diagnostics(&self) -> &Diagnostics {
        self.fs.diagnostics()
    }
}

// ── Shared by sessions and transactions ─────────────────────────────────────

/// Block currently holding virtual object `oid`: the newest object-map
/// record not younger than the store's transaction.
pub(crate) fn resolve_virtual(
    store: &dyn ObjectStore,
    omap: ObjectMap,
    oid: ObjectId,
) -> Result<BlockNumber> {
    match omap.lookup_latest(store, oid, store.xid())? {
        Some(rec) => Ok(rec.val.paddr),
        None => Err(unmapped(omap, oid)),
    }
}

pub(crate) fn unmapped(omap: ObjectMap, oid: ObjectId) -> FsError {
    error!(
        invariant = "virtual_object_mapped",
        block = omap.root().0,
        oid = oid.0,
        "omap_invariant_violation"
    );
    FsError::corruption(
        omap.root().0,
        format!("virtual object {} has no object map record", oid.0),
    )
}

/// Note a virtual node whose header names a different object than the map
/// sent us to.
pub(crate) fn check_target(store: &dyn ObjectStore, oid: ObjectId, storage: StorageClass, node: &Node) {
    if storage == StorageClass::Virtual && node.oid() != oid {
        store.diagnostics().record(Diagnostic::OmapTargetMismatch {
            oid,
            block: node.block(),
            found: node.oid(),
        });
    }
}
