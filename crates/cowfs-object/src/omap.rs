#![forbid(unsafe_code)]
//! Object map: resolves a virtual `(oid, xid)` to the physical block that
//! holds the object, through a physical B-tree of fixed 16/16 records.

use cowfs_btree::{
    KeyFamily, ObjectStore, Query, QueryFlags, SearchResult, TreeRoot, collect_records,
    corruption_at, create_tree, insert, query, remove, replace,
};
use cowfs_error::{FsError, Result};
use cowfs_ondisk::{OmapKey, OmapVal};
use cowfs_types::{BlockNumber, ObjectId, StorageClass, Xid};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace};

/// One leaf record of the object map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmapRecord {
    pub key: OmapKey,
    pub val: OmapVal,
}

/// Handle on an object-map tree. Mutations may move the root; read it back
/// with [`ObjectMap::root`] afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMap {
    tree: TreeRoot,
}

impl ObjectMap {
    #[must_use]
    pub fn open(root: BlockNumber) -> Self {
        Self {
            tree: TreeRoot {
                oid: ObjectId(root.0),
                storage: StorageClass::Physical,
            },
        }
    }

    /// Create an empty object map in the current transaction.
    pub fn create(store: &dyn ObjectStore) -> Result<Self> {
        let tree = create_tree(store, StorageClass::Physical, KeyFamily::ObjectMap)?;
        Ok(Self { tree })
    }

    #[must_use]
    pub fn root(&self) -> BlockNumber {
        BlockNumber(self.tree.oid.0)
    }

    #[must_use]
    pub fn tree(&self) -> TreeRoot {
        self.tree
    }

    fn search(
        &self,
        store: &dyn ObjectStore,
        key: OmapKey,
        flags: QueryFlags,
    ) -> Result<(Query, SearchResult)> {
        let mut q = Query::new(self.tree, KeyFamily::ObjectMap, key.to_bytes().to_vec(), flags);
        let found = query(store, &mut q)?;
        Ok((q, found))
    }

    /// Exact lookup of the record for `(oid, xid)`.
    pub fn lookup(
        &self,
        store: &dyn ObjectStore,
        oid: ObjectId,
        xid: Xid,
    ) -> Result<Option<OmapVal>> {
        let (q, found) = self.search(store, OmapKey::new(oid, xid), QueryFlags::EXACT)?;
        match found {
            SearchResult::Found => Ok(Some(current_val(&q)?)),
            SearchResult::NotFound => Ok(None),
        }
    }

    /// Resolve `(oid, xid)` to its block.
    ///
    /// With `write`, the object block is read for writing, which may move
    /// it; the record is then repointed at the new block and the new block
    /// is returned.
    pub fn lookup_block(
        &mut self,
        store: &dyn ObjectStore,
        oid: ObjectId,
        xid: Xid,
        write: bool,
    ) -> Result<Option<BlockNumber>> {
        let (mut q, found) = self.search(store, OmapKey::new(oid, xid), QueryFlags::EXACT)?;
        if found == SearchResult::NotFound {
            return Ok(None);
        }
        let val = current_val(&q)?;
        if !write {
            return Ok(Some(val.paddr));
        }

        let buf = store.read_object_block(val.paddr, true)?;
        if buf.block() != val.paddr {
            let moved = OmapVal {
                flags: val.flags,
                size: block_size_u32(store),
                paddr: buf.block(),
            };
            replace(store, &mut q, None, Some(&moved.to_bytes()))?;
            self.tree = q.root;
            trace!(
                oid = oid.0,
                xid = xid.0,
                from = val.paddr.0,
                to = moved.paddr.0,
                "omap_repoint"
            );
        }
        Ok(Some(buf.block()))
    }

    /// Newest record for `oid` whose xid is at most `max_xid`.
    pub fn lookup_latest(
        &self,
        store: &dyn ObjectStore,
        oid: ObjectId,
        max_xid: Xid,
    ) -> Result<Option<OmapRecord>> {
        let (q, found) = self.search(store, OmapKey::new(oid, max_xid), QueryFlags::NONE)?;
        if found == SearchResult::NotFound {
            return Ok(None);
        }
        let Some(frame) = q.frames().last() else {
            return Ok(None);
        };
        if frame.slot().is_none() {
            return Ok(None);
        }
        let key = OmapKey::parse(&q.current_key()?)
            .map_err(|e| corruption_at(frame.node.block(), &e))?;
        if key.oid != oid {
            return Ok(None);
        }
        Ok(Some(OmapRecord {
            key,
            val: current_val(&q)?,
        }))
    }

    /// Map `(oid, xid)` to `paddr`. An existing record is left as it is and
    /// `false` is returned.
    pub fn create_record(
        &mut self,
        store: &dyn ObjectStore,
        oid: ObjectId,
        xid: Xid,
        paddr: BlockNumber,
    ) -> Result<bool> {
        let key = OmapKey::new(oid, xid);
        let (mut q, found) = self.search(store, key, QueryFlags::EXACT)?;
        if found == SearchResult::Found {
            debug!(oid = oid.0, xid = xid.0, "omap_record_exists");
            return Ok(false);
        }
        let val = OmapVal {
            flags: 0,
            size: block_size_u32(store),
            paddr,
        };
        insert(store, &mut q, &key.to_bytes(), &val.to_bytes())?;
        self.tree = q.root;
        trace!(oid = oid.0, xid = xid.0, paddr = paddr.0, "omap_record_create");
        Ok(true)
    }

    /// Remove the record for `(oid, xid)`, which must exist.
    pub fn delete_record(
        &mut self,
        store: &dyn ObjectStore,
        oid: ObjectId,
        xid: Xid,
    ) -> Result<()> {
        let (mut q, found) = self.search(store, OmapKey::new(oid, xid), QueryFlags::EXACT)?;
        if found == SearchResult::NotFound {
            error!(
                invariant = "omap_record_exists",
                block = self.root().0,
                oid = oid.0,
                xid = xid.0,
                "omap_invariant_violation"
            );
            return Err(FsError::corruption(
                self.root().0,
                format!("no object map record for oid {} xid {}", oid.0, xid.0),
            ));
        }
        remove(store, &mut q)?;
        self.tree = q.root;
        trace!(oid = oid.0, xid = xid.0, "omap_record_delete");
        Ok(())
    }

    /// Every record in key order.
    pub fn records(&self, store: &dyn ObjectStore) -> Result<Vec<OmapRecord>> {
        let root = self.root();
        collect_records(store, self.tree)?
            .into_iter()
            .map(|(key, val)| {
                Ok(OmapRecord {
                    key: OmapKey::parse(&key).map_err(|e| corruption_at(root, &e))?,
                    val: OmapVal::parse(&val).map_err(|e| corruption_at(root, &e))?,
                })
            })
            .collect()
    }
}

fn current_val(q: &Query) -> Result<OmapVal> {
    let block = q
        .frames()
        .last()
        .map_or(BlockNumber(q.root.oid.0), |f| f.node.block());
    let raw = q.current_value()?;
    OmapVal::parse(&raw).map_err(|e| {
        error!(
            invariant = "omap_val_size",
            block = block.0,
            len = raw.len(),
            "omap_invariant_violation"
        );
        corruption_at(block, &e)
    })
}

fn block_size_u32(store: &dyn ObjectStore) -> u32 {
    u32::try_from(store.block_size()).unwrap_or(u32::MAX)
}
