#![forbid(unsafe_code)]
//! Catalog client: typed access to a catalog-family tree.

use cowfs_btree::{
    KeyFamily, ObjectStore, Query, QueryFlags, SearchResult, TreeRoot, collect_records, insert,
    query, remove, replace,
};
use cowfs_error::{FsError, Result};
use cowfs_ondisk::{CatalogKey, CatalogRecordType, DstreamIdVal};
use cowfs_types::{ObjectId, StorageClass};
use tracing::{error, trace};

/// Catalog tree bound to the session or transaction that reads it.
pub struct Catalog<'s> {
    store: &'s dyn ObjectStore,
    root: TreeRoot,
}

impl<'s> Catalog<'s> {
    /// The container's catalog, a virtual tree rooted at `oid`.
    #[must_use]
    pub fn open(store: &'s dyn ObjectStore, oid: ObjectId) -> Self {
        Self::with_root(
            store,
            TreeRoot {
                oid,
                storage: StorageClass::Virtual,
            },
        )
    }

    /// Any catalog-family tree, such as an ephemeral one made with
    /// [`Transaction::create_tree`](crate::Transaction::create_tree).
    #[must_use]
    pub fn with_root(store: &'s dyn ObjectStore, root: TreeRoot) -> Self {
        Self { store, root }
    }

    #[must_use]
    pub fn root(&self) -> TreeRoot {
        self.root
    }

    fn search(&self, key: &CatalogKey, flags: QueryFlags) -> Result<(Query, SearchResult)> {
        let mut q = Query::new(self.root, KeyFamily::Catalog, encode(key)?, flags);
        let found = query(self.store, &mut q)?;
        Ok((q, found))
    }

    pub fn get(&self, key: &CatalogKey) -> Result<Option<Vec<u8>>> {
        let (q, found) = self.search(key, QueryFlags::EXACT)?;
        match found {
            SearchResult::Found => Ok(Some(q.current_value()?)),
            SearchResult::NotFound => Ok(None),
        }
    }

    /// Insert a new record; an existing one fails with [`FsError::Exists`].
    pub fn insert(&mut self, key: &CatalogKey, val: &[u8]) -> Result<()> {
        let raw = encode(key)?;
        let (mut q, found) = self.search(key, QueryFlags::EXACT)?;
        if found == SearchResult::Found {
            return Err(FsError::Exists);
        }
        insert(self.store, &mut q, &raw, val)?;
        self.root = q.root;
        Ok(())
    }

    /// Insert or overwrite. Returns `true` if a record was replaced.
    pub fn upsert(&mut self, key: &CatalogKey, val: &[u8]) -> Result<bool> {
        let raw = encode(key)?;
        let (mut q, found) = self.search(key, QueryFlags::EXACT)?;
        let existed = found == SearchResult::Found;
        if existed {
            replace(self.store, &mut q, None, Some(val))?;
        } else {
            insert(self.store, &mut q, &raw, val)?;
        }
        self.root = q.root;
        Ok(existed)
    }

    /// Remove a record. Returns `false` if there was none.
    pub fn delete(&mut self, key: &CatalogKey) -> Result<bool> {
        let (mut q, found) = self.search(key, QueryFlags::EXACT)?;
        if found == SearchResult::NotFound {
            return Ok(false);
        }
        remove(self.store, &mut q)?;
        self.root = q.root;
        Ok(true)
    }

    /// Every record of object `id` with type `kind`, in key order.
    pub fn records_of(&self, id: u64, kind: CatalogRecordType) -> Result<Vec<(CatalogKey, Vec<u8>)>> {
        let search_key = CatalogKey::new(id, kind);
        let mut q = Query::new(
            self.root,
            KeyFamily::Catalog,
            encode(&search_key)?,
            QueryFlags::MULTIPLE | QueryFlags::EXACT,
        );
        let mut out = Vec::new();
        while query(self.store, &mut q)? == SearchResult::Found {
            out.push((decode(&q.current_key()?)?, q.current_value()?));
        }
        out.reverse();
        Ok(out)
    }

    /// Every record of the tree, in key order.
    pub fn records(&self) -> Result<Vec<(CatalogKey, Vec<u8>)>> {
        collect_records(self.store, self.root)?
            .into_iter()
            .map(|(key, val)| Ok((decode(&key)?, val)))
            .collect()
    }

    // ── Data-stream references ──────────────────────────────────────────────

    /// Take the first reference on data stream `id`. A stream that already
    /// has a record is left alone.
    pub fn create_dstream_rec(&mut self, id: u64) -> Result<()> {
        let key = CatalogKey::new(id, CatalogRecordType::DstreamId);
        let raw = encode(&key)?;
        let (mut q, found) = self.search(&key, QueryFlags::EXACT)?;
        if found == SearchResult::Found {
            return Ok(());
        }
        insert(self.store, &mut q, &raw, &DstreamIdVal { refcnt: 1 }.to_bytes())?;
        self.root = q.root;
        trace!(id, "dstream_create");
        Ok(())
    }

    /// Drop one reference on data stream `id`, removing the record with the
    /// last one. A stream of `size` bytes must have a record unless it is
    /// empty.
    pub fn put_dstream_rec(&mut self, id: u64, size: u64) -> Result<()> {
        let key = CatalogKey::new(id, CatalogRecordType::DstreamId);
        let (mut q, found) = self.search(&key, QueryFlags::EXACT)?;
        let block = q.frames().last().map_or(0, |f| f.node.block().0);
        if found == SearchResult::NotFound {
            if size == 0 {
                return Ok(());
            }
            error!(
                invariant = "dstream_has_record",
                block,
                id,
                size,
                "catalog_invariant_violation"
            );
            return Err(FsError::corruption(
                block,
                format!("data stream {id} of {size} bytes has no reference record"),
            ));
        }
        let raw = q.current_value()?;
        let val = DstreamIdVal::parse(&raw).map_err(|e| {
            error!(
                invariant = "dstream_val_size",
                block,
                id,
                len = raw.len(),
                "catalog_invariant_violation"
            );
            FsError::corruption(block, e.to_string())
        })?;
        if val.refcnt <= 1 {
            remove(self.store, &mut q)?;
        } else {
            let next = DstreamIdVal {
                refcnt: val.refcnt - 1,
            };
            replace(self.store, &mut q, None, Some(&next.to_bytes()))?;
        }
        self.root = q.root;
        trace!(id, refcnt = val.refcnt.saturating_sub(1), "dstream_put");
        Ok(())
    }
}

fn encode(key: &CatalogKey) -> Result<Vec<u8>> {
    key.to_bytes()
        .map_err(|e| FsError::Format(format!("catalog key: {e}")))
}

fn decode(raw: &[u8]) -> Result<CatalogKey> {
    CatalogKey::parse(raw).map_err(|e| FsError::Format(format!("catalog key: {e}")))
}
