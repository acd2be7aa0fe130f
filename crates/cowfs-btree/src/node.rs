#![forbid(unsafe_code)]
//! B-tree node: one block interpreted as header, table of contents, key
//! area and value area.
//!
//! Keys are allocated forward from the start of free space and values
//! backward from its end. Removed ranges are only counted in the free
//! lists; when an insertion or replacement does not fit in the contiguous
//! free space the node is rebuilt compactly, and if it does not fit even
//! then the caller gets [`Placement::NoRoom`] and has to split.

use crate::key::{CHILD_PTR_SIZE, KeyFamily};
use cowfs_block::Buffer;
use cowfs_error::{FsError, Result};
use cowfs_ondisk::{
    BTNODE_FIXED_KV_SIZE, BTNODE_LEAF, BTNODE_ROOT, BTOFF_INVALID, BTREE_INFO_SIZE,
    BTREE_NODE_HDR_SIZE, BTREE_TOC_ENTRY_INCREMENT, BtreeInfo, Kvloc, Nloc, NodeHeader,
    ObjectHeader,
};
use cowfs_types::{
    BlockNumber, OBJECT_TYPE_BTREE, OBJECT_TYPE_BTREE_NODE, OBJECT_TYPE_FLAGS_MASK, ObjectId,
    ParseError, StorageClass, Xid, read_le_u16, read_le_u32, read_le_u64, usize_to_u16,
    write_le_u32,
};
use tracing::error;

/// A record as copied out of a node.
pub type Record = (Vec<u8>, Vec<u8>);

/// Outcome of an in-node insertion or replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Stored,
    /// The record does not fit even after defragmenting.
    NoRoom,
}

/// Handle on a B-tree node block.
///
/// Cheap to clone; clones share the underlying buffer.
#[derive(Debug, Clone)]
pub struct Node {
    buf: Buffer,
    oid: ObjectId,
    storage: StorageClass,
    family: KeyFamily,
}

/// Offsets derived from the node header.
struct Layout {
    toc_start: usize,
    key_start: usize,
    val_end: usize,
    fixed: Option<(u16, u16)>,
}

pub(crate) fn parse_err(block: BlockNumber, err: &ParseError) -> FsError {
    FsError::corruption(block.0, err.to_string())
}

/// Node flags for a tree of `family` at the given position.
#[must_use]
pub fn node_flags(family: KeyFamily, root: bool, leaf: bool) -> u16 {
    let mut flags = 0;
    if root {
        flags |= BTNODE_ROOT;
    }
    if leaf {
        flags |= BTNODE_LEAF;
    }
    if family.fixed_sizes(leaf).is_some() {
        flags |= BTNODE_FIXED_KV_SIZE;
    }
    flags
}

/// Bytes a root node of this block size offers to records before its table
/// of contents has to grow.
fn root_room(block_size: usize, fixed: bool) -> usize {
    let entry = if fixed {
        cowfs_ondisk::KVOFF_SIZE
    } else {
        cowfs_ondisk::KVLOC_SIZE
    };
    block_size
        .saturating_sub(BTREE_NODE_HDR_SIZE + BTREE_INFO_SIZE)
        .saturating_sub(BTREE_TOC_ENTRY_INCREMENT * entry)
}

/// Largest key plus value that fits in an empty root of this block size.
#[must_use]
pub fn max_record_size(block_size: usize, family: KeyFamily) -> usize {
    root_room(block_size, family.fixed_sizes(true).is_some())
}

/// Index records a root must hold at the key limit. Splitting a full index
/// node then leaves at least two children on each side, which bounds the
/// depth by the logarithm of the leaf count.
const MIN_INDEX_FANOUT: usize = 4;

/// Largest key for which a root index node still holds
/// [`MIN_INDEX_FANOUT`] index records.
#[must_use]
pub fn max_key_size(block_size: usize, family: KeyFamily) -> usize {
    let room = root_room(block_size, family.fixed_sizes(false).is_some());
    (room / MIN_INDEX_FANOUT).saturating_sub(CHILD_PTR_SIZE)
}

/// Tree info for a new, empty tree.
#[must_use]
pub fn empty_tree_info(family: KeyFamily, block_size: usize) -> BtreeInfo {
    let (key_size, val_size) = family.fixed_sizes(true).unwrap_or((0, 0));
    BtreeInfo {
        flags: 0,
        node_size: u32::try_from(block_size).unwrap_or(u32::MAX),
        key_size: key_size.into(),
        val_size: val_size.into(),
        longest_key: 0,
        longest_val: 0,
        key_count: 0,
        node_count: 1,
    }
}

impl Node {
    /// Interpret a block as a node, validating its headers.
    pub fn parse(buf: Buffer) -> Result<Self> {
        let block = buf.block();
        let data = buf.read();
        let obj = ObjectHeader::parse(&data).map_err(|e| parse_err(block, &e))?;
        let kind = obj.kind();
        if kind != OBJECT_TYPE_BTREE && kind != OBJECT_TYPE_BTREE_NODE {
            error!(
                invariant = "node.o_type",
                block = block.0,
                o_type = obj.obj_type,
                "btree_invariant_violation"
            );
            return Err(FsError::corruption(
                block.0,
                format!("object type {kind:#x} is not a b-tree node"),
            ));
        }
        let storage = obj.storage().map_err(|e| parse_err(block, &e))?;
        let hdr = NodeHeader::parse(&data).map_err(|e| parse_err(block, &e))?;
        hdr.validate(data.len()).map_err(|e| parse_err(block, &e))?;
        if hdr.is_root() != (kind == OBJECT_TYPE_BTREE) {
            return Err(FsError::corruption(
                block.0,
                "root flag disagrees with object type",
            ));
        }
        let family = KeyFamily::from_subtype(obj.subtype);
        if hdr.has_fixed_kv_size() != family.fixed_sizes(hdr.is_leaf()).is_some() {
            return Err(FsError::corruption(
                block.0,
                "fixed-size flag disagrees with record family",
            ));
        }
        drop(data);
        Ok(Self {
            buf,
            oid: obj.oid,
            storage,
            family,
        })
    }

    /// Lay out an empty node in `buf`, whose object header (oid, xid,
    /// storage and subtype) has already been written.
    pub fn format(buf: Buffer, root: bool, level: u16, info: Option<BtreeInfo>) -> Result<Self> {
        let block = buf.block();
        {
            let mut data = buf.write();
            let obj = ObjectHeader::parse(&data).map_err(|e| parse_err(block, &e))?;
            let family = KeyFamily::from_subtype(obj.subtype);
            let kind = if root {
                OBJECT_TYPE_BTREE
            } else {
                OBJECT_TYPE_BTREE_NODE
            };
            write_le_u32(&mut data, 24, (obj.obj_type & OBJECT_TYPE_FLAGS_MASK) | kind)
                .map_err(|e| parse_err(block, &e))?;
            let flags = node_flags(family, root, level == 0);
            write_empty_layout(&mut data, flags, level).map_err(|e| parse_err(block, &e))?;
            if root {
                let info = info.unwrap_or_default();
                info.write(&mut data).map_err(|e| parse_err(block, &e))?;
            }
        }
        Self::parse(buf)
    }

    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.buf.block()
    }

    #[must_use]
    pub fn oid(&self) -> ObjectId {
        self.oid
    }

    #[must_use]
    pub fn storage(&self) -> StorageClass {
        self.storage
    }

    #[must_use]
    pub fn family(&self) -> KeyFamily {
        self.family
    }

    #[must_use]
    pub fn buffer(&self) -> &Buffer {
        &self.buf
    }

    #[must_use]
    pub fn xid(&self) -> Xid {
        Xid(read_le_u64(&self.buf.read(), 16).unwrap_or_default())
    }

    #[must_use]
    pub fn subtype(&self) -> u32 {
        read_le_u32(&self.buf.read(), 28).unwrap_or_default()
    }

    fn flags(&self) -> u16 {
        read_le_u16(&self.buf.read(), 32).unwrap_or_default()
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.flags() & BTNODE_ROOT != 0
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.flags() & BTNODE_LEAF != 0
    }

    #[must_use]
    pub fn level(&self) -> u16 {
        read_le_u16(&self.buf.read(), 34).unwrap_or_default()
    }

    /// Number of records.
    #[must_use]
    pub fn records(&self) -> u32 {
        read_le_u32(&self.buf.read(), 36).unwrap_or_default()
    }

    pub fn header(&self) -> Result<NodeHeader> {
        NodeHeader::parse(&self.buf.read()).map_err(|e| parse_err(self.block(), &e))
    }

    /// Tree info of a root node.
    pub fn info(&self) -> Result<BtreeInfo> {
        if !self.is_root() {
            return Err(FsError::corruption(self.block().0, "tree info read from non-root node"));
        }
        BtreeInfo::parse(&self.buf.read()).map_err(|e| parse_err(self.block(), &e))
    }

    pub fn set_info(&self, info: &BtreeInfo) -> Result<()> {
        self.check_writable()?;
        if !self.is_root() {
            return Err(FsError::corruption(self.block().0, "tree info written to non-root node"));
        }
        info.write(&mut self.buf.write())
            .map_err(|e| parse_err(self.block(), &e))
    }

    // ── Record access ───────────────────────────────────────────────────────

    fn layout(&self, data: &[u8], hdr: &NodeHeader) -> Result<Layout> {
        let toc_start = BTREE_NODE_HDR_SIZE + usize::from(hdr.table_space.off);
        let key_start = toc_start + usize::from(hdr.table_space.len);
        let trailer = if hdr.is_root() { BTREE_INFO_SIZE } else { 0 };
        let val_end = data.len().saturating_sub(trailer);
        let fixed = if hdr.has_fixed_kv_size() {
            Some(self.family.fixed_sizes(hdr.is_leaf()).ok_or_else(|| {
                FsError::corruption(self.block().0, "fixed-size node in variable-size tree")
            })?)
        } else {
            None
        };
        if key_start > val_end {
            return Err(FsError::corruption(self.block().0, "table of contents overruns node"));
        }
        Ok(Layout {
            toc_start,
            key_start,
            val_end,
            fixed,
        })
    }

    fn entry(&self, data: &[u8], layout: &Layout, index: usize) -> Result<Kvloc> {
        Kvloc::parse(&data[layout.toc_start..layout.key_start], index, layout.fixed)
            .map_err(|e| parse_err(self.block(), &e))
    }

    fn key_range(&self, layout: &Layout, loc: &Kvloc) -> Result<std::ops::Range<usize>> {
        let start = layout.key_start + usize::from(loc.k.off);
        let end = start + usize::from(loc.k.len);
        if end > layout.val_end {
            error!(
                invariant = "key_range<=val_end",
                block = self.block().0,
                key_off = loc.k.off,
                key_len = loc.k.len,
                "btree_invariant_violation"
            );
            return Err(FsError::corruption(self.block().0, "key lies outside the node"));
        }
        Ok(start..end)
    }

    fn val_range(&self, layout: &Layout, loc: &Kvloc) -> Result<std::ops::Range<usize>> {
        if loc.is_ghost() {
            return Ok(layout.val_end..layout.val_end);
        }
        let off = usize::from(loc.v.off);
        let len = usize::from(loc.v.len);
        if off > layout.val_end - layout.key_start || len > off {
            error!(
                invariant = "val_range>=key_start",
                block = self.block().0,
                val_off = loc.v.off,
                val_len = loc.v.len,
                "btree_invariant_violation"
            );
            return Err(FsError::corruption(self.block().0, "value lies outside the node"));
        }
        let start = layout.val_end - off;
        Ok(start..start + len)
    }

    fn check_index(&self, index: usize, records: usize) -> Result<()> {
        if index >= records {
            return Err(FsError::corruption(
                self.block().0,
                format!("record index {index} out of range ({records} records)"),
            ));
        }
        Ok(())
    }

    pub fn key(&self, index: usize) -> Result<Vec<u8>> {
        let data = self.buf.read();
        let hdr = NodeHeader::parse(&data).map_err(|e| parse_err(self.block(), &e))?;
        self.check_index(index, hdr.nkeys as usize)?;
        let layout = self.layout(&data, &hdr)?;
        let loc = self.entry(&data, &layout, index)?;
        Ok(data[self.key_range(&layout, &loc)?].to_vec())
    }

    pub fn value(&self, index: usize) -> Result<Vec<u8>> {
        let data = self.buf.read();
        let hdr = NodeHeader::parse(&data).map_err(|e| parse_err(self.block(), &e))?;
        self.check_index(index, hdr.nkeys as usize)?;
        let layout = self.layout(&data, &hdr)?;
        let loc = self.entry(&data, &layout, index)?;
        Ok(data[self.val_range(&layout, &loc)?].to_vec())
    }

    pub fn record(&self, index: usize) -> Result<Record> {
        Ok((self.key(index)?, self.value(index)?))
    }

    /// Every record, in order.
    pub fn all_records(&self) -> Result<Vec<Record>> {
        let data = self.buf.read();
        let hdr = NodeHeader::parse(&data).map_err(|e| parse_err(self.block(), &e))?;
        let layout = self.layout(&data, &hdr)?;
        (0..hdr.nkeys as usize)
            .map(|i| {
                let loc = self.entry(&data, &layout, i)?;
                Ok((
                    data[self.key_range(&layout, &loc)?].to_vec(),
                    data[self.val_range(&layout, &loc)?].to_vec(),
                ))
            })
            .collect()
    }

    /// Child id stored in an index record.
    pub fn child_id(&self, index: usize) -> Result<ObjectId> {
        let val = self.value(index)?;
        if val.len() != CHILD_PTR_SIZE {
            error!(
                invariant = "index_value_len==8",
                block = self.block().0,
                index,
                len = val.len(),
                "btree_invariant_violation"
            );
            return Err(FsError::corruption(
                self.block().0,
                format!("bad index record: value is {} bytes", val.len()),
            ));
        }
        Ok(ObjectId(read_le_u64(&val, 0).map_err(|e| parse_err(self.block(), &e))?))
    }

    // ── Mutation ────────────────────────────────────────────────────────────

    fn check_writable(&self) -> Result<()> {
        if !self.buf.in_transaction() {
            error!(
                invariant = "node_in_transaction",
                block = self.block().0,
                "btree_invariant_violation"
            );
            return Err(FsError::corruption(
                self.block().0,
                "node modified outside the active transaction",
            ));
        }
        Ok(())
    }

    fn check_sizes(&self, layout: &Layout, key_len: usize, val_len: usize) -> Result<()> {
        if key_len == 0 {
            return Err(FsError::Format("empty b-tree key".to_owned()));
        }
        if let Some((k, v)) = layout.fixed {
            if key_len != usize::from(k) || (val_len != usize::from(v) && val_len != 0) {
                return Err(FsError::corruption(
                    self.block().0,
                    format!("record {key_len}/{val_len} does not match fixed sizes {k}/{v}"),
                ));
            }
        }
        Ok(())
    }

    /// Insert a record so that it becomes record `index`.
    pub fn insert_at(&self, index: usize, key: &[u8], val: &[u8]) -> Result<Placement> {
        self.check_writable()?;
        let block = self.block();
        let mut data = self.buf.write();
        let mut hdr = NodeHeader::parse(&data).map_err(|e| parse_err(block, &e))?;
        let layout = self.layout(&data, &hdr)?;
        self.check_sizes(&layout, key.len(), val.len())?;
        let records = hdr.nkeys as usize;
        if index > records {
            return Err(FsError::corruption(
                block.0,
                format!("insert position {index} beyond {records} records"),
            ));
        }

        let esz = hdr.toc_entry_size();
        let toc_cap = usize::from(hdr.table_space.len) / esz;
        let free = usize::from(hdr.free_space.len);
        if records + 1 > toc_cap || key.len() + val.len() > free {
            drop(data);
            let mut all = self.all_records()?;
            all.insert(index, (key.to_vec(), val.to_vec()));
            return self.rebuild(&all, hdr.flags, hdr.level);
        }

        let toc = layout.toc_start;
        data.copy_within(toc + index * esz..toc + records * esz, toc + (index + 1) * esz);

        let k_off = hdr.free_space.off;
        let k_start = layout.key_start + usize::from(k_off);
        data[k_start..k_start + key.len()].copy_from_slice(key);
        let mut remaining = free - key.len();
        let free_off = usize::from(k_off) + key.len();

        let v = if val.is_empty() {
            Nloc {
                off: BTOFF_INVALID,
                len: 0,
            }
        } else {
            let v_start = layout.key_start + free_off + remaining - val.len();
            data[v_start..v_start + val.len()].copy_from_slice(val);
            remaining -= val.len();
            Nloc {
                off: to_u16(block, layout.val_end - v_start)?,
                len: to_u16(block, val.len())?,
            }
        };
        let loc = Kvloc {
            k: Nloc {
                off: k_off,
                len: to_u16(block, key.len())?,
            },
            v,
        };
        loc.write(&mut data[toc..layout.key_start], index, layout.fixed.is_some())
            .map_err(|e| parse_err(block, &e))?;

        hdr.free_space = Nloc {
            off: to_u16(block, free_off)?,
            len: to_u16(block, remaining)?,
        };
        hdr.nkeys += 1;
        hdr.write(&mut data).map_err(|e| parse_err(block, &e))?;
        Ok(Placement::Stored)
    }

    /// Replace the key and/or value of record `index`. `None` keeps the
    /// current one. The caller guarantees the new key keeps the order.
    pub fn replace_at(&self, index: usize, key: Option<&[u8]>, val: Option<&[u8]>) -> Result<Placement> {
        self.check_writable()?;
        let block = self.block();
        let mut data = self.buf.write();
        let mut hdr = NodeHeader::parse(&data).map_err(|e| parse_err(block, &e))?;
        self.check_index(index, hdr.nkeys as usize)?;
        let layout = self.layout(&data, &hdr)?;
        let mut loc = self.entry(&data, &layout, index)?;
        let old_key = self.key_range(&layout, &loc)?;
        let old_val = self.val_range(&layout, &loc)?;
        self.check_sizes(
            &layout,
            key.map_or(old_key.len(), <[u8]>::len),
            val.map_or(old_val.len(), <[u8]>::len),
        )?;

        // Bytes needed from contiguous free space for anything that grows.
        let key_grows = key.is_some_and(|k| k.len() > old_key.len());
        let val_grows = val.is_some_and(|v| v.len() > old_val.len());
        let needed = if key_grows { key.map_or(0, <[u8]>::len) } else { 0 }
            + if val_grows { val.map_or(0, <[u8]>::len) } else { 0 };
        if needed > usize::from(hdr.free_space.len) {
            drop(data);
            let mut all = self.all_records()?;
            if let Some(k) = key {
                all[index].0 = k.to_vec();
            }
            if let Some(v) = val {
                all[index].1 = v.to_vec();
            }
            return self.rebuild(&all, hdr.flags, hdr.level);
        }

        let mut key_holes = usize::from(hdr.key_free_list.len);
        let mut val_holes = usize::from(hdr.val_free_list.len);
        let mut free_off = usize::from(hdr.free_space.off);
        let mut free_len = usize::from(hdr.free_space.len);

        if let Some(k) = key {
            if key_grows {
                let start = layout.key_start + free_off;
                data[start..start + k.len()].copy_from_slice(k);
                key_holes += old_key.len();
                loc.k.off = to_u16(block, free_off)?;
                free_off += k.len();
                free_len -= k.len();
            } else {
                data[old_key.start..old_key.start + k.len()].copy_from_slice(k);
                key_holes += old_key.len() - k.len();
            }
            loc.k.len = to_u16(block, k.len())?;
        }

        if let Some(v) = val {
            if v.is_empty() {
                val_holes += old_val.len();
                loc.v = Nloc {
                    off: BTOFF_INVALID,
                    len: 0,
                };
            } else if val_grows {
                let start = layout.key_start + free_off + free_len - v.len();
                data[start..start + v.len()].copy_from_slice(v);
                val_holes += old_val.len();
                free_len -= v.len();
                loc.v = Nloc {
                    off: to_u16(block, layout.val_end - start)?,
                    len: to_u16(block, v.len())?,
                };
            } else {
                data[old_val.start..old_val.start + v.len()].copy_from_slice(v);
                val_holes += old_val.len() - v.len();
                loc.v.len = to_u16(block, v.len())?;
            }
        }

        loc.write(&mut data[layout.toc_start..layout.key_start], index, layout.fixed.is_some())
            .map_err(|e| parse_err(block, &e))?;
        hdr.free_space = Nloc {
            off: to_u16(block, free_off)?,
            len: to_u16(block, free_len)?,
        };
        hdr.key_free_list = hole_list(block, key_holes)?;
        hdr.val_free_list = hole_list(block, val_holes)?;
        hdr.write(&mut data).map_err(|e| parse_err(block, &e))?;
        Ok(Placement::Stored)
    }

    /// Remove record `index`, counting its key and value bytes as holes.
    pub fn remove_at(&self, index: usize) -> Result<()> {
        self.check_writable()?;
        let block = self.block();
        let mut data = self.buf.write();
        let mut hdr = NodeHeader::parse(&data).map_err(|e| parse_err(block, &e))?;
        let records = hdr.nkeys as usize;
        self.check_index(index, records)?;
        let layout = self.layout(&data, &hdr)?;
        let loc = self.entry(&data, &layout, index)?;
        let key_len = self.key_range(&layout, &loc)?.len();
        let val_len = self.val_range(&layout, &loc)?.len();

        let esz = hdr.toc_entry_size();
        let toc = layout.toc_start;
        data.copy_within(toc + (index + 1) * esz..toc + records * esz, toc + index * esz);
        data[toc + (records - 1) * esz..toc + records * esz].fill(0);

        hdr.key_free_list = hole_list(block, usize::from(hdr.key_free_list.len) + key_len)?;
        hdr.val_free_list = hole_list(block, usize::from(hdr.val_free_list.len) + val_len)?;
        hdr.nkeys -= 1;
        hdr.write(&mut data).map_err(|e| parse_err(block, &e))
    }

    /// Rewrite the node compactly with exactly `records`, keeping its
    /// flags and level. Leaves the node untouched on [`Placement::NoRoom`].
    pub fn rebuild(&self, records: &[Record], flags: u16, level: u16) -> Result<Placement> {
        self.check_writable()?;
        let block = self.block();
        let mut data = self.buf.write();
        let root = flags & BTNODE_ROOT != 0;
        let leaf = flags & BTNODE_LEAF != 0;
        let fixed = if flags & BTNODE_FIXED_KV_SIZE != 0 {
            self.family.fixed_sizes(leaf)
        } else {
            None
        };
        let esz = if fixed.is_some() {
            cowfs_ondisk::KVOFF_SIZE
        } else {
            cowfs_ondisk::KVLOC_SIZE
        };
        let toc_entries = records
            .len()
            .div_ceil(BTREE_TOC_ENTRY_INCREMENT)
            .max(1)
            * BTREE_TOC_ENTRY_INCREMENT;
        let toc_len = toc_entries * esz;
        let key_start = BTREE_NODE_HDR_SIZE + toc_len;
        let val_end = data.len() - if root { BTREE_INFO_SIZE } else { 0 };
        let keys: usize = records.iter().map(|(k, _)| k.len()).sum();
        let vals: usize = records.iter().map(|(_, v)| v.len()).sum();
        if key_start + keys + vals > val_end {
            return Ok(Placement::NoRoom);
        }

        data[BTREE_NODE_HDR_SIZE..val_end].fill(0);
        let mut k_off = 0_usize;
        let mut v_off = 0_usize;
        for (i, (key, val)) in records.iter().enumerate() {
            data[key_start + k_off..key_start + k_off + key.len()].copy_from_slice(key);
            let v = if val.is_empty() {
                Nloc {
                    off: BTOFF_INVALID,
                    len: 0,
                }
            } else {
                v_off += val.len();
                data[val_end - v_off..val_end - v_off + val.len()].copy_from_slice(val);
                Nloc {
                    off: to_u16(block, v_off)?,
                    len: to_u16(block, val.len())?,
                }
            };
            let loc = Kvloc {
                k: Nloc {
                    off: to_u16(block, k_off)?,
                    len: to_u16(block, key.len())?,
                },
                v,
            };
            loc.write(&mut data[BTREE_NODE_HDR_SIZE..key_start], i, fixed.is_some())
                .map_err(|e| parse_err(block, &e))?;
            k_off += key.len();
        }

        let hdr = NodeHeader {
            flags,
            level,
            nkeys: u32::try_from(records.len())
                .map_err(|_| FsError::corruption(block.0, "record count overflow"))?,
            table_space: Nloc {
                off: 0,
                len: to_u16(block, toc_len)?,
            },
            free_space: Nloc {
                off: to_u16(block, keys)?,
                len: to_u16(block, val_end - key_start - keys - vals)?,
            },
            key_free_list: hole_list(block, 0)?,
            val_free_list: hole_list(block, 0)?,
        };
        hdr.write(&mut data).map_err(|e| parse_err(block, &e))?;
        Ok(Placement::Stored)
    }

    /// Keep records `[0, at)` and return the rest, which the caller moves to
    /// a new sibling.
    pub fn split_off(&self, at: usize) -> Result<Vec<Record>> {
        let hdr = self.header()?;
        let mut all = self.all_records()?;
        if at > all.len() {
            return Err(FsError::corruption(self.block().0, "split point beyond records"));
        }
        let tail = all.split_off(at);
        match self.rebuild(&all, hdr.flags, hdr.level)? {
            Placement::Stored => Ok(tail),
            Placement::NoRoom => Err(FsError::corruption(
                self.block().0,
                "shrinking rebuild did not fit",
            )),
        }
    }

    /// Total bytes available to records: contiguous free space plus holes.
    pub fn free_bytes(&self) -> Result<usize> {
        let hdr = self.header()?;
        Ok(usize::from(hdr.free_space.len)
            + usize::from(hdr.key_free_list.len)
            + usize::from(hdr.val_free_list.len))
    }
}

fn to_u16(block: BlockNumber, value: usize) -> Result<u16> {
    usize_to_u16(value, "node offset").map_err(|e| parse_err(block, &e))
}

fn hole_list(block: BlockNumber, bytes: usize) -> Result<Nloc> {
    Ok(Nloc {
        off: BTOFF_INVALID,
        len: to_u16(block, bytes)?,
    })
}

fn write_empty_layout(data: &mut [u8], flags: u16, level: u16) -> std::result::Result<(), ParseError> {
    let root = flags & BTNODE_ROOT != 0;
    let esz = if flags & BTNODE_FIXED_KV_SIZE != 0 {
        cowfs_ondisk::KVOFF_SIZE
    } else {
        cowfs_ondisk::KVLOC_SIZE
    };
    let toc_len = BTREE_TOC_ENTRY_INCREMENT * esz;
    let val_end = data.len() - if root { BTREE_INFO_SIZE } else { 0 };
    data[BTREE_NODE_HDR_SIZE..val_end].fill(0);
    let hdr = NodeHeader {
        flags,
        level,
        nkeys: 0,
        table_space: Nloc {
            off: 0,
            len: usize_to_u16(toc_len, "table_space")?,
        },
        free_space: Nloc {
            off: 0,
            len: usize_to_u16(val_end - BTREE_NODE_HDR_SIZE - toc_len, "free_space")?,
        },
        key_free_list: Nloc {
            off: BTOFF_INVALID,
            len: 0,
        },
        val_free_list: Nloc {
            off: BTOFF_INVALID,
            len: 0,
        },
    };
    hdr.write(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cowfs_ondisk::{OBJECT_HEADER_SIZE, OmapKey, OmapVal};
    use cowfs_types::{OBJ_PHYSICAL, OBJ_VIRTUAL, OBJECT_TYPE_OMAP, OBJECT_TYPE_TEST};

    fn blank(block: u64, subtype: u32, storage: u32) -> Buffer {
        let buf = Buffer::detached(BlockNumber(block), vec![0_u8; 1024]);
        {
            let mut data = buf.write();
            let hdr = ObjectHeader {
                cksum: 0,
                oid: ObjectId(block),
                xid: Xid(1),
                obj_type: OBJECT_TYPE_BTREE_NODE | storage,
                subtype,
            };
            hdr.write(&mut data[..OBJECT_HEADER_SIZE]).expect("header");
        }
        buf.set_in_transaction(true);
        buf
    }

    fn bytes_node(root: bool) -> Node {
        Node::format(blank(10, OBJECT_TYPE_TEST, OBJ_VIRTUAL), root, 0, None).expect("format")
    }

    #[test]
    fn format_produces_empty_leaf() {
        let node = bytes_node(true);
        assert!(node.is_root());
        assert!(node.is_leaf());
        assert_eq!(node.records(), 0);
        assert_eq!(node.family(), KeyFamily::Bytes);
        assert_eq!(node.storage(), StorageClass::Virtual);
        assert_eq!(
            node.free_bytes().expect("free"),
            1024 - BTREE_NODE_HDR_SIZE - BTREE_INFO_SIZE - 64
        );
    }

    #[test]
    fn insert_keeps_slot_order() {
        let node = bytes_node(false);
        assert_eq!(node.insert_at(0, b"m", b"13").expect("insert"), Placement::Stored);
        assert_eq!(node.insert_at(0, b"a", b"1").expect("insert"), Placement::Stored);
        assert_eq!(node.insert_at(2, b"z", b"").expect("insert"), Placement::Stored);
        assert_eq!(node.records(), 3);
        assert_eq!(node.record(0).expect("rec"), (b"a".to_vec(), b"1".to_vec()));
        assert_eq!(node.record(1).expect("rec"), (b"m".to_vec(), b"13".to_vec()));
        assert_eq!(node.record(2).expect("rec"), (b"z".to_vec(), Vec::new()));
    }

    #[test]
    fn toc_grows_past_eight_entries() {
        let node = bytes_node(false);
        for i in 0..20_u8 {
            let placed = node.insert_at(usize::from(i), &[b'k', i], &[i; 3]).expect("insert");
            assert_eq!(placed, Placement::Stored);
        }
        let hdr = node.header().expect("hdr");
        assert_eq!(usize::from(hdr.table_space.len), 24 * cowfs_ondisk::KVLOC_SIZE);
        for i in 0..20_u8 {
            assert_eq!(node.value(usize::from(i)).expect("val"), vec![i; 3]);
        }
    }

    #[test]
    fn remove_counts_holes_and_rebuild_reclaims_them() {
        let node = bytes_node(false);
        node.insert_at(0, b"aa", b"xxxx").expect("insert");
        node.insert_at(1, b"bb", b"yyyy").expect("insert");
        let before = node.header().expect("hdr").free_space.len;
        node.remove_at(0).expect("remove");
        let hdr = node.header().expect("hdr");
        assert_eq!(hdr.free_space.len, before);
        assert_eq!(hdr.key_free_list.len, 2);
        assert_eq!(hdr.val_free_list.len, 4);
        assert_eq!(node.record(0).expect("rec").0, b"bb".to_vec());

        let all = node.all_records().expect("records");
        node.rebuild(&all, hdr.flags, hdr.level).expect("rebuild");
        let hdr = node.header().expect("hdr");
        assert_eq!(hdr.key_free_list.len, 0);
        assert_eq!(hdr.free_space.len, before + 6);
    }

    #[test]
    fn full_node_defragments_before_refusing() {
        let node = bytes_node(false);
        let big = vec![7_u8; 300];
        node.insert_at(0, b"a", &big).expect("insert");
        node.insert_at(1, b"b", &big).expect("insert");
        node.insert_at(2, b"c", &big).expect("insert");
        assert_eq!(node.insert_at(3, b"d", &big).expect("insert"), Placement::NoRoom);
        node.remove_at(1).expect("remove");
        assert_eq!(node.insert_at(2, b"d", &big).expect("insert"), Placement::Stored);
        let keys: Vec<Vec<u8>> = node
            .all_records()
            .expect("records")
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"c".to_vec(), b"d".to_vec()]);
    }

    #[test]
    fn replace_shrink_grow_and_ghost() {
        let node = bytes_node(false);
        node.insert_at(0, b"key", b"value").expect("insert");
        node.replace_at(0, None, Some(b"v")).expect("shrink");
        assert_eq!(node.value(0).expect("val"), b"v".to_vec());
        node.replace_at(0, None, Some(b"a much longer value")).expect("grow");
        assert_eq!(node.value(0).expect("val"), b"a much longer value".to_vec());
        node.replace_at(0, Some(b"kez"), Some(b"")).expect("ghost");
        assert_eq!(node.record(0).expect("rec"), (b"kez".to_vec(), Vec::new()));
        node.replace_at(0, None, Some(b"back")).expect("unghost");
        assert_eq!(node.value(0).expect("val"), b"back".to_vec());
    }

    #[test]
    fn split_off_moves_tail() {
        let node = bytes_node(false);
        for i in 0..6_u8 {
            node.insert_at(usize::from(i), &[i + 1], &[i]).expect("insert");
        }
        let tail = node.split_off(3).expect("split");
        assert_eq!(node.records(), 3);
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].0, vec![4]);
    }

    #[test]
    fn mutation_requires_transaction() {
        let node = bytes_node(false);
        node.buffer().set_in_transaction(false);
        let err = node.insert_at(0, b"a", b"b").unwrap_err();
        assert!(matches!(err, FsError::Corruption { .. }));
    }

    #[test]
    fn fixed_size_object_map_node() {
        let buf = blank(20, OBJECT_TYPE_OMAP, OBJ_PHYSICAL);
        let node = Node::format(buf, true, 0, None).expect("format");
        let hdr = node.header().expect("hdr");
        assert!(hdr.has_fixed_kv_size());
        let key = OmapKey::new(ObjectId(1030), Xid(4)).to_bytes();
        let val = OmapVal {
            flags: 0,
            size: 1024,
            paddr: BlockNumber(99),
        }
        .to_bytes();
        node.insert_at(0, &key, &val).expect("insert");
        assert_eq!(node.value(0).expect("val"), val.to_vec());
        assert!(node.insert_at(1, &key[..8], &val).is_err());
    }

    #[test]
    fn corrupt_value_offset_is_reported() {
        let node = bytes_node(false);
        node.insert_at(0, b"a", b"bcd").expect("insert");
        {
            let mut data = node.buffer().write();
            // kvloc 0: v.off lives at toc+4
            data[BTREE_NODE_HDR_SIZE + 4..BTREE_NODE_HDR_SIZE + 6]
                .copy_from_slice(&2000_u16.to_le_bytes());
        }
        assert!(matches!(node.value(0), Err(FsError::Corruption { .. })));
    }

    #[test]
    fn non_node_object_is_rejected() {
        let buf = Buffer::detached(BlockNumber(3), vec![0_u8; 1024]);
        assert!(Node::parse(buf).is_err());
    }

    #[test]
    fn key_limit_leaves_room_for_four_index_records() {
        let limit = max_key_size(1024, KeyFamily::Bytes);
        let room = 1024 - BTREE_NODE_HDR_SIZE - BTREE_INFO_SIZE - 64;
        assert_eq!(limit, room / 4 - CHILD_PTR_SIZE);

        let buf = blank(30, OBJECT_TYPE_TEST, OBJ_VIRTUAL);
        let root = Node::format(buf, true, 1, None).expect("format");
        let hdr = root.header().expect("hdr");
        let mut index: Vec<Record> = (1..=4_u8)
            .map(|b| (vec![b; limit], 7_u64.to_le_bytes().to_vec()))
            .collect();
        let placed = root.rebuild(&index, hdr.flags, hdr.level).expect("rebuild");
        assert_eq!(placed, Placement::Stored);

        index[0].0.push(0);
        let placed = root.rebuild(&index, hdr.flags, hdr.level).expect("rebuild");
        assert_eq!(placed, Placement::NoRoom);
    }

    #[test]
    fn record_limit_accounts_for_root_trailer() {
        assert_eq!(
            max_record_size(4096, KeyFamily::Bytes),
            4096 - BTREE_NODE_HDR_SIZE - BTREE_INFO_SIZE - 64
        );
        assert_eq!(
            max_record_size(4096, KeyFamily::ObjectMap),
            4096 - BTREE_NODE_HDR_SIZE - BTREE_INFO_SIZE - 32
        );
    }
}
