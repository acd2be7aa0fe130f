#![forbid(unsafe_code)]
//! B-tree node header, tree info trailer and table-of-contents entries.

use cowfs_types::{
    ParseError, read_le_u16, read_le_u32, read_le_u64, write_le_u16, write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};

pub const BTNODE_ROOT: u16 = 0x0001;
pub const BTNODE_LEAF: u16 = 0x0002;
pub const BTNODE_FIXED_KV_SIZE: u16 = 0x0004;

/// Object header plus the node header fields.
pub const BTREE_NODE_HDR_SIZE: usize = 56;
/// Tree info trailer stored at the end of root nodes.
pub const BTREE_INFO_SIZE: usize = 40;
/// Offset of the value stored in place of a ghost record's value.
pub const BTOFF_INVALID: u16 = 0xffff;
/// Table of contents growth step, in entries.
pub const BTREE_TOC_ENTRY_INCREMENT: usize = 8;

pub const KVOFF_SIZE: usize = 4;
pub const KVLOC_SIZE: usize = 8;

/// Offset/length pair inside a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nloc {
    pub off: u16,
    pub len: u16,
}

impl Nloc {
    fn parse(block: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            off: read_le_u16(block, offset)?,
            len: read_le_u16(block, offset + 2)?,
        })
    }

    fn write(self, block: &mut [u8], offset: usize) -> Result<(), ParseError> {
        write_le_u16(block, offset, self.off)?;
        write_le_u16(block, offset + 2, self.len)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHeader {
    pub flags: u16,
    pub level: u16,
    pub nkeys: u32,
    pub table_space: Nloc,
    pub free_space: Nloc,
    pub key_free_list: Nloc,
    pub val_free_list: Nloc,
}

impl NodeHeader {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        if block.len() < BTREE_NODE_HDR_SIZE {
            return Err(ParseError::InsufficientData {
                needed: BTREE_NODE_HDR_SIZE,
                offset: 0,
                actual: block.len(),
            });
        }
        Ok(Self {
            flags: read_le_u16(block, 32)?,
            level: read_le_u16(block, 34)?,
            nkeys: read_le_u32(block, 36)?,
            table_space: Nloc::parse(block, 40)?,
            free_space: Nloc::parse(block, 44)?,
            key_free_list: Nloc::parse(block, 48)?,
            val_free_list: Nloc::parse(block, 52)?,
        })
    }

    pub fn write(&self, block: &mut [u8]) -> Result<(), ParseError> {
        write_le_u16(block, 32, self.flags)?;
        write_le_u16(block, 34, self.level)?;
        write_le_u32(block, 36, self.nkeys)?;
        self.table_space.write(block, 40)?;
        self.free_space.write(block, 44)?;
        self.key_free_list.write(block, 48)?;
        self.val_free_list.write(block, 52)
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.flags & BTNODE_ROOT != 0
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.flags & BTNODE_LEAF != 0
    }

    #[must_use]
    pub fn has_fixed_kv_size(&self) -> bool {
        self.flags & BTNODE_FIXED_KV_SIZE != 0
    }

    /// Size of one table of contents entry for this node.
    #[must_use]
    pub fn toc_entry_size(&self) -> usize {
        if self.has_fixed_kv_size() {
            KVOFF_SIZE
        } else {
            KVLOC_SIZE
        }
    }

    /// Check that the header describes a layout that fits in `block_size`.
    pub fn validate(&self, block_size: usize) -> Result<(), ParseError> {
        if self.is_leaf() != (self.level == 0) {
            return Err(ParseError::InvalidField {
                field: "btn_level",
                reason: "leaf flag disagrees with level",
            });
        }
        let trailer = if self.is_root() { BTREE_INFO_SIZE } else { 0 };
        let area = block_size
            .checked_sub(BTREE_NODE_HDR_SIZE + trailer)
            .ok_or(ParseError::InvalidField {
                field: "block_size",
                reason: "too small for a node",
            })?;
        let toc_end = usize::from(self.table_space.off) + usize::from(self.table_space.len);
        let free_end = usize::from(self.free_space.off) + usize::from(self.free_space.len);
        if toc_end > area {
            return Err(ParseError::InvalidField {
                field: "btn_table_space",
                reason: "table of contents overruns node",
            });
        }
        if free_end > area - toc_end {
            return Err(ParseError::InvalidField {
                field: "btn_free_space",
                reason: "free space overruns node",
            });
        }
        let capacity = usize::from(self.table_space.len) / self.toc_entry_size();
        let nkeys = usize::try_from(self.nkeys)
            .map_err(|_| ParseError::IntegerConversion { field: "btn_nkeys" })?;
        if nkeys > capacity {
            return Err(ParseError::InvalidField {
                field: "btn_nkeys",
                reason: "record count exceeds table of contents",
            });
        }
        Ok(())
    }
}

/// Table of contents entry: key and value locations.
///
/// Key offsets count forward from the start of the key area; value offsets
/// count backward from the end of the value area. For fixed-size trees only
/// the offsets are stored and the lengths come from the tree info.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kvloc {
    pub k: Nloc,
    pub v: Nloc,
}

impl Kvloc {
    #[must_use]
    pub fn is_ghost(&self) -> bool {
        self.v.off == BTOFF_INVALID
    }

    pub fn parse(
        toc: &[u8],
        index: usize,
        fixed: Option<(u16, u16)>,
    ) -> Result<Self, ParseError> {
        match fixed {
            Some((key_size, val_size)) => {
                let at = index * KVOFF_SIZE;
                let k_off = read_le_u16(toc, at)?;
                let v_off = read_le_u16(toc, at + 2)?;
                let v_len = if v_off == BTOFF_INVALID { 0 } else { val_size };
                Ok(Self {
                    k: Nloc { off: k_off, len: key_size },
                    v: Nloc { off: v_off, len: v_len },
                })
            }
            None => {
                let at = index * KVLOC_SIZE;
                Ok(Self {
                    k: Nloc::parse(toc, at)?,
                    v: Nloc::parse(toc, at + 4)?,
                })
            }
        }
    }

    pub fn write(&self, toc: &mut [u8], index: usize, fixed: bool) -> Result<(), ParseError> {
        if fixed {
            let at = index * KVOFF_SIZE;
            write_le_u16(toc, at, self.k.off)?;
            write_le_u16(toc, at + 2, self.v.off)
        } else {
            let at = index * KVLOC_SIZE;
            self.k.write(toc, at)?;
            self.v.write(toc, at + 4)
        }
    }
}

/// Tree-wide information kept in the root node's trailer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtreeInfo {
    pub flags: u32,
    pub node_size: u32,
    pub key_size: u32,
    pub val_size: u32,
    pub longest_key: u32,
    pub longest_val: u32,
    pub key_count: u64,
    pub node_count: u64,
}

impl BtreeInfo {
    /// Parse the trailer of a root block.
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let at = block
            .len()
            .checked_sub(BTREE_INFO_SIZE)
            .ok_or(ParseError::InsufficientData {
                needed: BTREE_INFO_SIZE,
                offset: 0,
                actual: block.len(),
            })?;
        Ok(Self {
            flags: read_le_u32(block, at)?,
            node_size: read_le_u32(block, at + 4)?,
            key_size: read_le_u32(block, at + 8)?,
            val_size: read_le_u32(block, at + 12)?,
            longest_key: read_le_u32(block, at + 16)?,
            longest_val: read_le_u32(block, at + 20)?,
            key_count: read_le_u64(block, at + 24)?,
            node_count: read_le_u64(block, at + 32)?,
        })
    }

    pub fn write(&self, block: &mut [u8]) -> Result<(), ParseError> {
        let at = block
            .len()
            .checked_sub(BTREE_INFO_SIZE)
            .ok_or(ParseError::InsufficientData {
                needed: BTREE_INFO_SIZE,
                offset: 0,
                actual: block.len(),
            })?;
        write_le_u32(block, at, self.flags)?;
        write_le_u32(block, at + 4, self.node_size)?;
        write_le_u32(block, at + 8, self.key_size)?;
        write_le_u32(block, at + 12, self.val_size)?;
        write_le_u32(block, at + 16, self.longest_key)?;
        write_le_u32(block, at + 20, self.longest_val)?;
        write_le_u64(block, at + 24, self.key_count)?;
        write_le_u64(block, at + 32, self.node_count)
    }

    /// Fixed key and value sizes, when the tree uses them.
    #[must_use]
    pub fn fixed_sizes(&self) -> Option<(u16, u16)> {
        if self.key_size == 0 {
            return None;
        }
        Some((
            u16::try_from(self.key_size).ok()?,
            u16::try_from(self.val_size).ok()?,
        ))
    }
}
