#![forbid(unsafe_code)]
//! Container superblock.

use cowfs_types::{
    BlockNumber, NX_SUPERBLOCK_MAGIC, ObjectId, ParseError, Xid, read_le_u32, read_le_u64,
    write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};

/// Verify checksums of every node read.
pub const NX_FLAG_CHECK_NODES: u64 = 0x0000_0001;

const NX_SUPERBLOCK_SIZE: usize = 136;

/// Container superblock, stored at block 0 and copied into the checkpoint
/// descriptor area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub block_size: u32,
    pub block_count: u64,
    pub next_oid: ObjectId,
    pub next_xid: Xid,
    /// Physical block of the object-map root.
    pub omap_root: BlockNumber,
    /// Virtual id of the catalog root.
    pub catalog_root: ObjectId,
    pub desc_base: BlockNumber,
    pub desc_blocks: u32,
    pub desc_index: u32,
    pub desc_len: u32,
    pub data_base: BlockNumber,
    pub data_blocks: u32,
    pub data_index: u32,
    pub data_len: u32,
    pub flags: u64,
}

impl Superblock {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        if block.len() < NX_SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: NX_SUPERBLOCK_SIZE,
                offset: 0,
                actual: block.len(),
            });
        }
        let magic = read_le_u32(block, 32)?;
        if magic != NX_SUPERBLOCK_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(NX_SUPERBLOCK_MAGIC),
                actual: u64::from(magic),
            });
        }
        let sb = Self {
            block_size: read_le_u32(block, 36)?,
            block_count: read_le_u64(block, 40)?,
            next_oid: ObjectId(read_le_u64(block, 48)?),
            next_xid: Xid(read_le_u64(block, 56)?),
            omap_root: BlockNumber(read_le_u64(block, 64)?),
            catalog_root: ObjectId(read_le_u64(block, 72)?),
            desc_base: BlockNumber(read_le_u64(block, 80)?),
            desc_blocks: read_le_u32(block, 88)?,
            desc_index: read_le_u32(block, 92)?,
            desc_len: read_le_u32(block, 96)?,
            data_base: BlockNumber(read_le_u64(block, 104)?),
            data_blocks: read_le_u32(block, 112)?,
            data_index: read_le_u32(block, 116)?,
            data_len: read_le_u32(block, 120)?,
            flags: read_le_u64(block, 128)?,
        };
        sb.validate()?;
        Ok(sb)
    }

    pub fn write(&self, block: &mut [u8]) -> Result<(), ParseError> {
        write_le_u32(block, 32, NX_SUPERBLOCK_MAGIC)?;
        write_le_u32(block, 36, self.block_size)?;
        write_le_u64(block, 40, self.block_count)?;
        write_le_u64(block, 48, self.next_oid.0)?;
        write_le_u64(block, 56, self.next_xid.0)?;
        write_le_u64(block, 64, self.omap_root.0)?;
        write_le_u64(block, 72, self.catalog_root.0)?;
        write_le_u64(block, 80, self.desc_base.0)?;
        write_le_u32(block, 88, self.desc_blocks)?;
        write_le_u32(block, 92, self.desc_index)?;
        write_le_u32(block, 96, self.desc_len)?;
        write_le_u32(block, 100, 0)?;
        write_le_u64(block, 104, self.data_base.0)?;
        write_le_u32(block, 112, self.data_blocks)?;
        write_le_u32(block, 116, self.data_index)?;
        write_le_u32(block, 120, self.data_len)?;
        write_le_u32(block, 124, 0)?;
        write_le_u64(block, 128, self.flags)
    }

    /// Geometry checks that do not need the device.
    pub fn validate(&self) -> Result<(), ParseError> {
        if !self.block_size.is_power_of_two() || !(1024..=65536).contains(&self.block_size) {
            return Err(ParseError::InvalidField {
                field: "nx_block_size",
                reason: "must be a power of two in 1024..=65536",
            });
        }
        if self.desc_blocks == 0 || self.desc_len == 0 || self.desc_len > self.desc_blocks {
            return Err(ParseError::InvalidField {
                field: "nx_xp_desc_len",
                reason: "descriptor area is empty or overfull",
            });
        }
        if self.desc_index >= self.desc_blocks {
            return Err(ParseError::InvalidField {
                field: "nx_xp_desc_index",
                reason: "index outside descriptor area",
            });
        }
        if self.data_len > self.data_blocks
            || (self.data_blocks > 0 && self.data_index >= self.data_blocks)
        {
            return Err(ParseError::InvalidField {
                field: "nx_xp_data_len",
                reason: "data area range is inconsistent",
            });
        }
        let areas_end = [
            self.desc_base.0.checked_add(u64::from(self.desc_blocks)),
            self.data_base.0.checked_add(u64::from(self.data_blocks)),
        ];
        if areas_end
            .iter()
            .any(|end| end.is_none_or(|end| end > self.block_count))
        {
            return Err(ParseError::InvalidField {
                field: "nx_block_count",
                reason: "checkpoint areas extend past the container",
            });
        }
        if self.omap_root.0 == 0 || self.omap_root.0 >= self.block_count {
            return Err(ParseError::InvalidField {
                field: "nx_omap_oid",
                reason: "object map root outside the container",
            });
        }
        Ok(())
    }
}
