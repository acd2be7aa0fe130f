#![forbid(unsafe_code)]
//! Checkpoint-map block: ephemeral object id to block mappings.

use crate::object::OBJECT_HEADER_SIZE;
use cowfs_types::{
    BlockNumber, ObjectId, ParseError, read_le_u32, read_le_u64, u64_to_usize, write_le_u32,
    write_le_u64,
};
use serde::{Deserialize, Serialize};

const CPM_HEADER_SIZE: usize = 40;
const CPM_MAPPING_SIZE: usize = 40;

/// Flag on the last mapping block of a checkpoint.
pub const CHECKPOINT_MAP_LAST: u32 = 0x0000_0001;

/// Location of one ephemeral object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMapping {
    pub obj_type: u32,
    pub subtype: u32,
    pub size: u32,
    pub fs_oid: ObjectId,
    pub oid: ObjectId,
    pub paddr: BlockNumber,
}

impl CheckpointMapping {
    fn parse(block: &[u8], at: usize) -> Result<Self, ParseError> {
        Ok(Self {
            obj_type: read_le_u32(block, at)?,
            subtype: read_le_u32(block, at + 4)?,
            size: read_le_u32(block, at + 8)?,
            fs_oid: ObjectId(read_le_u64(block, at + 16)?),
            oid: ObjectId(read_le_u64(block, at + 24)?),
            paddr: BlockNumber(read_le_u64(block, at + 32)?),
        })
    }

    fn write(&self, block: &mut [u8], at: usize) -> Result<(), ParseError> {
        write_le_u32(block, at, self.obj_type)?;
        write_le_u32(block, at + 4, self.subtype)?;
        write_le_u32(block, at + 8, self.size)?;
        write_le_u32(block, at + 12, 0)?;
        write_le_u64(block, at + 16, self.fs_oid.0)?;
        write_le_u64(block, at + 24, self.oid.0)?;
        write_le_u64(block, at + 32, self.paddr.0)
    }
}

/// Parsed checkpoint-map block body (everything after the object header).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMap {
    pub flags: u32,
    pub mappings: Vec<CheckpointMapping>,
}

impl CheckpointMap {
    /// Mappings that fit in one block.
    #[must_use]
    pub fn capacity(block_size: usize) -> usize {
        block_size.saturating_sub(CPM_HEADER_SIZE) / CPM_MAPPING_SIZE
    }

    /// Raw mapping count, read without validating it.
    pub fn raw_count(block: &[u8]) -> Result<u32, ParseError> {
        read_le_u32(block, OBJECT_HEADER_SIZE + 4)
    }

    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let flags = read_le_u32(block, OBJECT_HEADER_SIZE)?;
        let count = u64_to_usize(u64::from(Self::raw_count(block)?), "cpm_count")?;
        if count > Self::capacity(block.len()) {
            return Err(ParseError::InvalidField {
                field: "cpm_count",
                reason: "mapping count exceeds block capacity",
            });
        }
        let mappings = (0..count)
            .map(|i| CheckpointMapping::parse(block, CPM_HEADER_SIZE + i * CPM_MAPPING_SIZE))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { flags, mappings })
    }

    /// Serialize into `block`, leaving the object header alone and zeroing
    /// unused mapping slots.
    pub fn write(&self, block: &mut [u8]) -> Result<(), ParseError> {
        if self.mappings.len() > Self::capacity(block.len()) {
            return Err(ParseError::InvalidField {
                field: "cpm_count",
                reason: "mapping count exceeds block capacity",
            });
        }
        let count = u32::try_from(self.mappings.len())
            .map_err(|_| ParseError::IntegerConversion { field: "cpm_count" })?;
        write_le_u32(block, OBJECT_HEADER_SIZE, self.flags)?;
        write_le_u32(block, OBJECT_HEADER_SIZE + 4, count)?;
        for (i, mapping) in self.mappings.iter().enumerate() {
            mapping.write(block, CPM_HEADER_SIZE + i * CPM_MAPPING_SIZE)?;
        }
        let used = CPM_HEADER_SIZE + self.mappings.len() * CPM_MAPPING_SIZE;
        block[used..].fill(0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cowfs_types::{OBJ_EPHEMERAL, OBJECT_TYPE_BTREE};

    fn mapping(oid: u64, paddr: u64) -> CheckpointMapping {
        CheckpointMapping {
            obj_type: OBJECT_TYPE_BTREE | OBJ_EPHEMERAL,
            subtype: 0xff,
            size: 4096,
            fs_oid: ObjectId(0),
            oid: ObjectId(oid),
            paddr: BlockNumber(paddr),
        }
    }

    #[test]
    fn capacity_matches_layout() {
        assert_eq!(CheckpointMap::capacity(4096), 101);
        assert_eq!(CheckpointMap::capacity(1024), 24);
    }

    #[test]
    fn round_trip_and_zero_tail() {
        let mut block = vec![0xAA_u8; 4096];
        let map = CheckpointMap {
            flags: CHECKPOINT_MAP_LAST,
            mappings: vec![mapping(1030, 40), mapping(1031, 41)],
        };
        map.write(&mut block).expect("write");
        assert_eq!(CheckpointMap::parse(&block).expect("parse"), map);
        assert!(block[40 + 80..].iter().all(|&b| b == 0));
        assert_eq!(&block[..32], &[0xAA_u8; 32][..], "object header untouched");
    }

    #[test]
    fn oversized_count_is_rejected() {
        let mut block = vec![0_u8; 1024];
        block[36..40].copy_from_slice(&25_u32.to_le_bytes());
        assert!(CheckpointMap::parse(&block).is_err());
        assert_eq!(CheckpointMap::raw_count(&block).expect("count"), 25);
    }
}
