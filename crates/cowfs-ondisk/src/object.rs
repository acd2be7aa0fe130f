#![forbid(unsafe_code)]
//! Object header shared by every metadata block, and the Fletcher-64
//! checksum stored in it.

use cowfs_types::{
    ObjectId, OBJECT_TYPE_FLAGS_MASK, OBJECT_TYPE_MASK, ParseError, StorageClass, Xid,
    read_le_u32, read_le_u64, write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};

pub const OBJECT_HEADER_SIZE: usize = 32;

const FLETCHER_MOD: u64 = 0xFFFF_FFFF;

/// Header shared by every on-disk object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectHeader {
    pub cksum: u64,
    pub oid: ObjectId,
    pub xid: Xid,
    pub obj_type: u32,
    pub subtype: u32,
}

impl ObjectHeader {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            cksum: read_le_u64(block, 0)?,
            oid: ObjectId(read_le_u64(block, 8)?),
            xid: Xid(read_le_u64(block, 16)?),
            obj_type: read_le_u32(block, 24)?,
            subtype: read_le_u32(block, 28)?,
        })
    }

    /// Write every field except the checksum.
    pub fn write(&self, block: &mut [u8]) -> Result<(), ParseError> {
        write_le_u64(block, 8, self.oid.0)?;
        write_le_u64(block, 16, self.xid.0)?;
        write_le_u32(block, 24, self.obj_type)?;
        write_le_u32(block, 28, self.subtype)
    }

    /// Object type with the storage and flag bits stripped.
    #[must_use]
    pub fn kind(&self) -> u32 {
        self.obj_type & OBJECT_TYPE_MASK
    }

    #[must_use]
    pub fn flags(&self) -> u32 {
        self.obj_type & OBJECT_TYPE_FLAGS_MASK
    }

    pub fn storage(&self) -> Result<StorageClass, ParseError> {
        StorageClass::from_type(self.obj_type)
    }
}

/// Fletcher-64 over little-endian 32-bit words. Trailing bytes that do not
/// form a whole word are ignored.
#[must_use]
pub fn fletcher64(data: &[u8]) -> u64 {
    let mut sum1 = 0_u64;
    let mut sum2 = 0_u64;
    for word in data.chunks_exact(4) {
        let word = u64::from(u32::from_le_bytes([word[0], word[1], word[2], word[3]]));
        sum1 = (sum1 + word) % FLETCHER_MOD;
        sum2 = (sum2 + sum1) % FLETCHER_MOD;
    }
    let c1 = FLETCHER_MOD - ((sum1 + sum2) % FLETCHER_MOD);
    let c2 = FLETCHER_MOD - ((sum1 + c1) % FLETCHER_MOD);
    (c2 << 32) | c1
}

/// Recompute and store the checksum of a whole object block.
pub fn set_checksum(block: &mut [u8]) -> Result<(), ParseError> {
    if block.len() <= OBJECT_HEADER_SIZE {
        return Err(ParseError::InsufficientData {
            needed: OBJECT_HEADER_SIZE + 1,
            offset: 0,
            actual: block.len(),
        });
    }
    let cksum = fletcher64(&block[8..]);
    write_le_u64(block, 0, cksum)
}

#[must_use]
pub fn verify_checksum(block: &[u8]) -> bool {
    if block.len() <= OBJECT_HEADER_SIZE {
        return false;
    }
    read_le_u64(block, 0).is_ok_and(|stored| stored == fletcher64(&block[8..]))
}
