#![forbid(unsafe_code)]
//! Object-map records.

use cowfs_types::{BlockNumber, ObjectId, ParseError, Xid, read_le_u32, read_le_u64};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

pub const OMAP_KEY_SIZE: usize = 16;
pub const OMAP_VAL_SIZE: usize = 16;

/// Value flag: the mapping was deleted in this transaction.
pub const OMAP_VAL_DELETED: u32 = 0x0000_0001;

/// Object-map key: virtual object id and the transaction that wrote it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OmapKey {
    pub oid: ObjectId,
    pub xid: Xid,
}

impl OmapKey {
    #[must_use]
    pub fn new(oid: ObjectId, xid: Xid) -> Self {
        Self { oid, xid }
    }

    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        if raw.len() != OMAP_KEY_SIZE {
            return Err(ParseError::InvalidField {
                field: "omap_key",
                reason: "wrong key length",
            });
        }
        Ok(Self {
            oid: ObjectId(read_le_u64(raw, 0)?),
            xid: Xid(read_le_u64(raw, 8)?),
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; OMAP_KEY_SIZE] {
        let mut out = [0_u8; OMAP_KEY_SIZE];
        out[..8].copy_from_slice(&self.oid.0.to_le_bytes());
        out[8..].copy_from_slice(&self.xid.0.to_le_bytes());
        out
    }

    /// Order by object id, then transaction id. With `ignore_xid` every
    /// version of the same object compares equal.
    #[must_use]
    pub fn compare(&self, other: &Self, ignore_xid: bool) -> Ordering {
        self.oid.cmp(&other.oid).then_with(|| {
            if ignore_xid {
                Ordering::Equal
            } else {
                self.xid.cmp(&other.xid)
            }
        })
    }
}

/// Object-map value: where the object lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmapVal {
    pub flags: u32,
    pub size: u32,
    pub paddr: BlockNumber,
}

impl OmapVal {
    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        if raw.len() != OMAP_VAL_SIZE {
            return Err(ParseError::InvalidField {
                field: "omap_val",
                reason: "wrong value length",
            });
        }
        Ok(Self {
            flags: read_le_u32(raw, 0)?,
            size: read_le_u32(raw, 4)?,
            paddr: BlockNumber(read_le_u64(raw, 8)?),
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; OMAP_VAL_SIZE] {
        let mut out = [0_u8; OMAP_VAL_SIZE];
        out[..4].copy_from_slice(&self.flags.to_le_bytes());
        out[4..8].copy_from_slice(&self.size.to_le_bytes());
        out[8..].copy_from_slice(&self.paddr.0.to_le_bytes());
        out
    }
}
