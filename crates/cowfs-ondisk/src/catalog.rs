#![forbid(unsafe_code)]
//! Catalog record keys, their ordering, and data-stream reference values.

use cowfs_types::{ParseError, read_le_u16, read_le_u32, read_le_u64};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

pub const OBJ_ID_MASK: u64 = 0x0fff_ffff_ffff_ffff;
pub const OBJ_TYPE_SHIFT: u32 = 60;

/// Record type stored in the high four bits of a catalog key header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CatalogRecordType {
    SnapMetadata = 1,
    Extent = 2,
    Inode = 3,
    Xattr = 4,
    SiblingLink = 5,
    DstreamId = 6,
    CryptoState = 7,
    FileExtent = 8,
    DirRec = 9,
    DirStats = 10,
    SnapName = 11,
    SiblingMap = 12,
}

impl CatalogRecordType {
    pub fn from_raw(raw: u8) -> Result<Self, ParseError> {
        Ok(match raw {
            1 => Self::SnapMetadata,
            2 => Self::Extent,
            3 => Self::Inode,
            4 => Self::Xattr,
            5 => Self::SiblingLink,
            6 => Self::DstreamId,
            7 => Self::CryptoState,
            8 => Self::FileExtent,
            9 => Self::DirRec,
            10 => Self::DirStats,
            11 => Self::SnapName,
            12 => Self::SiblingMap,
            _ => {
                return Err(ParseError::InvalidField {
                    field: "obj_id_and_type",
                    reason: "unknown catalog record type",
                });
            }
        })
    }

    /// Types whose key carries a length-prefixed name.
    #[must_use]
    pub fn is_named(self) -> bool {
        matches!(self, Self::Xattr | Self::DirRec | Self::SnapName)
    }

    /// Types whose key carries a trailing 64-bit number.
    #[must_use]
    pub fn is_numbered(self) -> bool {
        matches!(self, Self::FileExtent | Self::SiblingLink)
    }
}

/// Variable part of a catalog key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeySuffix {
    None,
    Name(Vec<u8>),
    Number(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CatalogKey {
    pub id: u64,
    pub kind: CatalogRecordType,
    pub suffix: KeySuffix,
}

impl CatalogKey {
    #[must_use]
    pub fn new(id: u64, kind: CatalogRecordType) -> Self {
        Self {
            id: id & OBJ_ID_MASK,
            kind,
            suffix: KeySuffix::None,
        }
    }

    #[must_use]
    pub fn named(id: u64, kind: CatalogRecordType, name: &[u8]) -> Self {
        Self {
            id: id & OBJ_ID_MASK,
            kind,
            suffix: KeySuffix::Name(name.to_vec()),
        }
    }

    #[must_use]
    pub fn numbered(id: u64, kind: CatalogRecordType, number: u64) -> Self {
        Self {
            id: id & OBJ_ID_MASK,
            kind,
            suffix: KeySuffix::Number(number),
        }
    }

    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        let hdr = read_le_u64(raw, 0)?;
        let kind = CatalogRecordType::from_raw(
            u8::try_from(hdr >> OBJ_TYPE_SHIFT)
                .map_err(|_| ParseError::IntegerConversion { field: "obj_type" })?,
        )?;
        let id = hdr & OBJ_ID_MASK;
        let suffix = if kind.is_named() {
            let len = usize::from(read_le_u16(raw, 8)?);
            let end = 10 + len;
            if raw.len() < end {
                return Err(ParseError::InsufficientData {
                    needed: len,
                    offset: 10,
                    actual: raw.len().saturating_sub(10),
                });
            }
            KeySuffix::Name(raw[10..end].to_vec())
        } else if kind.is_numbered() {
            KeySuffix::Number(read_le_u64(raw, 8)?)
        } else {
            KeySuffix::None
        };
        Ok(Self { id, kind, suffix })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ParseError> {
        let hdr = (self.id & OBJ_ID_MASK) | (u64::from(self.kind as u8) << OBJ_TYPE_SHIFT);
        let mut out = hdr.to_le_bytes().to_vec();
        match &self.suffix {
            KeySuffix::None => {}
            KeySuffix::Name(name) => {
                let len = u16::try_from(name.len())
                    .map_err(|_| ParseError::IntegerConversion { field: "name_len" })?;
                out.extend_from_slice(&len.to_le_bytes());
                out.extend_from_slice(name);
            }
            KeySuffix::Number(number) => out.extend_from_slice(&number.to_le_bytes()),
        }
        Ok(out)
    }

    /// Order by id, then record type, then suffix. With `ignore_suffix` all
    /// records of one (id, type) compare equal.
    #[must_use]
    pub fn compare(&self, other: &Self, ignore_suffix: bool) -> Ordering {
        let head = self.id.cmp(&other.id).then(self.kind.cmp(&other.kind));
        if ignore_suffix || head != Ordering::Equal {
            return head;
        }
        match (&self.suffix, &other.suffix) {
            (KeySuffix::Name(a), KeySuffix::Name(b)) => a.cmp(b),
            (KeySuffix::Number(a), KeySuffix::Number(b)) => a.cmp(b),
            (KeySuffix::None, KeySuffix::None) => Ordering::Equal,
            (KeySuffix::None, _) => Ordering::Less,
            (_, KeySuffix::None) => Ordering::Greater,
            (KeySuffix::Name(_), KeySuffix::Number(_)) => Ordering::Less,
            (KeySuffix::Number(_), KeySuffix::Name(_)) => Ordering::Greater,
        }
    }
}

/// Value of a data stream id record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DstreamIdVal {
    pub refcnt: u32,
}

impl DstreamIdVal {
    pub const SIZE: usize = 4;

    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        if raw.len() != Self::SIZE {
            return Err(ParseError::InvalidField {
                field: "dstream_id_val",
                reason: "wrong value length",
            });
        }
        Ok(Self {
            refcnt: read_le_u32(raw, 0)?,
        })
    }

    #[must_use]
    pub fn to_bytes(self) -> [u8; 4] {
        self.refcnt.to_le_bytes()
    }
}
