#![forbid(unsafe_code)]
//! Record families and their key ordering.

use cowfs_ondisk::{CatalogRecordType, OBJ_ID_MASK, OBJ_TYPE_SHIFT, OMAP_KEY_SIZE, OMAP_VAL_SIZE};
use cowfs_types::{
    OBJECT_TYPE_FSTREE, OBJECT_TYPE_OMAP, OBJECT_TYPE_TEST, ParseError, read_le_u16, read_le_u64,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Size of a child pointer stored as the value of an index record.
pub const CHILD_PTR_SIZE: usize = 8;

/// Which key encoding and ordering a tree uses. Derived from the node
/// subtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyFamily {
    /// `(oid, xid)` pairs, fixed 16-byte keys.
    ObjectMap,
    /// Filesystem records keyed by `obj_id_and_type` plus a name or number.
    Catalog,
    /// Plain bytewise order.
    Bytes,
}

impl KeyFamily {
    #[must_use]
    pub fn from_subtype(subtype: u32) -> Self {
        match subtype {
            OBJECT_TYPE_OMAP => Self::ObjectMap,
            OBJECT_TYPE_FSTREE => Self::Catalog,
            _ => Self::Bytes,
        }
    }

    #[must_use]
    pub fn subtype(self) -> u32 {
        match self {
            Self::ObjectMap => OBJECT_TYPE_OMAP,
            Self::Catalog => OBJECT_TYPE_FSTREE,
            Self::Bytes => OBJECT_TYPE_TEST,
        }
    }

    /// Key and value sizes for trees whose records all have the same size.
    #[must_use]
    pub fn fixed_sizes(self, leaf: bool) -> Option<(u16, u16)> {
        match self {
            Self::ObjectMap => {
                let val = if leaf { OMAP_VAL_SIZE } else { CHILD_PTR_SIZE };
                Some((u16::try_from(OMAP_KEY_SIZE).ok()?, u16::try_from(val).ok()?))
            }
            Self::Catalog | Self::Bytes => None,
        }
    }

    /// Compare a stored key against the key being searched for.
    ///
    /// With `multiple`, the family's suffix is ignored so that every record
    /// sharing the prefix compares equal: the xid for the object map, the
    /// name or number for the catalog, anything past the search key for
    /// plain bytes.
    pub fn compare(
        self,
        stored: &[u8],
        wanted: &[u8],
        multiple: bool,
    ) -> Result<Ordering, ParseError> {
        match self {
            Self::ObjectMap => {
                let (a_oid, b_oid) = (read_le_u64(stored, 0)?, read_le_u64(wanted, 0)?);
                if multiple || a_oid != b_oid {
                    return Ok(a_oid.cmp(&b_oid));
                }
                Ok(read_le_u64(stored, 8)?.cmp(&read_le_u64(wanted, 8)?))
            }
            Self::Catalog => compare_catalog(stored, wanted, multiple),
            Self::Bytes => {
                if multiple && stored.starts_with(wanted) {
                    return Ok(Ordering::Equal);
                }
                Ok(stored.cmp(wanted))
            }
        }
    }
}

fn compare_catalog(stored: &[u8], wanted: &[u8], multiple: bool) -> Result<Ordering, ParseError> {
    let a = read_le_u64(stored, 0)?;
    let b = read_le_u64(wanted, 0)?;
    let head = (a & OBJ_ID_MASK)
        .cmp(&(b & OBJ_ID_MASK))
        .then((a >> OBJ_TYPE_SHIFT).cmp(&(b >> OBJ_TYPE_SHIFT)));
    if multiple || head != Ordering::Equal {
        return Ok(head);
    }
    let kind = CatalogRecordType::from_raw(u8::try_from(a >> OBJ_TYPE_SHIFT).unwrap_or(u8::MAX))?;
    let (a_tail, b_tail) = (&stored[8..], &wanted[8..]);
    if kind.is_named() {
        Ok(catalog_name(a_tail)?.cmp(catalog_name(b_tail)?))
    } else if kind.is_numbered() {
        Ok(read_le_u64(a_tail, 0)?.cmp(&read_le_u64(b_tail, 0)?))
    } else {
        Ok(Ordering::Equal)
    }
}

fn catalog_name(tail: &[u8]) -> Result<&[u8], ParseError> {
    let len = usize::from(read_le_u16(tail, 0)?);
    tail.get(2..2 + len).ok_or(ParseError::InsufficientData {
        needed: len,
        offset: 2,
        actual: tail.len().saturating_sub(2),
    })
}
