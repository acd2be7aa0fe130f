#![forbid(unsafe_code)]
//! cowfs public API facade.
//!
//! Re-exports the container API from `cowfs-core` together with the types
//! a consumer needs to drive it: devices, catalog keys, tree roots and the
//! error type. Lower layers stay reachable through their module aliases.

pub use cowfs_core::*;

pub use cowfs_block::{BlockDevice, ByteBlockDevice, FileByteDevice, MemBlockDevice};
pub use cowfs_btree::{KeyFamily, TreeRoot, TreeStats};
pub use cowfs_error::{FsError, Result};
pub use cowfs_ondisk::{CatalogKey, CatalogRecordType, DstreamIdVal, KeySuffix, Superblock};
pub use cowfs_types::{BlockNumber, ObjectId, StorageClass, Xid};

pub use cowfs_block as block;
pub use cowfs_btree as btree;
pub use cowfs_object as object;
pub use cowfs_ondisk as ondisk;
