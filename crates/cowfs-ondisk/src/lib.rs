#![forbid(unsafe_code)]
//! On-disk format parsing for the copy-on-write container.
//!
//! Pure parsing crate: no I/O, no side effects. Parses byte slices into
//! typed Rust structures (object headers, B-tree node headers and table of
//! contents entries, object-map records, catalog keys, checkpoint-map blocks
//! and the container superblock) and serializes them back.

pub mod btree;
pub mod catalog;
pub mod checkpoint;
pub mod object;
pub mod omap;
pub mod superblock;

pub use btree::{
    BTNODE_FIXED_KV_SIZE, BTNODE_LEAF, BTNODE_ROOT, BTOFF_INVALID, BTREE_INFO_SIZE,
    BTREE_NODE_HDR_SIZE, BTREE_TOC_ENTRY_INCREMENT, BtreeInfo, KVLOC_SIZE, KVOFF_SIZE, Kvloc,
    NodeHeader, Nloc,
};
pub use catalog::{
    CatalogKey, CatalogRecordType, DstreamIdVal, KeySuffix, OBJ_ID_MASK, OBJ_TYPE_SHIFT,
};
pub use checkpoint::{CHECKPOINT_MAP_LAST, CheckpointMap, CheckpointMapping};
pub use object::{OBJECT_HEADER_SIZE, ObjectHeader, fletcher64, set_checksum, verify_checksum};
pub use omap::{OMAP_KEY_SIZE, OMAP_VAL_DELETED, OMAP_VAL_SIZE, OmapKey, OmapVal};
pub use superblock::{NX_FLAG_CHECK_NODES, Superblock};
