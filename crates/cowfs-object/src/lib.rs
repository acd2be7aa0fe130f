#![forbid(unsafe_code)]
//! Object resolution.
//!
//! Virtual objects (catalog nodes and the like) are located through the
//! [`ObjectMap`], a physical B-tree keyed by `(oid, xid)`. Ephemeral
//! objects live in the checkpoint data area and are located by scanning
//! the checkpoint mapping blocks ([`CheckpointAreas`]). Physical objects
//! need no resolution: their id is their block number.

pub mod checkpoint;
pub mod omap;

pub use checkpoint::CheckpointAreas;
pub use omap::{ObjectMap, OmapRecord};
