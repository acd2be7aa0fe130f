#![forbid(unsafe_code)]
//! Copy-on-write B-tree engine.
//!
//! Every piece of container metadata (object-map entries, catalog records)
//! lives as key/value records in trees of fixed-size nodes. A [`Query`] is
//! the cursor: one frame per level from the root down, each holding its
//! node and current slot. [`query`] positions it, then [`insert`],
//! [`remove`] and [`replace`] mutate the record under it.
//!
//! Nodes are never modified unless they already belong to the active
//! transaction. Mutations first *join* the node through the
//! [`ObjectStore`], which copies it to a new block when needed; a physical
//! node's parent is then repointed, a virtual node's object-map entry is
//! updated by the store.
//!
//! Invariants kept by every mutation:
//!
//! - keys strictly increase across the leaves in the family's order;
//! - the first key of a non-root node equals the parent record routing to it;
//! - the root's tree info holds the exact record and node counts and
//!   never-shrinking longest key/value marks;
//! - no walk goes deeper than [`MAX_DEPTH`] levels.
//!
//! Full nodes split by record count. A node holding a single record that
//! cannot share it gets a one-record sibling instead. Splits may leave the
//! upper frames of a query stale; they are dropped and rebuilt from the
//! root by key when next needed.

pub mod key;
pub mod mutate;
pub mod node;
pub mod query;
pub mod search;
pub mod store;
pub mod verify;

pub use key::{CHILD_PTR_SIZE, KeyFamily};
pub use mutate::{create_tree, insert, remove, replace};
pub use node::{Node, Placement, Record, empty_tree_info, max_key_size, max_record_size, node_flags};
pub use query::{Frame, MAX_DEPTH, Query, QueryFlags, SearchResult, TreeRoot};
pub use search::query;
pub use store::{Diagnostic, Diagnostics, ObjectStore};
pub use verify::{TreeStats, collect_records, verify_tree, walk};

use cowfs_error::FsError;
use cowfs_types::{BlockNumber, ParseError};

/// Report a format violation found in `block` as corruption.
#[must_use]
pub fn corruption_at(block: BlockNumber, err: &ParseError) -> FsError {
    node::parse_err(block, err)
}
