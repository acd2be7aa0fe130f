#![forbid(unsafe_code)]
//! The seam between the tree engine and whoever owns the blocks.
//!
//! The engine never allocates, resolves virtual ids or tracks the
//! transaction itself. It asks an [`ObjectStore`]: a read-only session
//! hands out nodes as they are on disk, a write transaction copies them
//! on first write.

use crate::node::Node;
use cowfs_block::Buffer;
use cowfs_error::Result;
use cowfs_types::{BlockNumber, ObjectId, StorageClass, Xid};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

/// Object resolution, allocation and copy-on-write for the tree engine.
pub trait ObjectStore {
    /// Transaction id stamped on objects created or copied now.
    fn xid(&self) -> Xid;

    fn block_size(&self) -> usize;

    /// Resolve `oid` and return its node.
    ///
    /// With `write`, the returned node is part of the current transaction:
    /// a node written by an earlier transaction is copied to a new block
    /// first (virtual and physical) and its buffer is marked as joined.
    /// Calling again for a node that already joined returns the same buffer.
    fn read_node(&self, oid: ObjectId, storage: StorageClass, write: bool) -> Result<Node>;

    /// Read a physical block belonging to a non-tree object.
    fn read_object_block(&self, block: BlockNumber, write: bool) -> Result<Buffer>;

    /// Allocate a fresh node block with its object header filled in (oid,
    /// xid, storage bits and `subtype`), joined to the transaction.
    fn create_node(&self, storage: StorageClass, subtype: u32) -> Result<Buffer>;

    /// Release a node that has been emptied out of its tree.
    fn delete_node(&self, node: &Node) -> Result<()>;

    /// A physical root moved from `old` to `new` on copy-on-write; whoever
    /// stores the root pointer has to follow.
    fn root_relocated(&self, old: ObjectId, new: ObjectId) -> Result<()>;

    fn diagnostics(&self) -> &Diagnostics;
}

/// A consistency problem that was noticed but did not stop the operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Diagnostic {
    /// An index record pointed at `expected`, but the node read back claims
    /// to be `found`.
    ChildIdMismatch {
        block: BlockNumber,
        expected: ObjectId,
        found: ObjectId,
    },
    /// The object map sent `oid` to a block whose header names another
    /// object.
    OmapTargetMismatch {
        oid: ObjectId,
        block: BlockNumber,
        found: ObjectId,
    },
}

/// Collected [`Diagnostic`]s, shared by every operation of a session.
#[derive(Debug, Default)]
pub struct Diagnostics {
    events: Mutex<Vec<Diagnostic>>,
}

impl Diagnostics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: Diagnostic) {
        warn!(?event, "consistency_diagnostic");
        self.events.lock().push(event);
    }

    #[must_use]
    pub fn events(&self) -> Vec<Diagnostic> {
        self.events.lock().clone()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}
