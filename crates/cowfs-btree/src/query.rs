#![forbid(unsafe_code)]
//! Search cursors.
//!
//! A [`Query`] carries the search key, the flags and one [`Frame`] per
//! tree level visited, root first. Mutations address frames by height
//! above the leaf, so a root split that inserts a new frame at position 1
//! leaves every caller's height valid.

use crate::key::KeyFamily;
use crate::node::Node;
use cowfs_error::{FsError, Result};
use cowfs_types::{ObjectId, StorageClass};
use serde::{Deserialize, Serialize};

/// Deepest tree the engine will walk; anything deeper is treated as a cycle.
pub const MAX_DEPTH: usize = 12;

/// Search mode bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryFlags(u32);

impl QueryFlags {
    /// Closest record at or before the key; used for routing and inserts.
    pub const NONE: Self = Self(0);
    /// Only a record with exactly the search key qualifies.
    pub const EXACT: Self = Self(0x1);
    /// Walk every record matching the key under the family's multi-match
    /// rule, last to first. Implies exact matching at leaves.
    pub const MULTIPLE: Self = Self(0x2);

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for QueryFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Root object of a tree and the storage class its nodes live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TreeRoot {
    pub oid: ObjectId,
    pub storage: StorageClass,
}

/// Outcome of a search step. Absence of a record is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    Found,
    NotFound,
}

/// Position within one node.
#[derive(Debug, Clone)]
pub struct Frame {
    pub node: Node,
    /// Current record; `-1` means before the first record.
    pub index: i32,
    pub(crate) flags: QueryFlags,
    /// Next search step continues backward from `index`.
    pub(crate) next: bool,
    /// The walk below this frame has no more candidates.
    pub(crate) done: bool,
}

impl Frame {
    pub(crate) fn new(node: Node, flags: QueryFlags) -> Result<Self> {
        let index = i32::try_from(node.records())
            .map_err(|_| FsError::corruption(node.block().0, "record count overflow"))?;
        Ok(Self {
            node,
            index,
            flags,
            next: false,
            done: false,
        })
    }

    pub(crate) fn exact(&self) -> bool {
        self.flags.contains(QueryFlags::EXACT) || self.multiple()
    }

    pub(crate) fn multiple(&self) -> bool {
        self.flags.contains(QueryFlags::MULTIPLE)
    }

    /// Current index as a slot number; `None` when before the first record.
    #[must_use]
    pub fn slot(&self) -> Option<usize> {
        usize::try_from(self.index).ok()
    }
}

/// Search state over one tree.
#[derive(Debug, Clone)]
pub struct Query {
    pub root: TreeRoot,
    pub key: Vec<u8>,
    pub family: KeyFamily,
    pub flags: QueryFlags,
    pub(crate) frames: Vec<Frame>,
}

impl Query {
    #[must_use]
    pub fn new(root: TreeRoot, family: KeyFamily, key: impl Into<Vec<u8>>, flags: QueryFlags) -> Self {
        Self {
            root,
            key: key.into(),
            family,
            flags,
            frames: Vec::new(),
        }
    }

    /// Frames from the root down to the deepest node reached.
    #[must_use]
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Number of frames.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Position in `frames` of the frame `height` levels above the bottom.
    pub(crate) fn pos(&self, height: usize) -> Result<usize> {
        self.frames
            .len()
            .checked_sub(height + 1)
            .ok_or_else(|| FsError::corruption(0, format!("no frame at height {height}")))
    }

    pub(crate) fn frame(&self, height: usize) -> Result<&Frame> {
        let pos = self.pos(height)?;
        Ok(&self.frames[pos])
    }

    pub(crate) fn frame_mut(&mut self, height: usize) -> Result<&mut Frame> {
        let pos = self.pos(height)?;
        Ok(&mut self.frames[pos])
    }

    /// Whether the frame at `height` has a parent frame above it.
    pub(crate) fn has_parent(&self, height: usize) -> bool {
        height + 1 < self.frames.len()
    }

    fn leaf(&self) -> Result<&Frame> {
        self.frames
            .last()
            .ok_or_else(|| FsError::corruption(0, "query has not been run"))
    }

    /// Key of the record the query stopped at.
    pub fn current_key(&self) -> Result<Vec<u8>> {
        let leaf = self.leaf()?;
        let slot = leaf.slot().ok_or_else(|| {
            FsError::corruption(leaf.node.block().0, "query is positioned before the first record")
        })?;
        leaf.node.key(slot)
    }

    /// Value of the record the query stopped at.
    pub fn current_value(&self) -> Result<Vec<u8>> {
        let leaf = self.leaf()?;
        let slot = leaf.slot().ok_or_else(|| {
            FsError::corruption(leaf.node.block().0, "query is positioned before the first record")
        })?;
        leaf.node.value(slot)
    }

    /// Forget every frame so the next search starts again from the root.
    pub fn reset(&mut self) {
        self.frames.clear();
    }
}
