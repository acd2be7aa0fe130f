#![forbid(unsafe_code)]
//! Error types for cowfs.
//!
//! # Error Taxonomy
//!
//! cowfs uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `cowfs-types` | Byte-level format violations |
//! | Runtime | `FsError` | `cowfs-error` (this crate) | Outcomes surfaced to callers of the tree engine and the container |
//!
//! ## Outcome classes
//!
//! | Class | Surfaced as | Transaction |
//! |-------|-------------|-------------|
//! | Search miss | `SearchResult::NotFound` (a value, not an error) | untouched |
//! | Stale cursor, full node | never surfaced; handled by backtracking or splitting | untouched |
//! | Structural corruption | `Corruption`, `BadChecksum` | caller must abort |
//! | Resource exhaustion | `NoSpace`, `NoMemory` | caller must abort |
//! | Device failure | `Io` | caller must abort |
//! | Known-unimplemented path | `UnsupportedFeature` | untouched |
//!
//! `ParseError` is converted into `Corruption` wherever the offending block
//! is known. `cowfs-error` does not depend on `cowfs-types`; the conversion
//! lives next to the code that has the block number in hand.
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`FsError::to_errno`].
//! The match is exhaustive, so a new variant does not compile until its
//! errno is assigned.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error, else `EIO` |
//! | `Corruption` | `EIO` |
//! | `BadChecksum` | `EBADMSG` |
//! | `Format` | `EINVAL` |
//! | `UnsupportedFeature` | `EOPNOTSUPP` |
//! | `NoSpace` | `ENOSPC` |
//! | `NoMemory` | `ENOMEM` |
//! | `NotFound` | `ENOENT` |
//! | `ReadOnly` | `EROFS` |
//! | `RecordTooLarge` | `ERANGE` |
//! | `Exists` | `EEXIST` |

use thiserror::Error;

/// Unified error type for all cowfs operations.
#[derive(Debug, Error)]
pub enum FsError {
    /// Operating system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A structural invariant is violated at a known block.
    ///
    /// Raised for oversized maps, missing mappings for live objects, tree
    /// depth overruns, malformed record lengths and similar. Never repaired.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Object checksum mismatch while checksum verification is enabled.
    #[error("bad checksum at block {block}")]
    BadChecksum { block: u64 },

    /// Image or argument does not describe a valid container.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// A path that is deliberately not implemented yet.
    ///
    /// Distinct from `Corruption` so operators can tell a missing feature
    /// from a damaged image.
    #[error("not yet supported: {0}")]
    UnsupportedFeature(String),

    /// The allocator has no free block left.
    #[error("no space left on device")]
    NoSpace,

    #[error("out of memory")]
    NoMemory,

    /// A lookup outside the tree engine found nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// Mutation attempted without an active write transaction.
    #[error("read-only access")]
    ReadOnly,

    /// The record could never fit in a node, even an empty one.
    #[error("record too large: key {key_len} bytes, value {val_len} bytes")]
    RecordTooLarge { key_len: usize, val_len: usize },

    /// Insert of a key that is already present.
    #[error("record exists")]
    Exists,
}

impl FsError {
    /// Convenience constructor for [`FsError::Corruption`].
    pub fn corruption(block: u64, detail: impl Into<String>) -> Self {
        Self::Corruption {
            block,
            detail: detail.into(),
        }
    }

    /// Whether the caller has to abort its transaction after this error.
    #[must_use]
    pub fn requires_abort(&self) -> bool {
        !matches!(
            self,
            Self::NotFound(_) | Self::UnsupportedFeature(_) | Self::Exists
        )
    }

    /// Convert this error into a POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::BadChecksum { .. } => libc::EBADMSG,
            Self::Format(_) => libc::EINVAL,
            Self::UnsupportedFeature(_) => libc::EOPNOTSUPP,
            Self::NoSpace => libc::ENOSPC,
            Self::NoMemory => libc::ENOMEM,
            Self::NotFound(_) => libc::ENOENT,
            Self::ReadOnly => libc::EROFS,
            Self::RecordTooLarge { .. } => libc::ERANGE,
            Self::Exists => libc::EEXIST,
        }
    }
}

/// Result alias using `FsError`.
pub type Result<T> = std::result::Result<T, FsError>;
