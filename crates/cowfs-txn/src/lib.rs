#![forbid(unsafe_code)]
//! Transaction plumbing around the tree engine.
//!
//! - [`FsLock`]: one reader/writer lock per container. Read sessions share
//!   it; a write transaction holds it exclusively for its whole life.
//! - [`TxnState`]: the running transaction's id, write set, reclamation
//!   queue and allocation log.
//! - [`SpaceAllocator`] / [`BitmapAllocator`]: free-space tracking.

pub mod alloc;
pub mod lock;
pub mod state;

pub use alloc::{BitmapAllocator, SpaceAllocator};
pub use lock::FsLock;
pub use state::{JoinKind, TxnState, TxnSummary};
