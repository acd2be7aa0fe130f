#![forbid(unsafe_code)]
//! Container lifecycle on top of the tree engine.
//!
//! A [`Container`] owns a block device. [`Container::read`] hands out
//! [`ReadSession`]s over the last committed state; [`Container::begin`]
//! starts the single [`Transaction`], which copies every block it modifies
//! and makes the new versions visible on [`Transaction::commit`].
//!
//! ```text
//!   Catalog ──► Transaction / ReadSession (ObjectStore)
//!                  │            │
//!                  ▼            ▼
//!              ObjectMap    CheckpointAreas
//!                  │            │
//!                  └────► BufferCache ──► BlockDevice
//! ```

mod catalog;
mod container;
mod options;
mod session;
mod transaction;

pub use catalog::Catalog;
pub use container::{Container, ContainerReport};
pub use options::{ContainerOptions, FormatOptions};
pub use session::ReadSession;
pub use transaction::Transaction;
