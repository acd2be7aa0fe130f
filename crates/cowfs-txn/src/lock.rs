#![forbid(unsafe_code)]
//! Container-wide reader/writer lock.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::fmt;
use tracing::trace;

/// Serializes structural access to a container: any number of readers, or
/// one writer for the lifetime of a transaction.
#[derive(Default)]
pub struct FsLock {
    inner: RwLock<()>,
}

impl FsLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ()> {
        let guard = self.inner.read();
        trace!(target: "cowfs::lock", "fs_lock_shared");
        guard
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, ()> {
        let guard = self.inner.write();
        trace!(target: "cowfs::lock", "fs_lock_exclusive");
        guard
    }

    /// Exclusive access if nobody holds the lock right now.
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, ()>> {
        self.inner.try_write()
    }

    #[must_use]
    pub fn is_locked_exclusive(&self) -> bool {
        self.inner.is_locked_exclusive()
    }
}

impl fmt::Debug for FsLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsLock")
            .field("locked", &self.inner.is_locked())
            .field("exclusive", &self.inner.is_locked_exclusive())
            .finish()
    }
}
