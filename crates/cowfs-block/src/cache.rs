#![forbid(unsafe_code)]
//! Shared block buffers.
//!
//! Every live [`Buffer`] for a block number is the same allocation: the
//! cache keeps weak handles, so a block stays resident exactly as long as
//! some node, query frame or transaction write set holds it.

use crate::BlockDevice;
use cowfs_error::Result;
use cowfs_types::BlockNumber;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

struct BufferInner {
    block: BlockNumber,
    data: RwLock<Vec<u8>>,
    in_txn: AtomicBool,
}

/// Reference-counted handle on one cached block.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

impl Buffer {
    /// Standalone buffer outside any cache. Used by tests and by callers
    /// that stage a block before it is written.
    #[must_use]
    pub fn detached(block: BlockNumber, data: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                block,
                data: RwLock::new(data),
                in_txn: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.inner.block
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.inner.data.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.inner.data.write()
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.inner.data.read().clone()
    }

    /// Overwrite the whole content with `src`, resizing if needed.
    pub fn copy_from(&self, src: &[u8]) {
        let mut data = self.inner.data.write();
        data.clear();
        data.extend_from_slice(src);
    }

    /// Whether this block belongs to the running transaction's write set.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.inner.in_txn.load(Ordering::Acquire)
    }

    pub fn set_in_transaction(&self, value: bool) {
        self.inner.in_txn.store(value, Ordering::Release);
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("block", &self.inner.block)
            .field("in_txn", &self.in_transaction())
            .finish_non_exhaustive()
    }
}

/// Weak-reference block cache in front of a [`BlockDevice`].
pub struct BufferCache {
    dev: Arc<dyn BlockDevice>,
    entries: Mutex<HashMap<BlockNumber, Weak<BufferInner>>>,
}

impl BufferCache {
    #[must_use]
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        Self {
            dev,
            entries: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.dev
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.dev.block_size() as usize
    }

    /// Return the live buffer for `block`, loading it from the device on
    /// a miss.
    pub fn get(&self, block: BlockNumber) -> Result<Buffer> {
        let mut entries = self.entries.lock();
        if let Some(inner) = entries.get(&block).and_then(Weak::upgrade) {
            return Ok(Buffer { inner });
        }
        let data = self.dev.read_block(block)?.into_inner();
        trace!(target: "cowfs::block", block = block.0, "cache_fill");
        let buf = Buffer::detached(block, data);
        entries.insert(block, Arc::downgrade(&buf.inner));
        Ok(buf)
    }

    /// Install a zero-filled buffer for a freshly allocated block without
    /// reading the device. Replaces any previous entry.
    pub fn get_zeroed(&self, block: BlockNumber) -> Buffer {
        let buf = Buffer::detached(block, vec![0_u8; self.block_size()]);
        self.entries
            .lock()
            .insert(block, Arc::downgrade(&buf.inner));
        buf
    }

    /// Drop the cache entry for `block`. Outstanding handles keep their
    /// content but are no longer shared with later lookups.
    pub fn forget(&self, block: BlockNumber) {
        self.entries.lock().remove(&block);
    }

    /// Replace the in-memory content of `buf` with the on-device block.
    pub fn reload(&self, buf: &Buffer) -> Result<()> {
        let data = self.dev.read_block(buf.block())?.into_inner();
        *buf.write() = data;
        Ok(())
    }

    pub fn write_back(&self, buf: &Buffer) -> Result<()> {
        let data = buf.read();
        self.dev.write_block(buf.block(), &data)
    }

    /// Number of blocks with at least one live handle.
    #[must_use]
    pub fn resident(&self) -> usize {
        let mut entries = self.entries.lock();
        entries.retain(|_, weak| weak.strong_count() > 0);
        entries.len()
    }
}

impl fmt::Debug for BufferCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferCache")
            .field("block_size", &self.dev.block_size())
            .field("entries", &self.entries.lock().len())
            .finish_non_exhaustive()
    }
}
