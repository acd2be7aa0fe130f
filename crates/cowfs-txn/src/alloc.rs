#![forbid(unsafe_code)]
//! Free-space tracking.
//!
//! The container does not persist a space manager; the allocator is rebuilt
//! at open time by marking every block reachable from the superblock.

use cowfs_error::{FsError, Result};
use cowfs_types::BlockNumber;
use std::fmt;
use tracing::{error, trace};

// ── Bitmap operations ───────────────────────────────────────────────────────

fn byte_and_mask(idx: u64) -> Option<(usize, u8)> {
    let byte = usize::try_from(idx / 8).ok()?;
    Some((byte, 1 << (idx % 8)))
}

#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u64) -> bool {
    byte_and_mask(idx)
        .and_then(|(byte, mask)| bitmap.get(byte).map(|b| b & mask != 0))
        .unwrap_or(false)
}

pub fn bitmap_set(bitmap: &mut [u8], idx: u64) {
    if let Some((byte, mask)) = byte_and_mask(idx) {
        if let Some(b) = bitmap.get_mut(byte) {
            *b |= mask;
        }
    }
}

pub fn bitmap_clear(bitmap: &mut [u8], idx: u64) {
    if let Some((byte, mask)) = byte_and_mask(idx) {
        if let Some(b) = bitmap.get_mut(byte) {
            *b &= !mask;
        }
    }
}

/// First clear bit at or after `start`, wrapping around to the beginning.
#[must_use]
pub fn bitmap_find_free(bitmap: &[u8], count: u64, start: u64) -> Option<u64> {
    (start..count)
        .chain(0..start.min(count))
        .find(|&idx| !bitmap_get(bitmap, idx))
}

/// Last clear bit at or before `start`, wrapping around to the end.
#[must_use]
pub fn bitmap_find_free_backwards(bitmap: &[u8], count: u64, start: u64) -> Option<u64> {
    let start = start.min(count.saturating_sub(1));
    (0..=start)
        .rev()
        .chain((start + 1..count).rev())
        .find(|&idx| !bitmap_get(bitmap, idx))
}

// ── Allocator ───────────────────────────────────────────────────────────────

/// Hands out and takes back single blocks.
pub trait SpaceAllocator: Send + fmt::Debug {
    /// Claim a free block. `backwards` prefers the end of the device, which
    /// keeps relocated metadata away from the data written at format time.
    fn allocate(&mut self, backwards: bool) -> Result<BlockNumber>;

    /// Return a block. Freeing a block that is not in use is corruption.
    fn free(&mut self, block: BlockNumber) -> Result<()>;

    /// Claim a specific block, as found in use while scanning the container.
    fn mark_used(&mut self, block: BlockNumber) -> Result<()>;

    fn is_used(&self, block: BlockNumber) -> bool;

    fn free_blocks(&self) -> u64;

    fn total_blocks(&self) -> u64;
}

/// One bit per block.
#[derive(Clone)]
pub struct BitmapAllocator {
    bitmap: Vec<u8>,
    total: u64,
    free: u64,
    forward_cursor: u64,
    backward_cursor: u64,
}

impl BitmapAllocator {
    /// All `total` blocks free.
    pub fn new(total: u64) -> Result<Self> {
        let bytes = usize::try_from(total.div_ceil(8))
            .map_err(|_| FsError::Format(format!("{total} blocks do not fit in memory")))?;
        Ok(Self {
            bitmap: vec![0; bytes],
            total,
            free: total,
            forward_cursor: 0,
            backward_cursor: total.saturating_sub(1),
        })
    }

    fn check_range(&self, block: BlockNumber) -> Result<()> {
        if block.0 >= self.total {
            error!(
                invariant = "block<block_count",
                block = block.0,
                total = self.total,
                "alloc_invariant_violation"
            );
            return Err(FsError::corruption(block.0, "block beyond the end of the container"));
        }
        Ok(())
    }
}

impl SpaceAllocator for BitmapAllocator {
    fn allocate(&mut self, backwards: bool) -> Result<BlockNumber> {
        if self.free == 0 {
            return Err(FsError::NoSpace);
        }
        let found = if backwards {
            bitmap_find_free_backwards(&self.bitmap, self.total, self.backward_cursor)
        } else {
            bitmap_find_free(&self.bitmap, self.total, self.forward_cursor)
        };
        let Some(idx) = found else {
            return Err(FsError::NoSpace);
        };
        bitmap_set(&mut self.bitmap, idx);
        self.free -= 1;
        if backwards {
            self.backward_cursor = idx.checked_sub(1).unwrap_or(self.total.saturating_sub(1));
        } else {
            self.forward_cursor = if idx + 1 >= self.total { 0 } else { idx + 1 };
        }
        trace!(target: "cowfs::alloc", block = idx, backwards, free = self.free, "block_alloc");
        Ok(BlockNumber(idx))
    }

    fn free(&mut self, block: BlockNumber) -> Result<()> {
        self.check_range(block)?;
        if !bitmap_get(&self.bitmap, block.0) {
            error!(
                invariant = "free_of_used_block",
                block = block.0,
                "alloc_invariant_violation"
            );
            return Err(FsError::corruption(block.0, "block freed twice"));
        }
        bitmap_clear(&mut self.bitmap, block.0);
        self.free += 1;
        trace!(target: "cowfs::alloc", block = block.0, free = self.free, "block_free");
        Ok(())
    }

    fn mark_used(&mut self, block: BlockNumber) -> Result<()> {
        self.check_range(block)?;
        if bitmap_get(&self.bitmap, block.0) {
            error!(
                invariant = "block_single_owner",
                block = block.0,
                "alloc_invariant_violation"
            );
            return Err(FsError::corruption(block.0, "block claimed twice"));
        }
        bitmap_set(&mut self.bitmap, block.0);
        self.free -= 1;
        Ok(())
    }

    fn is_used(&self, block: BlockNumber) -> bool {
        bitmap_get(&self.bitmap, block.0)
    }

    fn free_blocks(&self) -> u64 {
        self.free
    }

    fn total_blocks(&self) -> u64 {
        self.total
    }
}

impl fmt::Debug for BitmapAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitmapAllocator")
            .field("total", &self.total)
            .field("free", &self.free)
            .finish_non_exhaustive()
    }
}
