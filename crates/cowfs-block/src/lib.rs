#![forbid(unsafe_code)]
//! Block I/O layer.
//!
//! Provides the [`BlockDevice`] trait the tree engine reads and writes
//! through, byte-addressed backends (file and memory), and the
//! [`BufferCache`] that hands out shared, reference-counted block buffers.

mod cache;

pub use cache::{Buffer, BufferCache};

use cowfs_error::{FsError, Result};
use cowfs_types::{BlockNumber, ByteOffset};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn checked_range(offset: ByteOffset, len: usize, limit: u64, op: &str) -> Result<()> {
    let len = u64::try_from(len)
        .map_err(|_| FsError::Format(format!("{op} length overflows u64")))?;
    let end = offset
        .checked_add(len)
        .ok_or_else(|| FsError::Format(format!("{op} range overflows u64")))?;
    if end.0 > limit {
        return Err(FsError::Format(format!(
            "{op} out of bounds: offset={offset} len={len} device_len={limit}"
        )));
    }
    Ok(())
}

/// File-backed byte device.
///
/// Uses `FileExt` positional I/O, which is thread-safe and does not share a
/// seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open an existing image, read-write when permitted, else read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    /// Create (or truncate) an image file of exactly `len` bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Ok(Self {
            file: Arc::new(file),
            len,
            writable: true,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.len, "read")?;
        self.file.read_exact_at(buf, offset.0)?;
        Ok(())
    }

    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(FsError::ReadOnly);
        }
        checked_range(offset, buf.len(), self.len, "write")?;
        self.file.write_all_at(buf, offset.0)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

impl<T: BlockDevice + ?Sized> BlockDevice for Arc<T> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        (**self).read_block(block)
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        (**self).write_block(block, data)
    }

    fn block_size(&self) -> u32 {
        (**self).block_size()
    }

    fn block_count(&self) -> u64 {
        (**self).block_count()
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

/// Adapts a [`ByteDevice`] into a [`BlockDevice`] of a fixed block size.
#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: u32,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(FsError::Format(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }

        let len = inner.len_bytes();
        let block_size_u64 = u64::from(block_size);
        let remainder = len % block_size_u64;
        if remainder != 0 {
            return Err(FsError::Format(format!(
                "image length is not block-aligned: len_bytes={len} block_size={block_size} remainder={remainder}"
            )));
        }
        Ok(Self {
            inner,
            block_size,
            block_count: len / block_size_u64,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn offset_of(&self, block: BlockNumber) -> Result<ByteOffset> {
        if block.0 >= self.block_count {
            return Err(FsError::Format(format!(
                "block out of range: block={block} block_count={}",
                self.block_count
            )));
        }
        block
            .0
            .checked_mul(u64::from(self.block_size))
            .map(ByteOffset)
            .ok_or_else(|| FsError::Format("block offset overflow".to_owned()))
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        let offset = self.offset_of(block)?;
        let mut buf = vec![0_u8; self.block_size as usize];
        self.inner.read_exact_at(offset, &mut buf)?;
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        if data.len() != self.block_size as usize {
            return Err(FsError::Format(format!(
                "write_block data size mismatch: got={} expected={}",
                data.len(),
                self.block_size
            )));
        }
        let offset = self.offset_of(block)?;
        self.inner.write_all_at(offset, data)
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

/// Sparse in-memory block device.
///
/// Unwritten blocks read back as zeroes. Reads of blocks registered with
/// [`MemBlockDevice::fail_reads_of`] return an I/O error, which lets tests
/// exercise the engine's error propagation.
#[derive(Debug)]
pub struct MemBlockDevice {
    block_size: u32,
    block_count: u64,
    blocks: Mutex<HashMap<BlockNumber, Vec<u8>>>,
    failing: Mutex<HashSet<BlockNumber>>,
    writes: AtomicU64,
}

impl MemBlockDevice {
    #[must_use]
    pub fn new(block_size: u32, block_count: u64) -> Self {
        Self {
            block_size,
            block_count,
            blocks: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            writes: AtomicU64::new(0),
        }
    }

    pub fn fail_reads_of(&self, block: BlockNumber) {
        self.failing.lock().insert(block);
    }

    pub fn clear_failures(&self) {
        self.failing.lock().clear();
    }

    /// Number of successful block writes so far.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Raw copy of a block, bypassing fault injection.
    #[must_use]
    pub fn snapshot(&self, block: BlockNumber) -> Vec<u8> {
        self.blocks
            .lock()
            .get(&block)
            .cloned()
            .unwrap_or_else(|| vec![0_u8; self.block_size as usize])
    }

    /// Overwrite a block directly, bypassing checksums and the cache.
    pub fn poke(&self, block: BlockNumber, data: Vec<u8>) {
        self.blocks.lock().insert(block, data);
    }

    fn check_range(&self, block: BlockNumber) -> Result<()> {
        if block.0 >= self.block_count {
            return Err(FsError::Format(format!(
                "block out of range: block={block} block_count={}",
                self.block_count
            )));
        }
        Ok(())
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        self.check_range(block)?;
        if self.failing.lock().contains(&block) {
            return Err(FsError::Io(std::io::Error::other(format!(
                "injected read failure at block {block}"
            ))));
        }
        Ok(BlockBuf::new(self.snapshot(block)))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        self.check_range(block)?;
        if data.len() != self.block_size as usize {
            return Err(FsError::Format(format!(
                "write_block data size mismatch: got={} expected={}",
                data.len(),
                self.block_size
            )));
        }
        self.blocks.lock().insert(block, data.to_vec());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct MemoryByteDevice {
        bytes: Mutex<Vec<u8>>,
    }

    impl MemoryByteDevice {
        fn new(len: usize) -> Self {
            Self {
                bytes: Mutex::new(vec![0_u8; len]),
            }
        }
    }

    impl ByteDevice for MemoryByteDevice {
        fn len_bytes(&self) -> u64 {
            u64::try_from(self.bytes.lock().len()).unwrap_or(0)
        }

        fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
            let offset = usize::try_from(offset.0)
                .map_err(|_| FsError::Format("offset overflow".into()))?;
            let bytes = self.bytes.lock();
            let end = offset + buf.len();
            if end > bytes.len() {
                return Err(FsError::Format("oob".into()));
            }
            buf.copy_from_slice(&bytes[offset..end]);
            drop(bytes);
            Ok(())
        }

        fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
            let offset = usize::try_from(offset.0)
                .map_err(|_| FsError::Format("offset overflow".into()))?;
            let mut bytes = self.bytes.lock();
            let end = offset + buf.len();
            if end > bytes.len() {
                return Err(FsError::Format("oob".into()));
            }
            bytes[offset..end].copy_from_slice(buf);
            drop(bytes);
            Ok(())
        }

        fn sync(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn byte_block_device_round_trips() {
        let dev = ByteBlockDevice::new(MemoryByteDevice::new(4096 * 4), 4096).expect("device");
        assert_eq!(dev.block_count(), 4);

        let payload = vec![0xA5_u8; 4096];
        dev.write_block(BlockNumber(2), &payload).expect("write");
        assert_eq!(dev.read_block(BlockNumber(2)).expect("read").as_slice(), &payload[..]);
        assert!(dev.read_block(BlockNumber(4)).is_err());
        assert!(dev.write_block(BlockNumber(1), &[0_u8; 100]).is_err());
    }

    #[test]
    fn byte_block_device_rejects_unaligned_image() {
        let err = ByteBlockDevice::new(MemoryByteDevice::new(4096 + 17), 4096).unwrap_err();
        assert!(matches!(err, FsError::Format(_)));
        assert!(ByteBlockDevice::new(MemoryByteDevice::new(4096), 3000).is_err());
    }

    #[test]
    fn file_byte_device_persists_blocks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("image.bin");
        {
            let file = FileByteDevice::create(&path, 4096 * 8).expect("create");
            let dev = ByteBlockDevice::new(file, 4096).expect("device");
            dev.write_block(BlockNumber(5), &[7_u8; 4096]).expect("write");
            dev.sync().expect("sync");
        }
        let file = FileByteDevice::open(&path).expect("open");
        assert!(file.is_writable());
        let dev = ByteBlockDevice::new(file, 4096).expect("device");
        assert_eq!(dev.read_block(BlockNumber(5)).expect("read").as_slice(), &[7_u8; 4096][..]);
        assert_eq!(dev.read_block(BlockNumber(4)).expect("read").as_slice(), &[0_u8; 4096][..]);
    }

    #[test]
    fn mem_block_device_injects_read_failures() {
        let dev = MemBlockDevice::new(1024, 16);
        dev.write_block(BlockNumber(3), &[1_u8; 1024]).expect("write");
        dev.fail_reads_of(BlockNumber(3));
        let err = dev.read_block(BlockNumber(3)).unwrap_err();
        assert!(matches!(err, FsError::Io(_)));
        dev.clear_failures();
        assert_eq!(dev.read_block(BlockNumber(3)).expect("read").as_slice()[0], 1);
        assert_eq!(dev.write_count(), 1);
        assert!(dev.read_block(BlockNumber(16)).is_err());
    }
}
