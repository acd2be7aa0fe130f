#![forbid(unsafe_code)]
//! Runtime and format-time configuration.

use cowfs_error::{FsError, Result};
use cowfs_types::BlockSize;
use serde::{Deserialize, Serialize};

/// Options controlling how an opened container behaves.
///
/// Both fields default to `true`. Every field may be omitted in JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerOptions {
    /// Verify the Fletcher-64 checksum of every block read from the device.
    ///
    /// A container formatted with checksum checking recorded in its
    /// superblock verifies regardless of this setting.
    pub verify_checksums: bool,
    /// Place relocated and new blocks from the end of the device backwards.
    pub allocate_backwards: bool,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            verify_checksums: true,
            allocate_backwards: true,
        }
    }
}

impl ContainerOptions {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| FsError::Format(format!("container options: {e}")))
    }
}

/// Geometry of a container to be formatted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatOptions {
    pub block_size: u32,
    /// Blocks to use; `None` takes the whole device.
    pub block_count: Option<u64>,
    /// Size of the checkpoint descriptor ring (mapping blocks plus the
    /// superblock copy).
    pub checkpoint_desc_blocks: u32,
    /// Size of the checkpoint data ring holding ephemeral objects.
    pub checkpoint_data_blocks: u32,
    /// Record in the superblock that every node read must be checksummed.
    pub check_nodes: bool,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            block_count: None,
            checkpoint_desc_blocks: 4,
            checkpoint_data_blocks: 32,
            check_nodes: false,
        }
    }
}

/// Blocks needed beyond the fixed areas: object map root, catalog root and
/// some room to relocate them.
const MIN_FREE_BLOCKS: u64 = 8;

impl FormatOptions {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| FsError::Format(format!("format options: {e}")))
    }

    /// Check the geometry against a device of `device_blocks` blocks of
    /// `device_block_size` bytes and return the block count to format.
    pub fn validate(&self, device_block_size: u32, device_blocks: u64) -> Result<u64> {
        BlockSize::new(self.block_size).map_err(|e| FsError::Format(e.to_string()))?;
        if self.block_size != device_block_size {
            return Err(FsError::Format(format!(
                "block_size {} does not match device block size {device_block_size}",
                self.block_size
            )));
        }
        let blocks = self.block_count.unwrap_or(device_blocks);
        if blocks > device_blocks {
            return Err(FsError::Format(format!(
                "block_count {blocks} exceeds the device ({device_blocks} blocks)"
            )));
        }
        if self.checkpoint_desc_blocks < 2 {
            return Err(FsError::Format(
                "checkpoint descriptor area needs at least 2 blocks".to_owned(),
            ));
        }
        if self.checkpoint_data_blocks == 0 {
            return Err(FsError::Format("checkpoint data area is empty".to_owned()));
        }
        let fixed = 1 + u64::from(self.checkpoint_desc_blocks) + u64::from(self.checkpoint_data_blocks);
        if blocks < fixed + MIN_FREE_BLOCKS {
            return Err(FsError::Format(format!(
                "{blocks} blocks leave no room after {fixed} reserved blocks"
            )));
        }
        Ok(blocks)
    }
}
