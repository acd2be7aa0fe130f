#![forbid(unsafe_code)]
//! Checkpoint areas and the mapping blocks that locate ephemeral objects.
//!
//! The descriptor area is a ring of blocks; the live range holds mapping
//! blocks followed by a copy of the superblock. The data area is a second
//! ring holding the ephemeral objects themselves, allocated sequentially.

use cowfs_block::Buffer;
use cowfs_btree::{ObjectStore, corruption_at};
use cowfs_error::{FsError, Result};
use cowfs_ondisk::{CheckpointMap, CheckpointMapping, Superblock};
use cowfs_types::{BlockNumber, OBJ_EPHEMERAL, ObjectId};
use serde::{Deserialize, Serialize};
use tracing::{error, trace};

/// Geometry of the current checkpoint, as recorded in the superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointAreas {
    pub desc_base: BlockNumber,
    pub desc_blocks: u32,
    pub desc_index: u32,
    pub desc_len: u32,
    pub data_base: BlockNumber,
    pub data_blocks: u32,
    pub data_index: u32,
    pub data_len: u32,
}

impl CheckpointAreas {
    #[must_use]
    pub fn from_superblock(sb: &Superblock) -> Self {
        Self {
            desc_base: sb.desc_base,
            desc_blocks: sb.desc_blocks,
            desc_index: sb.desc_index,
            desc_len: sb.desc_len,
            data_base: sb.data_base,
            data_blocks: sb.data_blocks,
            data_index: sb.data_index,
            data_len: sb.data_len,
        }
    }

    /// Copy the geometry back into `sb`.
    pub fn store_into(&self, sb: &mut Superblock) {
        sb.desc_base = self.desc_base;
        sb.desc_blocks = self.desc_blocks;
        sb.desc_index = self.desc_index;
        sb.desc_len = self.desc_len;
        sb.data_base = self.data_base;
        sb.data_blocks = self.data_blocks;
        sb.data_index = self.data_index;
        sb.data_len = self.data_len;
    }

    fn desc_block(&self, index: u32) -> BlockNumber {
        let ring = u64::from(self.desc_blocks.max(1));
        let at = (u64::from(self.desc_index) + u64::from(index)) % ring;
        BlockNumber(self.desc_base.0 + at)
    }

    /// Mapping blocks of the live descriptor range, oldest first.
    #[must_use]
    pub fn mapping_blocks(&self) -> Vec<BlockNumber> {
        (0..self.desc_len.saturating_sub(1))
            .map(|i| self.desc_block(i))
            .collect()
    }

    /// The mapping block new entries are appended to.
    pub fn current_mapping_block(&self) -> Result<BlockNumber> {
        let Some(last) = self.desc_len.checked_sub(2) else {
            return Err(FsError::corruption(
                self.desc_base.0,
                "checkpoint has no mapping block",
            ));
        };
        Ok(self.desc_block(last))
    }

    /// Where the checkpoint's superblock copy lives.
    #[must_use]
    pub fn superblock_copy(&self) -> BlockNumber {
        self.desc_block(self.desc_len.saturating_sub(1))
    }

    /// Every block of the descriptor ring, live or not.
    #[must_use]
    pub fn descriptor_area(&self) -> Vec<BlockNumber> {
        (0..u64::from(self.desc_blocks))
            .map(|i| BlockNumber(self.desc_base.0 + i))
            .collect()
    }

    /// Every block of the data ring.
    #[must_use]
    pub fn data_area(&self) -> Vec<BlockNumber> {
        (0..u64::from(self.data_blocks))
            .map(|i| BlockNumber(self.data_base.0 + i))
            .collect()
    }

    /// Position of `block` in the data ring, counted from the start of the
    /// current checkpoint's data.
    pub fn data_offset(&self, block: BlockNumber) -> Result<u32> {
        let rel = block
            .0
            .checked_sub(self.data_base.0)
            .filter(|&rel| rel < u64::from(self.data_blocks))
            .ok_or_else(|| {
                FsError::corruption(block.0, "block outside the checkpoint data area")
            })?;
        let ring = u64::from(self.data_blocks);
        let off = (rel + ring - u64::from(self.data_index)) % ring;
        u32::try_from(off).map_err(|_| FsError::corruption(block.0, "data offset overflow"))
    }

    /// Block at `offset` in the data ring.
    pub fn data_block(&self, offset: u32) -> Result<BlockNumber> {
        if self.data_blocks == 0 {
            return Err(FsError::corruption(self.data_base.0, "empty checkpoint data area"));
        }
        let ring = u64::from(self.data_blocks);
        let at = (u64::from(offset) + u64::from(self.data_index)) % ring;
        Ok(BlockNumber(self.data_base.0 + at))
    }

    /// Claim the next block of the data ring for a new ephemeral object.
    pub fn allocate_data_block(&mut self) -> Result<BlockNumber> {
        if self.data_len >= self.data_blocks {
            return Err(FsError::NoSpace);
        }
        let block = self.data_block(self.data_len)?;
        self.data_len += 1;
        trace!(block = block.0, data_len = self.data_len, "checkpoint_data_alloc");
        Ok(block)
    }

    // ── Mapping blocks ──────────────────────────────────────────────────────

    /// Block holding ephemeral object `oid`.
    pub fn lookup(&self, store: &dyn ObjectStore, oid: ObjectId) -> Result<BlockNumber> {
        for block in self.mapping_blocks() {
            let buf = store.read_object_block(block, false)?;
            let map = parse_map(&buf)?;
            if let Some(mapping) = map.mappings.iter().find(|m| m.oid == oid) {
                return Ok(mapping.paddr);
            }
        }
        error!(
            invariant = "ephemeral_mapped",
            block = self.desc_base.0,
            oid = oid.0,
            "checkpoint_invariant_violation"
        );
        Err(FsError::corruption(
            self.desc_base.0,
            format!("no checkpoint mapping for ephemeral oid {}", oid.0),
        ))
    }

    /// All mappings of the live range.
    pub fn mappings(&self, store: &dyn ObjectStore) -> Result<Vec<CheckpointMapping>> {
        let mut out = Vec::new();
        for block in self.mapping_blocks() {
            let buf = store.read_object_block(block, false)?;
            out.extend(parse_map(&buf)?.mappings);
        }
        Ok(out)
    }

    /// Record that ephemeral object `oid` of the given type lives at `paddr`.
    pub fn create_mapping(
        &self,
        store: &dyn ObjectStore,
        oid: ObjectId,
        obj_type: u32,
        subtype: u32,
        paddr: BlockNumber,
    ) -> Result<()> {
        let buf = joined_map_block(store, self.current_mapping_block()?)?;
        let mut map = parse_map(&buf)?;
        if map.mappings.len() >= CheckpointMap::capacity(store.block_size()) {
            return Err(FsError::UnsupportedFeature(
                "more than one checkpoint mapping block".to_owned(),
            ));
        }
        map.mappings.push(CheckpointMapping {
            obj_type: obj_type | OBJ_EPHEMERAL,
            subtype,
            size: u32::try_from(store.block_size()).unwrap_or(u32::MAX),
            fs_oid: ObjectId(0),
            oid,
            paddr,
        });
        write_map(&buf, &map)?;
        trace!(
            oid = oid.0,
            paddr = paddr.0,
            count = map.mappings.len(),
            "checkpoint_map_create"
        );
        Ok(())
    }

    /// Drop the mapping for the object at `paddr`. Objects stored after it
    /// in the data ring are remapped one block back; moving their contents
    /// is up to the caller.
    pub fn remove_mapping(&self, store: &dyn ObjectStore, paddr: BlockNumber) -> Result<()> {
        let map_block = self.current_mapping_block()?;
        let buf = joined_map_block(store, map_block)?;
        let mut map = parse_map(&buf)?;
        let removed_off = self.data_offset(paddr)?;

        let mut found = None;
        for (i, mapping) in map.mappings.iter_mut().enumerate() {
            if mapping.paddr == paddr {
                found = Some(i);
            }
            let off = self.data_offset(mapping.paddr)?;
            if off > removed_off {
                mapping.paddr = self.data_block(off - 1)?;
            }
        }
        let Some(index) = found else {
            error!(
                invariant = "ephemeral_mapped",
                block = map_block.0,
                paddr = paddr.0,
                "checkpoint_invariant_violation"
            );
            return Err(FsError::corruption(
                map_block.0,
                format!("no checkpoint mapping for block {}", paddr.0),
            ));
        };
        map.mappings.remove(index);
        write_map(&buf, &map)?;
        trace!(paddr = paddr.0, count = map.mappings.len(), "checkpoint_map_remove");
        Ok(())
    }
}

fn parse_map(buf: &Buffer) -> Result<CheckpointMap> {
    CheckpointMap::parse(&buf.read()).map_err(|e| {
        error!(
            invariant = "cpm_count<=capacity",
            block = buf.block().0,
            "checkpoint_invariant_violation"
        );
        corruption_at(buf.block(), &e)
    })
}

fn write_map(buf: &Buffer, map: &CheckpointMap) -> Result<()> {
    map.write(&mut buf.write())
        .map_err(|e| corruption_at(buf.block(), &e))
}

fn joined_map_block(store: &dyn ObjectStore, block: BlockNumber) -> Result<Buffer> {
    let buf = store.read_object_block(block, true)?;
    if !buf.in_transaction() {
        error!(
            invariant = "cpm_in_transaction",
            block = block.0,
            "checkpoint_invariant_violation"
        );
        return Err(FsError::corruption(
            block.0,
            "checkpoint mapping block is not part of the transaction",
        ));
    }
    Ok(buf)
}
