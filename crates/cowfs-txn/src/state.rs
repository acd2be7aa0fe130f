#![forbid(unsafe_code)]
//! Bookkeeping for the running write transaction.

use cowfs_block::Buffer;
use cowfs_types::{BlockNumber, Xid};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::trace;

/// How a block came to be in the write set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinKind {
    /// Allocated during this transaction; abort hands it back.
    Allocated,
    /// Written where it stands (superblock, checkpoint blocks, ephemeral
    /// objects); abort reloads it from disk.
    InPlace,
}

/// Counters reported when a transaction ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnSummary {
    pub xid: Xid,
    pub written: usize,
    pub allocated: usize,
    pub reclaimed: usize,
}

/// Write set, reclamation queue and allocation log of one transaction.
#[derive(Debug)]
pub struct TxnState {
    xid: Xid,
    writes: BTreeMap<BlockNumber, (Buffer, JoinKind)>,
    reclaim: Vec<BlockNumber>,
    released: Vec<BlockNumber>,
}

impl TxnState {
    #[must_use]
    pub fn new(xid: Xid) -> Self {
        Self {
            xid,
            writes: BTreeMap::new(),
            reclaim: Vec::new(),
            released: Vec::new(),
        }
    }

    #[must_use]
    pub fn xid(&self) -> Xid {
        self.xid
    }

    /// Add `buf` to the write set and flag it as joined. Joining twice is a
    /// no-op.
    pub fn join(&mut self, buf: &Buffer, kind: JoinKind) {
        buf.set_in_transaction(true);
        self.writes
            .entry(buf.block())
            .or_insert_with(|| (buf.clone(), kind));
        trace!(block = buf.block().0, ?kind, "txn_join");
    }

    #[must_use]
    pub fn joined(&self, block: BlockNumber) -> Option<&Buffer> {
        self.writes.get(&block).map(|(buf, _)| buf)
    }

    /// Queue a block that the committed state still references for release
    /// once this transaction commits. A block allocated by this same
    /// transaction is dropped from the write set and released directly.
    pub fn defer_free(&mut self, block: BlockNumber) {
        if let Some((buf, JoinKind::Allocated)) = self.writes.get(&block) {
            buf.set_in_transaction(false);
            self.writes.remove(&block);
            self.released.push(block);
            trace!(block = block.0, "txn_release_own_block");
            return;
        }
        self.reclaim.push(block);
        trace!(block = block.0, queued = self.reclaim.len(), "txn_defer_free");
    }

    /// Blocks to write at commit, in block order.
    pub fn write_set(&self) -> impl Iterator<Item = &Buffer> {
        self.writes.values().map(|(buf, _)| buf)
    }

    /// Blocks allocated by this transaction that are still in use.
    pub fn allocated(&self) -> impl Iterator<Item = BlockNumber> + '_ {
        self.writes
            .iter()
            .filter(|(_, (_, kind))| *kind == JoinKind::Allocated)
            .map(|(block, _)| *block)
    }

    /// Blocks joined in place.
    pub fn in_place(&self) -> impl Iterator<Item = &Buffer> {
        self.writes
            .values()
            .filter(|(_, kind)| *kind == JoinKind::InPlace)
            .map(|(buf, _)| buf)
    }

    /// Blocks that become free when this transaction commits.
    #[must_use]
    pub fn reclaim_queue(&self) -> &[BlockNumber] {
        &self.reclaim
    }

    /// Blocks allocated and given up again within this transaction. They
    /// go back to the allocator on commit and on abort alike.
    #[must_use]
    pub fn released(&self) -> &[BlockNumber] {
        &self.released
    }

    /// Clear the joined flag on every buffer and report what was done.
    pub fn finish(self) -> TxnSummary {
        let summary = self.summary();
        for (buf, _) in self.writes.values() {
            buf.set_in_transaction(false);
        }
        summary
    }

    #[must_use]
    pub fn summary(&self) -> TxnSummary {
        TxnSummary {
            xid: self.xid,
            written: self.writes.len(),
            allocated: self.allocated().count(),
            reclaimed: self.reclaim.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(n: u64) -> Buffer {
        Buffer::detached(BlockNumber(n), vec![0; 64])
    }

    #[test]
    fn join_is_idempotent_and_flags_the_buffer() {
        let mut txn = TxnState::new(Xid(7));
        let b = buf(3);
        txn.join(&b, JoinKind::Allocated);
        txn.join(&b, JoinKind::InPlace);
        assert!(b.in_transaction());
        assert_eq!(txn.write_set().count(), 1);
        assert_eq!(txn.allocated().collect::<Vec<_>>(), vec![BlockNumber(3)]);
        assert!(txn.joined(BlockNumber(3)).is_some_and(|j| j.ptr_eq(&b)));
    }

    #[test]
    fn fresh_transaction_summary_carries_only_its_xid() {
        let txn = TxnState::new(Xid(9));
        assert_eq!(
            txn.summary(),
            TxnSummary {
                xid: Xid(9),
                written: 0,
                allocated: 0,
                reclaimed: 0,
            }
        );
    }

    #[test]
    fn freeing_own_allocation_skips_the_queue() {
        let mut txn = TxnState::new(Xid(2));
        let own = buf(10);
        txn.join(&own, JoinKind::Allocated);
        txn.defer_free(BlockNumber(10));
        txn.defer_free(BlockNumber(4));
        assert!(!own.in_transaction());
        assert_eq!(txn.write_set().count(), 0);
        assert_eq!(txn.released(), &[BlockNumber(10)]);
        assert_eq!(txn.reclaim_queue(), &[BlockNumber(4)]);
    }

    #[test]
    fn finish_clears_flags_and_counts() {
        let mut txn = TxnState::new(Xid(5));
        let (a, b) = (buf(1), buf(2));
        txn.join(&a, JoinKind::InPlace);
        txn.join(&b, JoinKind::Allocated);
        txn.defer_free(BlockNumber(30));
        assert_eq!(txn.in_place().count(), 1);
        let summary = txn.finish();
        assert!(!a.in_transaction() && !b.in_transaction());
        assert_eq!(
            summary,
            TxnSummary {
                xid: Xid(5),
                written: 2,
                allocated: 1,
                reclaimed: 1,
            }
        );
    }
}
