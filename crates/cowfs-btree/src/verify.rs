#![forbid(unsafe_code)]
//! Whole-tree walks: in-order traversal and structural verification.

use crate::node::{Node, Record};
use crate::query::{MAX_DEPTH, TreeRoot};
use crate::store::ObjectStore;
use cowfs_error::{FsError, Result};
use serde::Serialize;
use std::cmp::Ordering;
use tracing::{debug, error};

/// Summary of a verified tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TreeStats {
    /// Levels, counting the leaves.
    pub depth: usize,
    pub nodes: u64,
    pub leaf_nodes: u64,
    pub records: u64,
    pub longest_key: u32,
    pub longest_val: u32,
}

// ── Walk ────────────────────────────────────────────────────────────────────

/// Visit every node of the tree depth-first, parents before children and
/// children in key order.
pub fn walk<F>(store: &dyn ObjectStore, root: TreeRoot, visit: &mut F) -> Result<()>
where
    F: FnMut(&Node) -> Result<()>,
{
    let node = store.read_node(root.oid, root.storage, false)?;
    walk_subtree(store, root, &node, 1, visit)
}

fn walk_subtree<F>(
    store: &dyn ObjectStore,
    root: TreeRoot,
    node: &Node,
    depth: usize,
    visit: &mut F,
) -> Result<()>
where
    F: FnMut(&Node) -> Result<()>,
{
    if depth > MAX_DEPTH {
        error!(
            invariant = "depth<=12",
            block = node.block().0,
            depth,
            "btree_invariant_violation"
        );
        return Err(FsError::corruption(
            node.block().0,
            format!("tree deeper than {MAX_DEPTH} levels"),
        ));
    }
    visit(node)?;
    if node.is_leaf() {
        return Ok(());
    }
    for slot in 0..node.records() as usize {
        let child = store.read_node(node.child_id(slot)?, root.storage, false)?;
        walk_subtree(store, root, &child, depth + 1, visit)?;
    }
    Ok(())
}

/// Every leaf record of the tree in key order.
pub fn collect_records(store: &dyn ObjectStore, root: TreeRoot) -> Result<Vec<Record>> {
    let mut out = Vec::new();
    walk(store, root, &mut |node: &Node| {
        if node.is_leaf() {
            out.extend(node.all_records()?);
        }
        Ok(())
    })?;
    Ok(out)
}

// ── Verify ──────────────────────────────────────────────────────────────────

struct Checker<'a> {
    store: &'a dyn ObjectStore,
    root: TreeRoot,
    stats: TreeStats,
    last_key: Option<Vec<u8>>,
}

/// Check ordering, separators, levels and the root aggregates of a tree.
pub fn verify_tree(store: &dyn ObjectStore, root: TreeRoot) -> Result<TreeStats> {
    let node = store.read_node(root.oid, root.storage, false)?;
    if !node.is_root() {
        return Err(FsError::corruption(node.block().0, "tree root lacks the root flag"));
    }
    let info = node.info()?;
    let mut checker = Checker {
        store,
        root,
        stats: TreeStats::default(),
        last_key: None,
    };
    checker.stats.depth = usize::from(node.level()) + 1;
    checker.check(&node, None, 1)?;
    let stats = checker.stats;

    let block = node.block().0;
    if info.key_count != stats.records {
        return Err(mismatch(block, "key_count", info.key_count, stats.records));
    }
    if info.node_count != stats.nodes {
        return Err(mismatch(block, "node_count", info.node_count, stats.nodes));
    }
    if info.longest_key < stats.longest_key || info.longest_val < stats.longest_val {
        return Err(FsError::corruption(
            block,
            "longest key/value marks below stored record sizes",
        ));
    }
    debug!(
        root = root.oid.0,
        depth = stats.depth,
        nodes = stats.nodes,
        records = stats.records,
        "btree_verified"
    );
    Ok(stats)
}

fn mismatch(block: u64, field: &str, stored: u64, counted: u64) -> FsError {
    error!(
        invariant = "root_aggregates",
        block,
        field,
        stored,
        counted,
        "btree_invariant_violation"
    );
    FsError::corruption(block, format!("{field} is {stored} but the tree holds {counted}"))
}

impl Checker<'_> {
    fn check(&mut self, node: &Node, separator: Option<&[u8]>, depth: usize) -> Result<()> {
        let block = node.block().0;
        if depth > MAX_DEPTH {
            return Err(FsError::corruption(block, format!("tree deeper than {MAX_DEPTH} levels")));
        }
        let expected_level = self
            .stats
            .depth
            .checked_sub(depth)
            .ok_or_else(|| FsError::corruption(block, "node below the leaf level"))?;
        if usize::from(node.level()) != expected_level {
            return Err(FsError::corruption(
                block,
                format!("level {} where {expected_level} was expected", node.level()),
            ));
        }
        if depth > 1 && node.is_root() {
            return Err(FsError::corruption(block, "root flag on an inner node"));
        }
        self.stats.nodes += 1;

        let records = node.all_records()?;
        if records.is_empty() && depth > 1 {
            return Err(FsError::corruption(block, "empty non-root node"));
        }
        if let (Some(sep), Some((first, _))) = (separator, records.first()) {
            if sep != first.as_slice() {
                error!(
                    invariant = "first_key==separator",
                    block,
                    "btree_invariant_violation"
                );
                return Err(FsError::corruption(block, "first key differs from parent separator"));
            }
        }
        for pair in records.windows(2) {
            if self.order(node, &pair[0].0, &pair[1].0)? != Ordering::Less {
                return Err(FsError::corruption(block, "records out of order"));
            }
        }

        if node.is_leaf() {
            self.stats.leaf_nodes += 1;
            for (key, val) in &records {
                if let Some(last) = &self.last_key {
                    if self.order(node, last, key)? != Ordering::Less {
                        return Err(FsError::corruption(block, "keys not increasing across leaves"));
                    }
                }
                self.stats.records += 1;
                self.stats.longest_key = self.stats.longest_key.max(len_u32(key));
                self.stats.longest_val = self.stats.longest_val.max(len_u32(val));
                self.last_key = Some(key.clone());
            }
            return Ok(());
        }

        for (slot, (key, _)) in records.iter().enumerate() {
            let child = self
                .store
                .read_node(node.child_id(slot)?, self.root.storage, false)?;
            self.check(&child, Some(key), depth + 1)?;
        }
        Ok(())
    }

    fn order(&self, node: &Node, a: &[u8], b: &[u8]) -> Result<Ordering> {
        node.family()
            .compare(a, b, false)
            .map_err(|e| crate::node::parse_err(node.block(), &e))
    }
}

fn len_u32(bytes: &[u8]) -> u32 {
    u32::try_from(bytes.len()).unwrap_or(u32::MAX)
}
