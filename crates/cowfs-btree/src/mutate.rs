#![forbid(unsafe_code)]
//! Tree mutation: insert, remove and replace on a positioned query, with
//! copy-on-write joins, splits and aggregate bookkeeping.
//!
//! Every operation takes the height of the frame it acts on, counted from
//! the bottom of the query, and recurses upward for separator updates and
//! child attachment.

use crate::key::KeyFamily;
use crate::node::{
    Node, Placement, Record, empty_tree_info, max_key_size, max_record_size, node_flags,
};
use crate::query::{Frame, MAX_DEPTH, Query, TreeRoot};
use crate::search::{anchor, refresh};
use crate::store::ObjectStore;
use cowfs_error::{FsError, Result};
use cowfs_types::StorageClass;
use tracing::{debug, error, trace};

// ── Public operations ───────────────────────────────────────────────────────

/// Create an empty tree: a root that is also its only leaf.
pub fn create_tree(
    store: &dyn ObjectStore,
    storage: StorageClass,
    family: KeyFamily,
) -> Result<TreeRoot> {
    let buf = store.create_node(storage, family.subtype())?;
    let info = empty_tree_info(family, store.block_size());
    let root = Node::format(buf, true, 0, Some(info))?;
    debug!(oid = root.oid().0, block = root.block().0, ?family, "btree_create");
    Ok(TreeRoot {
        oid: root.oid(),
        storage,
    })
}

/// Insert a record right after the one the query stopped at.
///
/// The query must come from a search that ended at a leaf. On success the
/// query points at the new record.
pub fn insert(store: &dyn ObjectStore, q: &mut Query, key: &[u8], val: &[u8]) -> Result<()> {
    let leaf = bottom_leaf(q)?;
    check_record(store, q, &leaf, key.len(), val.len())?;
    insert_rec(store, q, 0, key, val)
}

/// Remove the record the query found.
///
/// The query is left one slot before the removed record.
pub fn remove(store: &dyn ObjectStore, q: &mut Query) -> Result<()> {
    let leaf = bottom_leaf(q)?;
    positioned(q, 0, &leaf)?;
    remove_rec(store, q, 0)
}

/// Replace the key and/or value of the record the query found. The new key
/// must sort in the same position.
pub fn replace(
    store: &dyn ObjectStore,
    q: &mut Query,
    key: Option<&[u8]>,
    val: Option<&[u8]>,
) -> Result<()> {
    let leaf = bottom_leaf(q)?;
    let slot = positioned(q, 0, &leaf)?;
    let key_len = match key {
        Some(k) => k.len(),
        None => leaf.key(slot)?.len(),
    };
    let val_len = match val {
        Some(v) => v.len(),
        None => leaf.value(slot)?.len(),
    };
    check_record(store, q, &leaf, key_len, val_len)?;
    replace_rec(store, q, 0, key, val)
}

fn bottom_leaf(q: &Query) -> Result<Node> {
    let Some(frame) = q.frames.last() else {
        return Err(FsError::corruption(q.root.oid.0, "query has not been run"));
    };
    if !frame.node.is_leaf() {
        return Err(FsError::corruption(
            frame.node.block().0,
            "query did not reach a leaf",
        ));
    }
    Ok(frame.node.clone())
}

fn positioned(q: &Query, height: usize, node: &Node) -> Result<usize> {
    q.frame(height)?
        .slot()
        .filter(|&slot| slot < node.records() as usize)
        .ok_or_else(|| FsError::corruption(node.block().0, "query is not on a record"))
}

fn check_record(
    store: &dyn ObjectStore,
    q: &Query,
    leaf: &Node,
    key_len: usize,
    val_len: usize,
) -> Result<()> {
    if key_len == 0 {
        return Err(FsError::Format("empty b-tree key".to_owned()));
    }
    if let Some((k, v)) = q.family.fixed_sizes(true) {
        if key_len != usize::from(k) || val_len != usize::from(v) {
            return Err(FsError::Format(format!(
                "record {key_len}/{val_len} does not match fixed sizes {k}/{v}"
            )));
        }
    }
    let block_size = store.block_size();
    if key_len > max_key_size(block_size, leaf.family())
        || key_len + val_len > max_record_size(block_size, leaf.family())
    {
        return Err(FsError::RecordTooLarge { key_len, val_len });
    }
    Ok(())
}

// ── Transaction join ────────────────────────────────────────────────────────

/// Make the node at `height` writable in the current transaction, moving
/// physical nodes and repointing their parent.
pub(crate) fn join(store: &dyn ObjectStore, q: &mut Query, height: usize) -> Result<()> {
    let node = q.frame(height)?.node.clone();
    if node.buffer().in_transaction() {
        return Ok(());
    }
    let storage = node.storage();
    match storage {
        StorageClass::Ephemeral => {
            error!(
                invariant = "ephemeral_in_transaction",
                block = node.block().0,
                oid = node.oid().0,
                "btree_invariant_violation"
            );
            return Err(FsError::corruption(
                node.block().0,
                "ephemeral node outside the transaction",
            ));
        }
        StorageClass::Physical if !node.is_root() && !q.has_parent(height) => {
            refresh(store, q, height)?;
        }
        _ => {}
    }

    let copy = store.read_node(node.oid(), storage, true)?;
    trace!(
        oid = node.oid().0,
        from = node.block().0,
        to = copy.block().0,
        "btree_join"
    );
    q.frame_mut(height)?.node = copy.clone();

    if storage == StorageClass::Physical {
        if q.has_parent(height) {
            let ptr = copy.oid().0.to_le_bytes();
            replace_rec(store, q, height + 1, None, Some(&ptr))?;
        } else {
            store.root_relocated(node.oid(), copy.oid())?;
            q.root.oid = copy.oid();
        }
    }
    Ok(())
}

// ── Aggregates ──────────────────────────────────────────────────────────────

fn root_frame(store: &dyn ObjectStore, q: &mut Query) -> Result<Node> {
    anchor(store, q)?;
    let top = q.frames.len() - 1;
    join(store, q, top)?;
    Ok(q.frames[0].node.clone())
}

/// Adjust the record count and the longest key/value marks.
fn change_rec_count(
    store: &dyn ObjectStore,
    q: &mut Query,
    delta: i64,
    key_len: usize,
    val_len: usize,
) -> Result<()> {
    let root = root_frame(store, q)?;
    let mut info = root.info()?;
    let key_len = u32::try_from(key_len).unwrap_or(u32::MAX);
    let val_len = u32::try_from(val_len).unwrap_or(u32::MAX);
    info.longest_key = info.longest_key.max(key_len);
    info.longest_val = info.longest_val.max(val_len);
    info.key_count = info.key_count.checked_add_signed(delta).ok_or_else(|| {
        error!(
            invariant = "key_count>=0",
            block = root.block().0,
            key_count = info.key_count,
            delta,
            "btree_invariant_violation"
        );
        FsError::corruption(root.block().0, "record count underflow")
    })?;
    root.set_info(&info)
}

fn change_node_count(store: &dyn ObjectStore, q: &mut Query, delta: i64) -> Result<()> {
    let root = root_frame(store, q)?;
    let mut info = root.info()?;
    info.node_count = info.node_count.checked_add_signed(delta).ok_or_else(|| {
        error!(
            invariant = "node_count>=1",
            block = root.block().0,
            node_count = info.node_count,
            delta,
            "btree_invariant_violation"
        );
        FsError::corruption(root.block().0, "node count underflow")
    })?;
    root.set_info(&info)
}

// ── Insert ──────────────────────────────────────────────────────────────────

fn insert_rec(
    store: &dyn ObjectStore,
    q: &mut Query,
    height: usize,
    key: &[u8],
    val: &[u8],
) -> Result<()> {
    if q.frame(height)?.node.is_leaf() {
        change_rec_count(store, q, 1, key.len(), val.len())?;
    }
    join(store, q, height)?;

    loop {
        let frame = q.frame(height)?;
        let node = frame.node.clone();
        let at = usize::try_from(frame.index + 1)
            .map_err(|_| FsError::corruption(node.block().0, "bad insert position"))?;
        match node.insert_at(at, key, val)? {
            Placement::Stored => {
                q.frame_mut(height)?.index += 1;
                break;
            }
            Placement::NoRoom if node.is_root() => split(store, q, height)?,
            Placement::NoRoom => {
                anchor(store, q)?;
                if node.records() <= 1 {
                    return single_record_node(store, q, height, key, val);
                }
                split(store, q, height)?;
            }
        }
    }

    if q.frame(height)?.index == 0 && q.has_parent(height) {
        replace_rec(store, q, height + 1, Some(key), None)?;
    }
    Ok(())
}

fn new_sibling(store: &dyn ObjectStore, q: &Query, like: &Node, records: &[Record]) -> Result<Node> {
    let buf = store.create_node(q.root.storage, like.subtype())?;
    let level = like.level();
    let sibling = Node::format(buf, false, level, None)?;
    let flags = node_flags(like.family(), false, level == 0);
    if sibling.rebuild(records, flags, level)? == Placement::NoRoom {
        return Err(FsError::corruption(
            sibling.block().0,
            "records do not fit an empty node",
        ));
    }
    Ok(sibling)
}

/// Add an index record for `child` right after the parent's current one.
fn attach_child(store: &dyn ObjectStore, q: &mut Query, height: usize, child: &Node) -> Result<()> {
    let first = child.key(0)?;
    let ptr = child.oid().0.to_le_bytes();
    insert_rec(store, q, height + 1, &first, &ptr)
}

/// After attaching a sibling, point the parent back at the node the frame
/// stayed in. If that routing record now lives in another parent node the
/// ancestors are dropped and rebuilt on demand.
fn restore_parent(q: &mut Query, height: usize) -> Result<()> {
    let pos = q.pos(height + 1)?;
    if q.frames[pos].index > 0 {
        q.frames[pos].index -= 1;
    } else {
        let keep = q.pos(height)?;
        q.frames.drain(..keep);
    }
    Ok(())
}

/// Split the node at `height` by record count; a root first grows the tree
/// by one level.
fn split(store: &dyn ObjectStore, q: &mut Query, height: usize) -> Result<()> {
    if q.frame(height)?.node.is_root() {
        inc_height(store, q)?;
    }
    let frame = q.frame(height)?;
    let node = frame.node.clone();
    let count = node.records() as usize;
    if count < 2 {
        return Ok(());
    }
    anchor(store, q)?;

    let mid = count / 2;
    let tail = node.split_off(mid)?;
    let sibling = new_sibling(store, q, &node, &tail)?;
    debug!(
        block = node.block().0,
        sibling = sibling.block().0,
        level = node.level(),
        kept = mid,
        moved = tail.len(),
        "btree_split"
    );
    change_node_count(store, q, 1)?;
    attach_child(store, q, height, &sibling)?;

    let mid = i32::try_from(mid).map_err(|_| FsError::corruption(node.block().0, "split overflow"))?;
    let frame = q.frame_mut(height)?;
    if frame.index >= mid {
        frame.node = sibling;
        frame.index -= mid;
        Ok(())
    } else {
        restore_parent(q, height)
    }
}

/// Move the root's records into a new child and turn the root into an index
/// node with a single record. The root keeps its id.
fn inc_height(store: &dyn ObjectStore, q: &mut Query) -> Result<()> {
    let root = q.frames[0].node.clone();
    if q.frames.len() >= MAX_DEPTH {
        error!(
            invariant = "depth<=12",
            block = root.block().0,
            depth = q.frames.len() + 1,
            "btree_invariant_violation"
        );
        return Err(FsError::corruption(
            root.block().0,
            format!("tree would grow deeper than {MAX_DEPTH} levels"),
        ));
    }
    let level = root.level();
    let records = root.all_records()?;
    if records.is_empty() {
        return Err(FsError::corruption(root.block().0, "splitting an empty root"));
    }
    let child = new_sibling(store, q, &root, &records)?;
    let first = child.key(0)?;
    let ptr = child.oid().0.to_le_bytes();
    let new_level = level
        .checked_add(1)
        .ok_or_else(|| FsError::corruption(root.block().0, "tree level overflow"))?;
    let flags = node_flags(root.family(), true, false);
    if root.rebuild(&[(first, ptr.to_vec())], flags, new_level)? == Placement::NoRoom {
        return Err(FsError::corruption(root.block().0, "root cannot hold one index record"));
    }
    debug!(
        root = root.block().0,
        child = child.block().0,
        level = new_level,
        "btree_inc_height"
    );

    let top = &mut q.frames[0];
    let frame = Frame {
        node: child,
        index: top.index,
        flags: top.flags,
        next: top.next,
        done: top.done,
    };
    top.index = 0;
    top.next = false;
    top.done = false;
    q.frames.insert(1, frame);
    change_node_count(store, q, 1)
}

/// Give a record that cannot share a node with the single record already
/// there a node of its own.
fn single_record_node(
    store: &dyn ObjectStore,
    q: &mut Query,
    height: usize,
    key: &[u8],
    val: &[u8],
) -> Result<()> {
    let frame = q.frame(height)?;
    let node = frame.node.clone();
    let record = (key.to_vec(), val.to_vec());

    if frame.index >= 0 {
        let sibling = new_sibling(store, q, &node, &[record])?;
        debug!(block = node.block().0, sibling = sibling.block().0, "btree_single_record_node");
        change_node_count(store, q, 1)?;
        attach_child(store, q, height, &sibling)?;
        let frame = q.frame_mut(height)?;
        frame.node = sibling;
        frame.index = 0;
        return Ok(());
    }

    // The new record goes before the old one: it takes over this node and
    // the old record moves out.
    let old = node.record(0)?;
    replace_rec(store, q, height + 1, Some(key), None)?;
    let hdr = node.header()?;
    if node.rebuild(&[record], hdr.flags, hdr.level)? == Placement::NoRoom {
        return Err(FsError::corruption(node.block().0, "record does not fit an empty node"));
    }
    let sibling = new_sibling(store, q, &node, &[old])?;
    debug!(block = node.block().0, sibling = sibling.block().0, "btree_single_record_node");
    change_node_count(store, q, 1)?;
    attach_child(store, q, height, &sibling)?;
    q.frame_mut(height)?.index = 0;
    restore_parent(q, height)
}

// ── Remove ──────────────────────────────────────────────────────────────────

fn remove_rec(store: &dyn ObjectStore, q: &mut Query, height: usize) -> Result<()> {
    if q.frame(height)?.node.is_leaf() {
        change_rec_count(store, q, -1, 0, 0)?;
    } else {
        change_node_count(store, q, -1)?;
    }
    join(store, q, height)?;

    let frame = q.frame(height)?;
    let node = frame.node.clone();
    let slot = positioned(q, height, &node)?;

    if node.records() == 1 && q.has_parent(height) {
        return delete_node(store, q, height);
    }
    if slot == 0 && q.has_parent(height) {
        let next_first = node.key(1)?;
        replace_rec(store, q, height + 1, Some(&next_first), None)?;
    }

    let node = q.frame(height)?.node.clone();
    node.remove_at(slot)?;
    q.frame_mut(height)?.index -= 1;

    if node.is_root() && node.records() == 0 && node.level() > 0 {
        let flags = node_flags(node.family(), true, true);
        node.rebuild(&[], flags, 0)?;
        debug!(root = node.block().0, "btree_root_demoted");
    }
    Ok(())
}

/// Drop the emptied node at `height` and its routing record.
fn delete_node(store: &dyn ObjectStore, q: &mut Query, height: usize) -> Result<()> {
    let pos = q.pos(height)?;
    let node = q.frames[pos].node.clone();
    debug!(block = node.block().0, oid = node.oid().0, level = node.level(), "btree_delete_node");
    store.delete_node(&node)?;
    q.frames[pos].index = -1;

    if node.storage() == StorageClass::Ephemeral {
        // Later ephemeral objects have moved; pick up their new blocks.
        for frame in &mut q.frames[..pos] {
            frame.node = store.read_node(frame.node.oid(), StorageClass::Ephemeral, true)?;
        }
    }
    remove_rec(store, q, height + 1)
}

// ── Replace ─────────────────────────────────────────────────────────────────

fn replace_rec(
    store: &dyn ObjectStore,
    q: &mut Query,
    height: usize,
    key: Option<&[u8]>,
    val: Option<&[u8]>,
) -> Result<()> {
    if key.is_none() && val.is_none() {
        return Err(FsError::Format("replace without key or value".to_owned()));
    }
    let node = q.frame(height)?.node.clone();
    if node.is_leaf() {
        change_rec_count(
            store,
            q,
            0,
            key.map_or(0, <[u8]>::len),
            val.map_or(0, <[u8]>::len),
        )?;
    } else {
        anchor(store, q)?;
    }
    join(store, q, height)?;

    loop {
        if let Some(k) = key {
            if q.has_parent(height) && q.frame(height)?.index == 0 {
                replace_rec(store, q, height + 1, Some(k), None)?;
            }
        }
        let node = q.frame(height)?.node.clone();
        let slot = positioned(q, height, &node)?;
        match node.replace_at(slot, key, val)? {
            Placement::Stored => return Ok(()),
            Placement::NoRoom => {
                if node.records() <= 1 {
                    error!(
                        invariant = "single_record_fits",
                        block = node.block().0,
                        "btree_invariant_violation"
                    );
                    return Err(FsError::corruption(
                        node.block().0,
                        "defragmented node has no room for its only record",
                    ));
                }
                if !node.is_root() {
                    anchor(store, q)?;
                }
                split(store, q, height)?;
            }
        }
    }
}
