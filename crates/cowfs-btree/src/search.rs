#![forbid(unsafe_code)]
//! Tree search: descent, in-node bisection, backward iteration and cursor
//! repair.

use crate::node::Node;
use crate::query::{Frame, MAX_DEPTH, Query, QueryFlags, SearchResult};
use crate::store::{Diagnostic, ObjectStore};
use cowfs_error::{FsError, Result};
use std::cmp::Ordering;
use tracing::{error, trace};

/// Outcome of one in-node search step.
enum Step {
    Found,
    NotFound,
    /// This node has no more candidates; continue in the parent.
    Retry,
}

// ── Public entry point ──────────────────────────────────────────────────────

/// Run `q` against its tree.
///
/// On `Found` the bottom frame sits on the matching record. On `NotFound`
/// with an inexact query the bottom frame sits on the record after which
/// the key would be inserted, or at index `-1` if it sorts before every
/// record. A `MULTIPLE` query can be run again to step to the previous
/// match.
pub fn query(store: &dyn ObjectStore, q: &mut Query) -> Result<SearchResult> {
    search(store, q, None)
}

pub(crate) fn search(
    store: &dyn ObjectStore,
    q: &mut Query,
    stop_level: Option<u16>,
) -> Result<SearchResult> {
    if q.frames.is_empty() {
        let root = store.read_node(q.root.oid, q.root.storage, false)?;
        if !root.is_root() {
            error!(
                invariant = "tree_root_flag",
                block = root.block().0,
                oid = q.root.oid.0,
                "btree_invariant_violation"
            );
            return Err(FsError::corruption(root.block().0, "tree root lacks the root flag"));
        }
        q.frames.push(Frame::new(root, q.flags)?);
    }

    loop {
        let pos = q.frames.len() - 1;
        match node_query(q, pos)? {
            Step::Found => {}
            Step::NotFound => {
                if q.frames.len() == 1 && q.frames[0].index == -1 {
                    set_before_first(store, q)?;
                }
                return Ok(SearchResult::NotFound);
            }
            Step::Retry => {
                if q.frames.len() == 1 {
                    return Ok(SearchResult::NotFound);
                }
                q.frames.pop();
                continue;
            }
        }

        let frame = &q.frames[pos];
        let node = &frame.node;
        if node.is_leaf() || stop_level == Some(node.level()) {
            return Ok(SearchResult::Found);
        }
        let slot = frame.slot().unwrap_or_default();
        let child = descend(store, q, node, slot)?;
        push_frame(q, child)?;
    }
}

/// Read the child routed to by record `slot` of index node `node`.
fn descend(store: &dyn ObjectStore, q: &Query, node: &Node, slot: usize) -> Result<Node> {
    let ptr = node.child_id(slot)?;
    let child = store.read_node(ptr, q.root.storage, false)?;
    trace!(parent = node.block().0, slot, child = ptr.0, "btree_descend");
    if child.oid() != ptr {
        store.diagnostics().record(Diagnostic::ChildIdMismatch {
            block: child.block(),
            expected: ptr,
            found: child.oid(),
        });
    }
    if child.is_root() || u32::from(child.level()) + 1 != u32::from(node.level()) {
        error!(
            invariant = "child_level==parent_level-1",
            block = child.block().0,
            parent = node.block().0,
            level = child.level(),
            parent_level = node.level(),
            "btree_invariant_violation"
        );
        return Err(FsError::corruption(
            child.block().0,
            format!(
                "child at level {} under parent at level {}",
                child.level(),
                node.level()
            ),
        ));
    }
    Ok(child)
}

fn push_frame(q: &mut Query, child: Node) -> Result<()> {
    if q.frames.len() >= MAX_DEPTH {
        error!(
            invariant = "depth<=12",
            block = child.block().0,
            depth = q.frames.len() + 1,
            "btree_invariant_violation"
        );
        return Err(FsError::corruption(
            child.block().0,
            format!("tree deeper than {MAX_DEPTH} levels"),
        ));
    }
    q.frames.push(Frame::new(child, q.flags)?);
    Ok(())
}

// ── In-node search ──────────────────────────────────────────────────────────

fn compare_at(q: &Query, node: &Node, index: usize, multiple: bool) -> Result<Ordering> {
    let stored = node.key(index)?;
    q.family
        .compare(&stored, &q.key, multiple)
        .map_err(|e| crate::node::parse_err(node.block(), &e))
}

/// Bisect for the last record not after the key, below the frame's current
/// index.
fn node_query(q: &mut Query, pos: usize) -> Result<Step> {
    if q.frames[pos].next {
        return node_next(q, pos);
    }
    let frame = &q.frames[pos];
    let node = frame.node.clone();
    let multiple = frame.multiple();
    let bound = frame.slot().unwrap_or_default().min(node.records() as usize);

    let (mut lo, mut hi) = (0_usize, bound);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if compare_at(q, &node, mid, multiple)? == Ordering::Greater {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }

    let frame = &mut q.frames[pos];
    let Some(candidate) = lo.checked_sub(1) else {
        frame.index = -1;
        return Ok(Step::NotFound);
    };
    frame.index = i32::try_from(candidate)
        .map_err(|_| FsError::corruption(node.block().0, "record index overflow"))?;
    let cmp = compare_at(q, &node, candidate, multiple)?;

    let frame = &mut q.frames[pos];
    if cmp != Ordering::Equal && node.is_leaf() && frame.exact() {
        return Ok(Step::NotFound);
    }
    if frame.multiple() {
        if cmp != Ordering::Equal {
            frame.done = true;
        }
        frame.next = true;
    }
    Ok(Step::Found)
}

/// Step back one record during a multiple-match walk.
fn node_next(q: &mut Query, pos: usize) -> Result<Step> {
    let frame = &mut q.frames[pos];
    if frame.done {
        return Ok(Step::NotFound);
    }
    if frame.index <= 0 {
        return Ok(Step::Retry);
    }
    frame.index -= 1;
    let node = frame.node.clone();
    let index = frame.slot().unwrap_or_default();
    let exact = frame.exact();

    let cmp = compare_at(q, &node, index, true)?;
    if cmp == Ordering::Greater {
        error!(
            invariant = "records_ordered",
            block = node.block().0,
            index,
            "btree_invariant_violation"
        );
        return Err(FsError::corruption(node.block().0, "records out of order"));
    }
    if cmp != Ordering::Equal {
        if node.is_leaf() && exact {
            return Ok(Step::NotFound);
        }
        q.frames[pos].done = true;
    }
    Ok(Step::Found)
}

/// Position the query before the first record of the tree, taking the
/// first child at each index level.
fn set_before_first(store: &dyn ObjectStore, q: &mut Query) -> Result<()> {
    loop {
        let pos = q.frames.len() - 1;
        let node = q.frames[pos].node.clone();
        if node.is_leaf() {
            q.frames[pos].index = -1;
            return Ok(());
        }
        if node.records() == 0 {
            return Err(FsError::corruption(node.block().0, "empty index node"));
        }
        q.frames[pos].index = 0;
        let child = descend(store, q, &node, 0)?;
        push_frame(q, child)?;
    }
}

// ── Cursor repair ───────────────────────────────────────────────────────────

/// Rebuild the ancestors of the frame at `height` by searching again from
/// the root for the node's current key.
pub(crate) fn refresh(store: &dyn ObjectStore, q: &mut Query, height: usize) -> Result<()> {
    let pos = q.pos(height)?;
    let node = q.frames[pos].node.clone();
    if node.records() == 0 {
        return Err(FsError::corruption(node.block().0, "cannot refresh an empty node"));
    }
    let slot = q.frames[pos].slot().unwrap_or_default();
    let key = node.key(slot)?;

    let mut fresh = Query::new(q.root, q.family, key, QueryFlags::NONE);
    let found = search(store, &mut fresh, Some(node.level()))?;
    let bottom = fresh.frames.pop();
    let same = bottom.is_some_and(|f| f.node.block() == node.block());
    if found != SearchResult::Found || !same {
        error!(
            invariant = "refresh_reaches_node",
            block = node.block().0,
            level = node.level(),
            "btree_invariant_violation"
        );
        return Err(FsError::corruption(
            node.block().0,
            "node is not reachable from the tree root",
        ));
    }

    for frame in &mut fresh.frames {
        frame.flags = q.flags;
        frame.next = false;
        frame.done = false;
    }
    trace!(
        block = node.block().0,
        ancestors = fresh.frames.len(),
        "btree_cursor_refresh"
    );
    let below = q.frames.split_off(pos);
    q.frames = fresh.frames;
    q.frames.extend(below);
    Ok(())
}

/// Make sure the top frame is the tree root.
pub(crate) fn anchor(store: &dyn ObjectStore, q: &mut Query) -> Result<()> {
    let Some(top) = q.frames.first() else {
        return Err(FsError::corruption(q.root.oid.0, "query has not been run"));
    };
    if top.node.is_root() {
        return Ok(());
    }
    refresh(store, q, q.frames.len() - 1)
}
