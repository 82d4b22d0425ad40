//! Bulk insertion of key-sorted point batches.
//!
//! A batch arrives with the node its keys were located at. Leaves with room
//! absorb points directly. An over-full leaf is rebuilt into a subtree from a
//! FIFO of pending key ranges. A branch slot that holds a subtree diverging
//! from the batch gets its edge split by a chain of new branches. Afterwards
//! the point delta climbs the ancestors under pooled counter locks.

use std::collections::VecDeque;

use log::{trace, warn};

use crate::config::{BRANCH_BITS, LEAF_SIZE, MAX_RANGE_QUERY_SIZE};
use crate::error::{Error, Result};
use crate::geometry::{BoundingBox, Point};
use crate::morton::{match_height, next_branch, prefix_box, prune_tail};
use crate::node::{BranchNode, LeafNode, NodeKind, NodeRef};
use crate::storage::TrieStorage;

/// Pending sub-range of a subtree rebuild.
#[derive(Debug, Clone, Copy)]
struct RebuildRange {
    begin: usize,
    end: usize,
    parent: u32,
    slot: usize,
}

/// Split key-sorted points into maximal runs sharing the child slot at `height`.
fn slot_runs(points: &[Point], height: u32) -> impl Iterator<Item = (usize, usize, usize)> + '_ {
    let mut start = 0;
    std::iter::from_fn(move || {
        if start >= points.len() {
            return None;
        }
        let slot = next_branch(points[start].key, height);
        let mut stop = start + 1;
        while stop < points.len() && next_branch(points[stop].key, height) == slot {
            stop += 1;
        }
        let run = (slot, start, stop);
        start = stop;
        Some(run)
    })
}

/// Leaf holding exactly `points`, which must be key-sorted and fit.
fn build_leaf(points: &[Point], parent: u32) -> LeafNode {
    debug_assert!(!points.is_empty() && points.len() <= LEAF_SIZE);
    let first = points[0].key;
    let height = match_height(first, points[points.len() - 1].key);
    let mut leaf = LeafNode::empty(Some(parent));
    leaf.height = height;
    leaf.key = prune_tail(first, height);
    leaf.len = points.len();
    for (dst, p) in leaf.points.iter_mut().zip(points) {
        *dst = *p;
        leaf.bbox.extend(&p.coord);
    }
    leaf
}

/// Append points to a leaf with room, narrowing its prefix as needed.
fn append_points(leaf: &mut LeafNode, points: &[Point]) {
    for p in points {
        if leaf.len == 0 {
            leaf.height = 64;
            leaf.key = p.key;
        } else {
            leaf.height = leaf.height.min(match_height(p.key, leaf.key));
        }
        leaf.bbox.extend(&p.coord);
        leaf.points[leaf.len] = *p;
        leaf.len += 1;
    }
    leaf.key = prune_tail(leaf.key, leaf.height);
}

/// A run of more than `LEAF_SIZE` equal keys can never be split.
fn check_collisions(points: &[Point]) -> Result<()> {
    let mut run = 0usize;
    for (i, p) in points.iter().enumerate() {
        run = if i > 0 && points[i - 1].key == p.key { run + 1 } else { 1 };
        if run > LEAF_SIZE {
            warn!("key {:#018x} repeated beyond leaf capacity", p.key);
            return Err(Error::KeyCollision { key: p.key });
        }
    }
    Ok(())
}

impl TrieStorage {
    /// Insert key-sorted `points` at the node a search located for them.
    ///
    /// `target` is either a leaf (with its parent slot in the info byte) or a
    /// branch with the slot the descent stopped at.
    pub fn insert_batch(&self, target: NodeRef, points: &[Point]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        debug_assert!(points.windows(2).all(|w| w[0].key <= w[1].key));
        let delta = points.len() as i64;
        let slot = target
            .slot()
            .ok_or_else(|| Error::MalformedRequest(format!("insert target {target} has no slot")))?;
        match target.kind() {
            Some(NodeKind::Leaf) => {
                let parent = self
                    .leaf_meta(target.index())?
                    .parent
                    .ok_or_else(|| Error::DanglingNode(target.to_string()))?;
                self.leaf_insert(target.index(), slot, points)?;
                self.maintain_ancestor_counter(parent, delta)
            }
            Some(NodeKind::Branch) => {
                if let Some(parent) = self.branch_insert(target.index(), slot, points)? {
                    self.maintain_ancestor_counter(parent, delta)?;
                }
                Ok(())
            }
            None => Err(Error::DanglingNode(target.to_string())),
        }
    }

    /// Insert into a leaf sitting at `slot` of its parent.
    fn leaf_insert(&self, leaf: u32, slot: usize, points: &[Point]) -> Result<()> {
        let staged = self.load_leaf(leaf)?;
        if staged.len + points.len() <= LEAF_SIZE {
            self.update_leaf(leaf, |l| append_points(l, points))
        } else {
            self.rebuild_leaf(leaf, &staged, slot, points)
        }
    }

    /// Replace an over-full leaf by a subtree holding its points and `batch`.
    /// The old leaf node is reused for the first new leaf.
    fn rebuild_leaf(&self, leaf: u32, staged: &LeafNode, slot: usize, batch: &[Point]) -> Result<()> {
        let parent = staged
            .parent
            .ok_or_else(|| Error::DanglingNode(self.leaf_ref(leaf).to_string()))?;

        let mut existing: Vec<Point> = staged.points().to_vec();
        existing.sort_by_key(|p| p.key);
        let mut merged = Vec::with_capacity(existing.len() + batch.len());
        let mut rest = existing.iter().peekable();
        for p in batch {
            while let Some(e) = rest.next_if(|e| e.key <= p.key) {
                merged.push(*e);
            }
            merged.push(*p);
        }
        merged.extend(rest);
        check_collisions(&merged)?;

        trace!(
            "shard {}: rebuilding leaf {} with {} points",
            self.shard_id(),
            leaf,
            merged.len()
        );

        let mut reuse = Some(leaf);
        let mut pending = VecDeque::new();
        pending.push_back(RebuildRange {
            begin: 0,
            end: merged.len(),
            parent,
            slot,
        });

        while let Some(range) = pending.pop_front() {
            let keys = &merged[range.begin..range.end];
            let first = keys[0].key;
            let height = match_height(first, keys[keys.len() - 1].key);
            let key = prune_tail(first, height);
            let (min, max) = prefix_box(key, height);
            let mut branch = BranchNode::new(height, key, Some(range.parent), BoundingBox { min, max });
            branch.subtree_size = keys.len() as i64;
            let b = self.alloc_branch(branch)?;

            for (child_slot, start, stop) in slot_runs(keys, height) {
                let (start, stop) = (range.begin + start, range.begin + stop);
                if stop - start > LEAF_SIZE {
                    pending.push_back(RebuildRange {
                        begin: start,
                        end: stop,
                        parent: b,
                        slot: child_slot,
                    });
                    continue;
                }
                let node = build_leaf(&merged[start..stop], b);
                let index = match reuse.take() {
                    Some(index) => {
                        self.store_leaf(index, &node)?;
                        index
                    }
                    None => self.alloc_leaf(node)?,
                };
                self.set_child(b, child_slot, self.leaf_ref(index))?;
            }
            self.set_child(range.parent, range.slot, self.branch_ref(b))?;
        }
        Ok(())
    }

    /// Insert below `slot` of branch `addr`. Returns the parent of `addr`,
    /// from which ancestor counters still need the delta.
    fn branch_insert(&self, addr: u32, slot: usize, points: &[Point]) -> Result<Option<u32>> {
        let delta = points.len() as i64;
        let parent = {
            let _guard = self.counter_lock(addr);
            self.update_branch(addr, |b| {
                b.subtree_size += delta;
                b.parent
            })?
        };

        let existing = self.branch_child(addr, slot)?;
        if existing.is_null() {
            let leaf = self.alloc_leaf(LeafNode::empty(Some(addr)))?;
            self.set_child(addr, slot, self.leaf_ref(leaf))?;
            self.leaf_insert(leaf, slot, points)?;
            return Ok(parent);
        }
        let original = self.expect_branch(existing)?;
        self.split_edge(addr, slot, existing, original, points)?;
        Ok(parent)
    }

    /// The subtree at `slot` of `addr` diverges from `points` above its own
    /// height. Chain new branches down the shared prefix until no batch point
    /// follows the original subtree's path any further.
    fn split_edge(
        &self,
        mut addr: u32,
        mut slot: usize,
        original_ref: NodeRef,
        original: u32,
        points: &[Point],
    ) -> Result<()> {
        let original_key = self.branch_meta(original)?.key;
        let first = points[0].key;
        let last = points[points.len() - 1].key;
        let mut height = match_height(first, original_key).min(match_height(last, original_key));
        let mut range = points;

        trace!(
            "shard {}: splitting edge above branch {} at height {}",
            self.shard_id(),
            original,
            height
        );

        while !range.is_empty() {
            let original_slot = next_branch(original_key, height);
            let key = prune_tail(original_key, height);
            let (min, max) = prefix_box(key, height);
            let mut node = BranchNode::new(height, key, Some(addr), BoundingBox { min, max });
            node.children[original_slot] = original_ref;
            let b = self.alloc_branch(node)?;
            self.set_child(addr, slot, self.branch_ref(b))?;
            {
                let _guard = self.counter_lock(original);
                let below = self.update_branch(original, |o| {
                    o.parent = Some(b);
                    o.subtree_size
                })?;
                self.update_branch(b, |n| n.subtree_size = below + range.len() as i64)?;
            }

            let mut follow: &[Point] = &[];
            for (child_slot, start, stop) in slot_runs(range, height) {
                let run = &range[start..stop];
                if child_slot == original_slot {
                    follow = run;
                    continue;
                }
                let leaf = self.alloc_leaf(LeafNode::empty(Some(b)))?;
                self.set_child(b, child_slot, self.leaf_ref(leaf))?;
                self.leaf_insert(leaf, child_slot, run)?;
            }
            range = follow;
            addr = b;
            slot = original_slot;
            height += BRANCH_BITS;
        }
        Ok(())
    }

    /// Add `delta` to the counters of `addr` and its ancestors. Stops once a
    /// node was already at the threshold before the update and its parent is
    /// too; counts above the threshold may drift.
    pub fn maintain_ancestor_counter(&self, addr: u32, delta: i64) -> Result<()> {
        let mut current = Some(addr);
        while let Some(node) = current {
            let (parent, updated) = {
                let _guard = self.counter_lock(node);
                self.update_branch(node, |b| {
                    b.subtree_size += delta;
                    (b.parent, b.subtree_size)
                })?
            };
            let parent_size = match parent {
                Some(p) => self.branch_meta(p)?.subtree_size,
                None => 0,
            };
            if updated - delta >= MAX_RANGE_QUERY_SIZE && parent_size >= MAX_RANGE_QUERY_SIZE {
                break;
            }
            current = parent;
        }
        Ok(())
    }
}
