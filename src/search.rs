//! Prefix descent from the root.

use crate::error::{Error, Result};
use crate::morton::{check_match, match_height_precise, next_branch, MortonKey};
use crate::node::{NodeKind, NodeRef, NodeView};
use crate::storage::{TrieStorage, ROOT};

impl TrieStorage {
    /// Descend toward `key`.
    ///
    /// Returns the leaf the descent reaches, or the branch whose child slot
    /// for `key` is empty. If a branch's prefix disagrees with `key`, the
    /// descent has run off an edge: the result is that branch's parent when
    /// `return_parent_on_mismatch`, otherwise the branch itself. The result's
    /// info byte holds the last child slot taken, which for a parent result
    /// is the slot leading to the mismatching branch.
    pub fn locate(&self, key: MortonKey, return_parent_on_mismatch: bool) -> Result<NodeRef> {
        let mut current = ROOT;
        let mut slot: i8 = NodeRef::NO_SLOT;
        loop {
            let meta = self.branch_meta(current)?;
            if !check_match(key, meta.key, meta.height) {
                let target = match (return_parent_on_mismatch, meta.parent) {
                    (true, Some(parent)) => parent,
                    _ => current,
                };
                return Ok(self.branch_ref(target).with_info(slot));
            }
            let idx = next_branch(key, meta.height);
            slot = idx as i8;
            let child = self.branch_child(current, idx)?;
            match child.kind() {
                Some(NodeKind::Branch) => current = child.index(),
                Some(NodeKind::Leaf) => return Ok(child.with_info(slot)),
                None => return Ok(self.branch_ref(current).with_info(slot)),
            }
        }
    }

    /// Stored key sharing the longest prefix with `key`, if the descent for
    /// `key` ends in a leaf. Ties go to the first stored key.
    pub fn key_search(&self, key: MortonKey) -> Result<Option<MortonKey>> {
        let node = self.locate(key, true)?;
        if !node.is_leaf() {
            return Ok(None);
        }
        self.with_leaf(node.index(), |leaf| {
            let mut best: Option<(u32, MortonKey)> = None;
            for p in leaf.points() {
                let h = match_height_precise(p.key, key);
                if best.map_or(true, |(bh, _)| h > bh) {
                    best = Some((h, p.key));
                }
            }
            best.map(|(_, k)| k)
        })
    }

    /// Debug view of a node. A null or foreign handle yields `Missing`.
    pub fn node_view(&self, node: NodeRef) -> Result<NodeView> {
        if node.shard() != self.shard_id() {
            return Ok(NodeView::Missing);
        }
        let view = match node.kind() {
            None => NodeView::Missing,
            Some(NodeKind::Branch) => {
                let b = self.load_branch(node.index())?;
                NodeView::Branch {
                    node,
                    parent: self.parent_ref(b.parent),
                    key: b.key,
                    height: b.height,
                    subtree_size: b.subtree_size,
                    children: b.children.to_vec(),
                }
            }
            Some(NodeKind::Leaf) => {
                let l = self.load_leaf(node.index())?;
                NodeView::Leaf {
                    node,
                    parent: self.parent_ref(l.parent),
                    key: l.key,
                    height: l.height,
                    keys: l.points().iter().map(|p| p.key).collect(),
                }
            }
        };
        Ok(view)
    }

    /// Debug view of the node a mismatch-preserving descent for `key` ends at.
    pub fn node_view_by_key(&self, key: MortonKey) -> Result<NodeView> {
        let node = self.locate(key, false)?;
        self.node_view(node)
    }

    /// Resolve a handle that should name a branch in this shard.
    pub(crate) fn expect_branch(&self, node: NodeRef) -> Result<u32> {
        if node.is_branch() && node.shard() == self.shard_id() {
            Ok(node.index())
        } else {
            Err(Error::DanglingNode(node.to_string()))
        }
    }
}
