//! Box range count and fetch over one shard's trie.

use crate::config::MAX_RANGE_QUERY_SIZE;
use crate::error::Result;
use crate::geometry::{BoundingBox, Point};
use crate::node::{NodeKind, NodeRef};
use crate::storage::TrieStorage;
use crate::worklist::StagedStack;

/// Work-list marker: the node lies entirely inside the query box.
const FETCH_ALL: i8 = 1;

/// Points a box fetch produced on one shard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchResult {
    /// Every matching point, including those beyond the output capacity.
    pub count: usize,
    pub points: Vec<Point>,
}

impl FetchResult {
    #[inline]
    pub fn truncated(&self) -> bool {
        self.count > self.points.len()
    }
}

impl TrieStorage {
    /// Number of stored points inside `query`.
    ///
    /// Branches fully inside the box contribute their subtree size without
    /// descent, but only while that size is below the exactness threshold.
    pub fn box_count(&self, query: &BoundingBox) -> Result<u64> {
        let mut stack = StagedStack::new();
        stack.push(self.root());
        let mut total = 0u64;
        while let Some(node) = stack.pop() {
            match node.kind() {
                Some(NodeKind::Leaf) => {
                    total += self.with_leaf(node.index(), |leaf| {
                        if !leaf.bbox.intersects(query) {
                            0
                        } else if leaf.bbox.is_within(query) {
                            leaf.len as u64
                        } else {
                            leaf.points()
                                .iter()
                                .filter(|p| query.contains_point(&p.coord))
                                .count() as u64
                        }
                    })?;
                }
                Some(NodeKind::Branch) => {
                    let branch = self.load_branch(node.index())?;
                    if !branch.bbox.intersects(query) {
                        continue;
                    }
                    if branch.subtree_size < MAX_RANGE_QUERY_SIZE && branch.bbox.is_within(query) {
                        total += branch.subtree_size as u64;
                        continue;
                    }
                    for child in branch.children.iter().filter(|c| !c.is_null()) {
                        stack.push(*child);
                    }
                }
                None => {}
            }
        }
        Ok(total)
    }

    /// Points inside `query`, at most `capacity` of them copied out.
    pub fn box_fetch(&self, query: &BoundingBox, capacity: usize) -> Result<FetchResult> {
        let mut out = FetchResult::default();
        let emit = |p: &Point, out: &mut FetchResult| {
            if out.points.len() < capacity {
                out.points.push(*p);
            }
            out.count += 1;
        };

        let mut stack = StagedStack::new();
        stack.push(self.root());
        while let Some(node) = stack.pop() {
            let fetch_all = node.info() == FETCH_ALL;
            match node.kind() {
                Some(NodeKind::Leaf) => {
                    self.with_leaf(node.index(), |leaf| {
                        let take_all = fetch_all || leaf.bbox.is_within(query);
                        if !take_all && !leaf.bbox.intersects(query) {
                            return;
                        }
                        for p in leaf.points() {
                            if take_all || query.contains_point(&p.coord) {
                                emit(p, &mut out);
                            }
                        }
                    })?;
                }
                Some(NodeKind::Branch) => {
                    let (bbox, children) = {
                        let b = self.load_branch(node.index())?;
                        (b.bbox, b.children)
                    };
                    let mut flag = NodeRef::NO_SLOT;
                    if fetch_all {
                        flag = FETCH_ALL;
                    } else if !bbox.intersects(query) {
                        continue;
                    } else if bbox.is_within(query) {
                        flag = FETCH_ALL;
                    }
                    for child in children.iter().filter(|c| !c.is_null()) {
                        stack.push(child.with_info(flag));
                    }
                }
                None => {}
            }
        }
        Ok(out)
    }
}
