//! Nearest-neighbor search inside one shard.
//!
//! The search starts at the node owning the query center and widens one
//! ancestor at a time ("inchworm"), scanning only the siblings the previous
//! step had not covered. Once the heap holds its capacity, the search radius
//! shrinks to the current worst candidate. The climb stops when that radius,
//! taken as a ball, fits inside the subtree just finished, or at the root.

use std::collections::VecDeque;

use crate::error::Result;
use crate::geometry::{radius_contained_in_box, radius_intersect_box, BoundingBox, Coord, Metric, Point};
use crate::heap::BoundedHeap;
use crate::morton::{coord_to_key, next_branch};
use crate::node::{NodeKind, NodeRef};
use crate::router::KeyRange;
use crate::storage::TrieStorage;

/// True if every point within `radius` of `center` has a key in `range`,
/// so no other shard can hold a closer candidate.
pub fn ball_within_range(center: &Coord, radius: i64, metric: Metric, range: &KeyRange) -> bool {
    let (key_min, key_max) = BoundingBox::around(center, metric.axis_extent(radius)).key_range();
    range.contains(key_min) && range.contains(key_max)
}

impl TrieStorage {
    /// Fill `heap` with the nearest points to `center` within `radius`.
    /// Returns the final search radius.
    pub fn knn(
        &self,
        center: &Coord,
        mut radius: i64,
        heap: &mut BoundedHeap<Point>,
        metric: Metric,
    ) -> Result<i64> {
        let mut parent = self.locate(coord_to_key(center), true)?;
        let mut skip: Option<usize> = None;
        let mut queue: VecDeque<NodeRef> = VecDeque::new();

        loop {
            match parent.kind() {
                Some(NodeKind::Branch) => {
                    let children = self.branch_children(parent.index())?;
                    for (slot, child) in children.iter().enumerate() {
                        if Some(slot) != skip && !child.is_null() {
                            queue.push_back(*child);
                        }
                    }
                }
                Some(NodeKind::Leaf) => queue.push_back(parent),
                None => break,
            }

            while let Some(node) = queue.pop_front() {
                match node.kind() {
                    Some(NodeKind::Leaf) => {
                        self.with_leaf(node.index(), |leaf| {
                            for p in leaf.points() {
                                let d = metric.distance(&p.coord, center);
                                if d <= radius {
                                    heap.enqueue(d, *p);
                                    if heap.is_full() {
                                        radius = heap.max_distance().unwrap_or(radius);
                                    }
                                }
                            }
                        })?;
                    }
                    Some(NodeKind::Branch) => {
                        let branch = self.load_branch(node.index())?;
                        let b = &branch.bbox;
                        if radius_intersect_box(metric, center, radius, &b.min, &b.max) {
                            queue.extend(branch.children.iter().filter(|c| !c.is_null()));
                        }
                    }
                    None => {}
                }
            }

            let (key, bbox, up): (u64, BoundingBox, Option<u32>) = match parent.kind() {
                Some(NodeKind::Branch) => {
                    let b = self.load_branch(parent.index())?;
                    (b.key, b.bbox, b.parent)
                }
                Some(NodeKind::Leaf) => {
                    let l = self.leaf_meta(parent.index())?;
                    (l.key, l.bbox, l.parent)
                }
                None => break,
            };
            let Some(up) = up else { break };
            if radius_contained_in_box(metric, center, radius, &bbox.min, &bbox.max) {
                break;
            }
            skip = Some(next_branch(key, self.branch_meta(up)?.height));
            parent = self.branch_ref(up);
        }
        Ok(radius)
    }
}
