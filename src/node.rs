//! Node layout and arena-encoded node handles.

use std::fmt;

use crate::config::{BRANCH_FACTOR, LEAF_SIZE};
use crate::geometry::{BoundingBox, Point};
use crate::morton::MortonKey;

// =============================================================================
// Node handle
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Branch,
    Leaf,
}

/// Handle to a node: owning shard, kind, arena index, and an auxiliary byte.
///
/// The auxiliary byte is transient. Search results carry the child slot that
/// ended the descent in it; box fetch work lists use it as a fetch-all flag.
/// A sentinel value stands for "no node".
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRef {
    tag: u8,
    info: i8,
    shard: u16,
    index: u32,
}

impl NodeRef {
    const BRANCH_TAG: u8 = 1;
    const LEAF_TAG: u8 = 2;
    const NULL_TAG: u8 = 255;

    /// No slot annotation.
    pub const NO_SLOT: i8 = -1;

    pub const NULL: NodeRef = NodeRef {
        tag: Self::NULL_TAG,
        info: Self::NO_SLOT,
        shard: u16::MAX,
        index: u32::MAX,
    };

    #[inline]
    pub fn branch(shard: u16, index: u32) -> Self {
        Self {
            tag: Self::BRANCH_TAG,
            info: Self::NO_SLOT,
            shard,
            index,
        }
    }

    #[inline]
    pub fn leaf(shard: u16, index: u32) -> Self {
        Self {
            tag: Self::LEAF_TAG,
            info: Self::NO_SLOT,
            shard,
            index,
        }
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.tag != Self::BRANCH_TAG && self.tag != Self::LEAF_TAG
    }

    #[inline]
    pub fn is_branch(self) -> bool {
        self.tag == Self::BRANCH_TAG
    }

    #[inline]
    pub fn is_leaf(self) -> bool {
        self.tag == Self::LEAF_TAG
    }

    #[inline]
    pub fn kind(self) -> Option<NodeKind> {
        match self.tag {
            Self::BRANCH_TAG => Some(NodeKind::Branch),
            Self::LEAF_TAG => Some(NodeKind::Leaf),
            _ => None,
        }
    }

    #[inline]
    pub fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub fn shard(self) -> u16 {
        self.shard
    }

    #[inline]
    pub fn info(self) -> i8 {
        self.info
    }

    /// Child slot recorded by a search, if any.
    #[inline]
    pub fn slot(self) -> Option<usize> {
        usize::try_from(self.info).ok()
    }

    #[inline]
    pub fn with_info(mut self, info: i8) -> Self {
        self.info = info;
        self
    }

    /// Same node, ignoring the auxiliary byte.
    #[inline]
    pub fn same_node(self, other: NodeRef) -> bool {
        self.tag == other.tag && self.shard == other.shard && self.index == other.index
    }
}

impl Default for NodeRef {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            None => f.write_str("NodeRef(null)"),
            Some(kind) => {
                let c = if kind == NodeKind::Branch { 'B' } else { 'L' };
                write!(f, "NodeRef({}{}@{}", c, self.index, self.shard)?;
                if self.info != Self::NO_SLOT {
                    write!(f, "[{}]", self.info)?;
                }
                f.write_str(")")
            }
        }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// =============================================================================
// Nodes
// =============================================================================

/// Internal node. `key` keeps only its top `height` bits.
#[derive(Debug, Clone, Copy)]
pub struct BranchNode {
    pub height: u32,
    /// Points below this node. Exact while under `MAX_RANGE_QUERY_SIZE`.
    pub subtree_size: i64,
    /// Branch arena index of the parent; `None` for the root.
    pub parent: Option<u32>,
    pub key: MortonKey,
    pub bbox: BoundingBox,
    pub children: [NodeRef; BRANCH_FACTOR],
}

impl BranchNode {
    pub fn new(height: u32, key: MortonKey, parent: Option<u32>, bbox: BoundingBox) -> Self {
        Self {
            height,
            subtree_size: 0,
            parent,
            key,
            bbox,
            children: [NodeRef::NULL; BRANCH_FACTOR],
        }
    }

    pub fn meta(&self) -> BranchMeta {
        BranchMeta {
            height: self.height,
            subtree_size: self.subtree_size,
            parent: self.parent,
            key: self.key,
        }
    }
}

/// The fields a descent needs, staged without the child array.
#[derive(Debug, Clone, Copy)]
pub struct BranchMeta {
    pub height: u32,
    pub subtree_size: i64,
    pub parent: Option<u32>,
    pub key: MortonKey,
}

/// Terminal node holding up to `LEAF_SIZE` points.
#[derive(Debug, Clone, Copy)]
pub struct LeafNode {
    pub height: u32,
    pub len: usize,
    pub parent: Option<u32>,
    pub key: MortonKey,
    pub bbox: BoundingBox,
    pub points: [Point; LEAF_SIZE],
}

impl LeafNode {
    pub fn empty(parent: Option<u32>) -> Self {
        Self {
            height: 64,
            len: 0,
            parent,
            key: 0,
            bbox: BoundingBox::empty(),
            points: [Point::default(); LEAF_SIZE],
        }
    }

    #[inline]
    pub fn points(&self) -> &[Point] {
        &self.points[..self.len]
    }

    pub fn meta(&self) -> LeafMeta {
        LeafMeta {
            height: self.height,
            len: self.len,
            parent: self.parent,
            key: self.key,
            bbox: self.bbox,
        }
    }
}

/// Leaf header without the point payload.
#[derive(Debug, Clone, Copy)]
pub struct LeafMeta {
    pub height: u32,
    pub len: usize,
    pub parent: Option<u32>,
    pub key: MortonKey,
    pub bbox: BoundingBox,
}

/// Debug view of one node as returned by the node fetch opcodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeView {
    Branch {
        node: NodeRef,
        parent: NodeRef,
        key: MortonKey,
        height: u32,
        subtree_size: i64,
        children: Vec<NodeRef>,
    },
    Leaf {
        node: NodeRef,
        parent: NodeRef,
        key: MortonKey,
        height: u32,
        keys: Vec<MortonKey>,
    },
    Missing,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_ref_tags() {
        assert!(NodeRef::NULL.is_null());
        assert_eq!(NodeRef::NULL.kind(), None);
        let b = NodeRef::branch(3, 7);
        assert!(b.is_branch() && !b.is_leaf() && !b.is_null());
        assert_eq!((b.shard(), b.index()), (3, 7));
        let l = NodeRef::leaf(3, 7);
        assert!(l.is_leaf());
        assert_ne!(b, l);
    }

    #[test]
    fn test_info_equality() {
        let a = NodeRef::leaf(0, 1).with_info(4);
        let b = NodeRef::leaf(0, 1).with_info(5);
        assert_ne!(a, b);
        assert!(a.same_node(b));
        assert_eq!(a.slot(), Some(4));
        assert_eq!(NodeRef::leaf(0, 1).slot(), None);
        assert_eq!(format!("{a:?}"), "NodeRef(L1@0[4])");
    }
}
