//! Arena-backed node storage for one shard.
//!
//! Nodes live in two fixed-capacity arenas, one per kind, that only grow.
//! Nothing is freed individually; [`TrieStorage::reset`] rewinds both.
//!
//! Access follows a staging discipline: callers copy a node (or just its
//! header, or just its children) into a local value, compute on the copy, and
//! write back through [`TrieStorage::update_branch`] / [`TrieStorage::update_leaf`],
//! which apply a closure under the node's own lock. No reference into the
//! arenas escapes a call.

use log::{info, warn};
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::config::{BRANCH_FACTOR, COUNTER_LOCK_POOL};
use crate::error::{Error, Result};
use crate::geometry::BoundingBox;
use crate::node::{BranchMeta, BranchNode, LeafMeta, LeafNode, NodeKind, NodeRef};

/// Arena index of the root branch.
pub const ROOT: u32 = 0;

// =============================================================================
// Arena
// =============================================================================

/// Append-only pool of one node kind. The outer lock doubles as the
/// allocation lock; per-node locks guard field updates.
struct Arena<N> {
    slots: RwLock<Vec<RwLock<N>>>,
    capacity: usize,
    kind: NodeKind,
}

impl<N: Clone> Arena<N> {
    fn new(kind: NodeKind, capacity: usize) -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            capacity,
            kind,
        }
    }

    fn alloc(&self, node: N) -> Result<u32> {
        let mut slots = self.slots.write();
        if slots.len() >= self.capacity {
            warn!("{:?} arena full at {} nodes", self.kind, self.capacity);
            return Err(Error::ArenaExhausted {
                kind: self.kind,
                capacity: self.capacity,
            });
        }
        slots.push(RwLock::new(node));
        Ok((slots.len() - 1) as u32)
    }

    #[inline]
    fn read<R>(&self, index: u32, f: impl FnOnce(&N) -> R) -> Result<R> {
        let slots = self.slots.read();
        let slot = slots
            .get(index as usize)
            .ok_or_else(|| self.dangling(index, slots.len()))?;
        let node = slot.read();
        Ok(f(&node))
    }

    #[inline]
    fn write<R>(&self, index: u32, f: impl FnOnce(&mut N) -> R) -> Result<R> {
        let slots = self.slots.read();
        let slot = slots
            .get(index as usize)
            .ok_or_else(|| self.dangling(index, slots.len()))?;
        let mut node = slot.write();
        Ok(f(&mut node))
    }

    fn len(&self) -> usize {
        self.slots.read().len()
    }

    fn clear(&self) {
        self.slots.write().clear();
    }

    fn dangling(&self, index: u32, len: usize) -> Error {
        Error::DanglingNode(format!("{:?} #{} of {}", self.kind, index, len))
    }
}

// =============================================================================
// Storage
// =============================================================================

/// Arena occupancy of one shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub branches: usize,
    pub leaves: usize,
}

impl std::ops::AddAssign for StorageStats {
    fn add_assign(&mut self, rhs: Self) {
        self.branches += rhs.branches;
        self.leaves += rhs.leaves;
    }
}

/// Node arenas of one shard plus the mutex pool guarding subtree counters.
pub struct TrieStorage {
    shard: u16,
    branches: Arena<BranchNode>,
    leaves: Arena<LeafNode>,
    counter_locks: [Mutex<()>; COUNTER_LOCK_POOL],
}

impl TrieStorage {
    pub fn new(shard: u16, branch_capacity: usize, leaf_capacity: usize) -> Result<Self> {
        let storage = Self {
            shard,
            branches: Arena::new(NodeKind::Branch, branch_capacity),
            leaves: Arena::new(NodeKind::Leaf, leaf_capacity),
            counter_locks: std::array::from_fn(|_| Mutex::new(())),
        };
        storage.install_root()?;
        Ok(storage)
    }

    fn install_root(&self) -> Result<()> {
        let root = self
            .branches
            .alloc(BranchNode::new(0, 0, None, BoundingBox::domain()))?;
        debug_assert_eq!(root, ROOT);
        Ok(())
    }

    /// Rewind both arenas and recreate an empty root.
    pub fn reset(&self) -> Result<()> {
        self.branches.clear();
        self.leaves.clear();
        info!("shard {} storage reset", self.shard);
        self.install_root()
    }

    #[inline]
    pub fn shard_id(&self) -> u16 {
        self.shard
    }

    pub(crate) fn set_shard_id(&mut self, shard: u16) {
        self.shard = shard;
    }

    #[inline]
    pub fn root(&self) -> NodeRef {
        NodeRef::branch(self.shard, ROOT)
    }

    #[inline]
    pub fn branch_ref(&self, index: u32) -> NodeRef {
        NodeRef::branch(self.shard, index)
    }

    #[inline]
    pub fn leaf_ref(&self, index: u32) -> NodeRef {
        NodeRef::leaf(self.shard, index)
    }

    /// Handle for an optional parent index; the root's parent is `NULL`.
    #[inline]
    pub fn parent_ref(&self, parent: Option<u32>) -> NodeRef {
        parent.map_or(NodeRef::NULL, |p| self.branch_ref(p))
    }

    pub fn stats(&self) -> StorageStats {
        StorageStats {
            branches: self.branches.len(),
            leaves: self.leaves.len(),
        }
    }

    pub fn capacities(&self) -> (usize, usize) {
        (self.branches.capacity, self.leaves.capacity)
    }

    // -------------------------------------------------------------------------
    // Allocation
    // -------------------------------------------------------------------------

    pub fn alloc_branch(&self, node: BranchNode) -> Result<u32> {
        self.branches.alloc(node)
    }

    pub fn alloc_leaf(&self, node: LeafNode) -> Result<u32> {
        self.leaves.alloc(node)
    }

    // -------------------------------------------------------------------------
    // Staged reads
    // -------------------------------------------------------------------------

    pub fn branch_meta(&self, index: u32) -> Result<BranchMeta> {
        self.branches.read(index, BranchNode::meta)
    }

    pub fn branch_box(&self, index: u32) -> Result<BoundingBox> {
        self.branches.read(index, |b| b.bbox)
    }

    /// All child handles of a branch in one transfer.
    pub fn branch_children(&self, index: u32) -> Result<[NodeRef; BRANCH_FACTOR]> {
        self.branches.read(index, |b| b.children)
    }

    pub fn branch_child(&self, index: u32, slot: usize) -> Result<NodeRef> {
        self.branches.read(index, |b| b.children[slot])
    }

    pub fn load_branch(&self, index: u32) -> Result<BranchNode> {
        self.branches.read(index, |b| *b)
    }

    pub fn leaf_meta(&self, index: u32) -> Result<LeafMeta> {
        self.leaves.read(index, LeafNode::meta)
    }

    pub fn load_leaf(&self, index: u32) -> Result<LeafNode> {
        self.leaves.read(index, |l| *l)
    }

    /// Run `f` on a leaf without copying it out.
    pub fn with_leaf<R>(&self, index: u32, f: impl FnOnce(&LeafNode) -> R) -> Result<R> {
        self.leaves.read(index, f)
    }

    // -------------------------------------------------------------------------
    // Write-back
    // -------------------------------------------------------------------------

    pub fn update_branch<R>(&self, index: u32, f: impl FnOnce(&mut BranchNode) -> R) -> Result<R> {
        self.branches.write(index, f)
    }

    pub fn update_leaf<R>(&self, index: u32, f: impl FnOnce(&mut LeafNode) -> R) -> Result<R> {
        self.leaves.write(index, f)
    }

    pub fn store_branch(&self, index: u32, node: &BranchNode) -> Result<()> {
        self.branches.write(index, |b| *b = *node)
    }

    pub fn store_leaf(&self, index: u32, node: &LeafNode) -> Result<()> {
        self.leaves.write(index, |l| *l = *node)
    }

    pub fn set_child(&self, branch: u32, slot: usize, child: NodeRef) -> Result<()> {
        self.branches.write(branch, |b| b.children[slot] = child)
    }

    /// Point a node's parent back-reference at `parent`.
    pub fn set_parent(&self, node: NodeRef, parent: u32) -> Result<()> {
        match node.kind() {
            Some(NodeKind::Branch) => self.branches.write(node.index(), |b| b.parent = Some(parent)),
            Some(NodeKind::Leaf) => self.leaves.write(node.index(), |l| l.parent = Some(parent)),
            None => Err(Error::DanglingNode(node.to_string())),
        }
    }

    /// Parent branch index of any node.
    pub fn parent_of(&self, node: NodeRef) -> Result<Option<u32>> {
        match node.kind() {
            Some(NodeKind::Branch) => self.branches.read(node.index(), |b| b.parent),
            Some(NodeKind::Leaf) => self.leaves.read(node.index(), |l| l.parent),
            None => Err(Error::DanglingNode(node.to_string())),
        }
    }

    // -------------------------------------------------------------------------
    // Counter locks
    // -------------------------------------------------------------------------

    /// Pool mutex for a branch's subtree counter. Distinct branches may share one.
    #[inline]
    pub fn counter_lock(&self, branch: u32) -> MutexGuard<'_, ()> {
        let slot = (branch.wrapping_mul(0x9E37_79B1) >> 28) as usize % COUNTER_LOCK_POOL;
        self.counter_locks[slot].lock()
    }
}
