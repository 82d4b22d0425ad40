//! Two-tier traversal stack.
//!
//! Entries live in a small inline buffer. When it fills, the older half is
//! spilled to a heap-backed tier in one move; when it drains, up to half a
//! buffer is refilled from the spill tier at once.

use smallvec::SmallVec;

use crate::config::WORKLIST_FAST_CAPACITY;

const REFILL: usize = WORKLIST_FAST_CAPACITY / 2;

pub struct StagedStack<T> {
    fast: SmallVec<[T; WORKLIST_FAST_CAPACITY]>,
    spill: Vec<T>,
    spills: usize,
}

impl<T: Copy> StagedStack<T> {
    pub fn new() -> Self {
        Self {
            fast: SmallVec::new(),
            spill: Vec::new(),
            spills: 0,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.fast.len() == WORKLIST_FAST_CAPACITY {
            self.spill.extend(self.fast.drain(..REFILL));
            self.spills += 1;
        }
        self.fast.push(item);
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.fast.is_empty() && !self.spill.is_empty() {
            let from = self.spill.len().saturating_sub(REFILL);
            self.fast.extend(self.spill.drain(from..));
        }
        self.fast.pop()
    }

    pub fn len(&self) -> usize {
        self.fast.len() + self.spill.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fast.is_empty() && self.spill.is_empty()
    }

    /// Number of times the fast tier overflowed.
    pub fn spill_count(&self) -> usize {
        self.spills
    }
}

impl<T: Copy> Default for StagedStack<T> {
    fn default() -> Self {
        Self::new()
    }
}
