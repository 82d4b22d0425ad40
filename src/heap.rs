//! Fixed-capacity max-heap of `(distance, item)` used by nearest-neighbor
//! search on both the shard and the coordinator side.

use std::collections::BinaryHeap;

/// Heap entry. Ordered by distance, then by item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Scored<T> {
    pub distance: i64,
    pub item: T,
}

/// Keeps the `capacity` smallest entries seen so far.
#[derive(Debug, Clone)]
pub struct BoundedHeap<T: Ord> {
    heap: BinaryHeap<Scored<T>>,
    capacity: usize,
}

impl<T: Ord> BoundedHeap<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity),
            capacity,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.capacity
    }

    /// Distance of the current worst entry.
    #[inline]
    pub fn max_distance(&self) -> Option<i64> {
        self.heap.peek().map(|e| e.distance)
    }

    /// Offer an entry. On a full heap, a distance at or above the current
    /// max is rejected, so a candidate tied with the max never displaces it.
    /// Otherwise the max is evicted. Returns whether the entry was kept.
    pub fn enqueue(&mut self, distance: i64, item: T) -> bool {
        if self.is_full() {
            match self.heap.peek() {
                Some(top) if distance < top.distance => {}
                _ => return false,
            }
            self.heap.pop();
        }
        self.heap.push(Scored { distance, item });
        true
    }

    /// Remove and return the current max.
    pub fn dequeue(&mut self) -> Option<Scored<T>> {
        self.heap.pop()
    }

    /// Entries in ascending order.
    pub fn into_sorted_vec(self) -> Vec<Scored<T>> {
        self.heap.into_sorted_vec()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Scored<T>> {
        self.heap.iter()
    }
}

impl<T: Ord> Extend<(i64, T)> for BoundedHeap<T> {
    fn extend<I: IntoIterator<Item = (i64, T)>>(&mut self, iter: I) {
        for (distance, item) in iter {
            self.enqueue(distance, item);
        }
    }
}

/// Check a k-nearest answer against every candidate ranked ascending. The
/// distances must match the first `k` exactly. Entries closer than the last
/// distance must match too, and entries at it must be drawn from the tied
/// candidates.
#[cfg(test)]
pub(crate) fn assert_nearest<T: Ord + Clone + std::fmt::Debug>(got: &[Scored<T>], ranked: &[Scored<T>], k: usize) {
    let want = &ranked[..k.min(ranked.len())];
    let distances = |s: &[Scored<T>]| s.iter().map(|e| e.distance).collect::<Vec<_>>();
    assert_eq!(distances(got), distances(want));
    let Some(last) = want.last().map(|e| e.distance) else {
        return;
    };
    let closer = |s: &[Scored<T>]| s.iter().filter(|e| e.distance < last).cloned().collect::<Vec<_>>();
    assert_eq!(closer(got), closer(want));
    let mut tied: Vec<&Scored<T>> = ranked.iter().filter(|e| e.distance == last).collect();
    for e in got.iter().filter(|e| e.distance == last) {
        let Some(at) = tied.iter().position(|t| *t == e) else {
            panic!("{e:?} is not a candidate at distance {last}");
        };
        tied.swap_remove(at);
    }
}
