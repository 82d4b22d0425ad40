//! Points, boxes, and the distance predicates used for pruning.

use crate::config::{COORD_MAX, DIM};
use crate::morton::{coord_to_key, MortonKey};

/// A position in `[0, COORD_MAX]^DIM`.
pub type Coord = [i64; DIM];

/// Per-axis differences of 2^31 or more make the squared norm saturate.
const L2_NORM_MAX: i64 = 1 << 31;

/// A coordinate together with its Morton key.
///
/// Ordering is by coordinate, then key, which makes it a deterministic
/// tie-breaker among equidistant neighbors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Point {
    pub coord: Coord,
    pub key: MortonKey,
}

impl Point {
    pub fn new(coord: Coord) -> Self {
        Self {
            coord,
            key: coord_to_key(&coord),
        }
    }
}

impl From<Coord> for Point {
    fn from(coord: Coord) -> Self {
        Self::new(coord)
    }
}

/// Distance used by nearest-neighbor search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Metric {
    /// L-infinity.
    Chebyshev,
    /// L1, saturating at `i64::MAX`.
    #[default]
    Manhattan,
    /// Squared L2, saturating at `i64::MAX`.
    SquaredEuclidean,
}

impl Metric {
    /// Norm of a vector of non-negative per-axis differences.
    pub fn norm(self, v: &Coord) -> i64 {
        match self {
            Metric::Chebyshev => v.iter().copied().max().unwrap_or(0),
            Metric::Manhattan => v.iter().fold(0i64, |acc, &x| acc.saturating_add(x)),
            Metric::SquaredEuclidean => {
                if v.iter().any(|&x| x >= L2_NORM_MAX) {
                    return i64::MAX;
                }
                v.iter().fold(0i64, |acc, &x| acc.saturating_add(x * x))
            }
        }
    }

    pub fn distance(self, a: &Coord, b: &Coord) -> i64 {
        self.norm(&vector_sub(a, b))
    }

    /// Distance along a single axis, in the metric's units.
    fn axis_distance(self, d: i64) -> i64 {
        match self {
            Metric::SquaredEuclidean if d >= L2_NORM_MAX => i64::MAX,
            Metric::SquaredEuclidean => d * d,
            _ => d,
        }
    }

    /// Translate a radius in metric units into a per-axis extent.
    pub fn axis_extent(self, radius: i64) -> i64 {
        match self {
            Metric::SquaredEuclidean => isqrt_ceil(radius),
            _ => radius,
        }
    }

    /// Candidates a shard keeps for a `k` query before exact pruning.
    pub fn shard_heap_capacity(self, k: usize) -> usize {
        match self {
            Metric::SquaredEuclidean => k + k / 2,
            _ => k,
        }
    }
}

/// Smallest `r` with `r * r >= x`; non-positive inputs give 0.
pub fn isqrt_ceil(x: i64) -> i64 {
    if x <= 0 {
        return 0;
    }
    let mut r = (x as f64).sqrt() as i64;
    while r > 0 && r.saturating_mul(r) >= x {
        r -= 1;
    }
    while r.saturating_mul(r) < x {
        r += 1;
    }
    r
}

// =============================================================================
// Vector helpers
// =============================================================================

/// Per-axis absolute difference.
#[inline]
pub fn vector_sub(a: &Coord, b: &Coord) -> Coord {
    std::array::from_fn(|d| (a[d] - b[d]).abs())
}

/// Per-axis sum clamped to `COORD_MAX`.
#[inline]
pub fn vector_add(a: &Coord, b: &Coord) -> Coord {
    std::array::from_fn(|d| {
        if a[d] < COORD_MAX - b[d] {
            a[d] + b[d]
        } else {
            COORD_MAX
        }
    })
}

/// Per-axis difference floored at zero.
#[inline]
pub fn vector_sub_zero_bounded(a: &Coord, b: &Coord) -> Coord {
    std::array::from_fn(|d| if a[d] > b[d] { a[d] - b[d] } else { 0 })
}

#[inline]
pub fn vector_ones(c: i64) -> Coord {
    [c; DIM]
}

#[inline]
pub fn vector_in_box(v: &Coord, min: &Coord, max: &Coord) -> bool {
    (0..DIM).all(|d| v[d] >= min[d] && v[d] <= max[d])
}

/// True if two closed boxes share at least one point.
#[inline]
pub fn box_intersect(min1: &Coord, max1: &Coord, min2: &Coord, max2: &Coord) -> bool {
    (0..DIM).all(|d| min1[d] <= max2[d] && min2[d] <= max1[d])
}

/// True if box 1 lies entirely inside box 2.
#[inline]
pub fn box_contain(min1: &Coord, max1: &Coord, min2: &Coord, max2: &Coord) -> bool {
    (0..DIM).all(|d| min2[d] <= min1[d] && max1[d] <= max2[d])
}

/// True if the ball around `v` reaches the box.
pub fn radius_intersect_box(metric: Metric, v: &Coord, radius: i64, min: &Coord, max: &Coord) -> bool {
    let gap: Coord = std::array::from_fn(|d| {
        if v[d] >= min[d] && v[d] <= max[d] {
            0
        } else {
            (v[d] - min[d]).abs().min((v[d] - max[d]).abs())
        }
    });
    metric.norm(&gap) <= radius
}

/// True if the ball around `v` lies entirely inside the box.
pub fn radius_contained_in_box(metric: Metric, v: &Coord, radius: i64, min: &Coord, max: &Coord) -> bool {
    if !vector_in_box(v, min, max) {
        return false;
    }
    let nearest_face = (0..DIM)
        .map(|d| (v[d] - min[d]).min(max[d] - v[d]))
        .min()
        .unwrap_or(0);
    metric.axis_distance(nearest_face) >= radius
}

// =============================================================================
// Boxes
// =============================================================================

/// Closed axis-aligned box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoundingBox {
    pub min: Coord,
    pub max: Coord,
}

impl BoundingBox {
    /// Build a box from two corners in any order.
    pub fn new(a: Coord, b: Coord) -> Self {
        let mut min = a;
        let mut max = b;
        for d in 0..DIM {
            if min[d] > max[d] {
                std::mem::swap(&mut min[d], &mut max[d]);
            }
        }
        Self { min, max }
    }

    pub fn domain() -> Self {
        Self {
            min: vector_ones(0),
            max: vector_ones(COORD_MAX),
        }
    }

    /// Box reaching `extent` from `center` on every axis, clipped to the domain.
    pub fn around(center: &Coord, extent: i64) -> Self {
        let e = vector_ones(extent);
        Self {
            min: vector_sub_zero_bounded(center, &e),
            max: vector_add(center, &e),
        }
    }

    /// Box holding no coordinates; extending it with a point yields that point.
    pub fn empty() -> Self {
        Self {
            min: vector_ones(i64::MAX),
            max: vector_ones(i64::MIN),
        }
    }

    pub fn extend(&mut self, v: &Coord) {
        for d in 0..DIM {
            self.min[d] = self.min[d].min(v[d]);
            self.max[d] = self.max[d].max(v[d]);
        }
    }

    #[inline]
    pub fn contains_point(&self, v: &Coord) -> bool {
        vector_in_box(v, &self.min, &self.max)
    }

    #[inline]
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        box_intersect(&self.min, &self.max, &other.min, &other.max)
    }

    /// The part of the box inside the domain, or `None` if they do not meet.
    pub fn clip_to_domain(&self) -> Option<BoundingBox> {
        if !self.intersects(&BoundingBox::domain()) {
            return None;
        }
        Some(Self {
            min: std::array::from_fn(|d| self.min[d].max(0)),
            max: std::array::from_fn(|d| self.max[d].min(COORD_MAX)),
        })
    }

    /// True if `self` lies entirely inside `outer`.
    #[inline]
    pub fn is_within(&self, outer: &BoundingBox) -> bool {
        box_contain(&self.min, &self.max, &outer.min, &outer.max)
    }

    /// Keys of the min and max corners.
    pub fn key_range(&self) -> (MortonKey, MortonKey) {
        (coord_to_key(&self.min), coord_to_key(&self.max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_norms() {
        let v = [3, 4, 12];
        assert_eq!(Metric::Chebyshev.norm(&v), 12);
        assert_eq!(Metric::Manhattan.norm(&v), 19);
        assert_eq!(Metric::SquaredEuclidean.norm(&v), 169);
        assert_eq!(Metric::SquaredEuclidean.norm(&[L2_NORM_MAX, 0, 0]), i64::MAX);
        assert_eq!(Metric::Manhattan.norm(&[i64::MAX, 1, 0]), i64::MAX);
        let big = L2_NORM_MAX - 1;
        assert_eq!(Metric::SquaredEuclidean.norm(&[big, big, big]), i64::MAX);
    }

    #[test]
    fn test_saturating_vectors() {
        assert_eq!(vector_add(&[COORD_MAX - 1, 5, 0], &[10, 5, 0]), [COORD_MAX, 10, 0]);
        assert_eq!(vector_sub_zero_bounded(&[3, 10, 0], &[5, 5, 5]), [0, 5, 0]);
        assert_eq!(vector_sub(&[3, 10, 0], &[5, 5, 5]), [2, 5, 5]);
    }

    #[test]
    fn test_box_predicates() {
        let b = BoundingBox::new([10, 10, 10], [0, 0, 0]);
        assert_eq!(b.min, [0, 0, 0]);
        assert_eq!(b.max, [10, 10, 10]);
        assert!(b.contains_point(&[10, 0, 5]));
        assert!(!b.contains_point(&[11, 0, 5]));
        let inner = BoundingBox::new([2, 2, 2], [3, 3, 3]);
        assert!(inner.is_within(&b));
        assert!(!b.is_within(&inner));
        let touching = BoundingBox::new([10, 10, 10], [20, 20, 20]);
        assert!(b.intersects(&touching));
        let apart = BoundingBox::new([11, 0, 0], [20, 20, 20]);
        assert!(!b.intersects(&apart));
    }

    #[test]
    fn test_ball_predicates() {
        let (min, max) = ([0, 0, 0], [10, 10, 10]);
        let m = Metric::Manhattan;
        assert!(radius_intersect_box(m, &[12, 5, 5], 2, &min, &max));
        assert!(!radius_intersect_box(m, &[12, 12, 5], 3, &min, &max));
        assert!(radius_intersect_box(m, &[12, 12, 5], 4, &min, &max));
        assert!(radius_contained_in_box(m, &[5, 5, 5], 5, &min, &max));
        assert!(!radius_contained_in_box(m, &[5, 5, 5], 6, &min, &max));
        assert!(!radius_contained_in_box(m, &[11, 5, 5], 0, &min, &max));
        let l2 = Metric::SquaredEuclidean;
        assert!(radius_contained_in_box(l2, &[5, 5, 5], 25, &min, &max));
        assert!(!radius_contained_in_box(l2, &[5, 5, 5], 26, &min, &max));
    }

    #[test]
    fn test_isqrt_ceil() {
        assert_eq!(isqrt_ceil(0), 0);
        assert_eq!(isqrt_ceil(1), 1);
        assert_eq!(isqrt_ceil(2), 2);
        assert_eq!(isqrt_ceil(16), 4);
        assert_eq!(isqrt_ceil(17), 5);
        assert_eq!(isqrt_ceil(i64::MAX), 3_037_000_500);
    }

    #[test]
    fn test_around_clips_to_domain() {
        let b = BoundingBox::around(&[1, COORD_MAX - 1, 50], 5);
        assert_eq!(b.min, [0, COORD_MAX - 6, 45]);
        assert_eq!(b.max, [6, COORD_MAX, 55]);
    }

    #[test]
    fn test_clip_to_domain() {
        let b = BoundingBox::new([-5, -5, -5], [2, COORD_MAX + 9, 2]);
        let clipped = b.clip_to_domain().unwrap();
        assert_eq!(clipped.min, [0, 0, 0]);
        assert_eq!(clipped.max, [2, COORD_MAX, 2]);
        assert_eq!(BoundingBox::domain().clip_to_domain(), Some(BoundingBox::domain()));
        assert_eq!(BoundingBox::new([-9, 0, 0], [-1, 5, 5]).clip_to_domain(), None);
        assert_eq!(BoundingBox::new([0, COORD_MAX + 1, 0], [5, COORD_MAX + 4, 5]).clip_to_domain(), None);
    }
}
