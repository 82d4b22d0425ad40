//! Morton (Z-order) key codec.
//!
//! A key interleaves coordinate bits from the top significant bit downward,
//! one bit per dimension per round, x first. Bit positions in this module are
//! 1-indexed from the most significant bit of the key, so position 1 is the
//! sign bit of a `u64` and position 64 is the lowest bit.
//!
//! With three 31-bit dimensions, 21 full rounds fill 63 bits and the last key
//! bit holds bit 9 of x. Lower coordinate bits are not represented; points
//! that differ only there share a key.

use crate::config::{BRANCH_BITS, BRANCH_MASK, COORD_BITS, DIM, KEY_START_POS};
use crate::geometry::Coord;

pub type MortonKey = u64;

// =============================================================================
// Bit utilities
// =============================================================================

#[inline]
pub fn lookup_bit(key: u64, pos: u32) -> bool {
    debug_assert!((1..=64).contains(&pos));
    key & (1u64 << (64 - pos)) != 0
}

#[inline]
fn set_bit(key: u64, pos: u32) -> u64 {
    key | (1u64 << (64 - pos))
}

#[inline]
fn reset_bit(key: u64, pos: u32) -> u64 {
    key & !(1u64 << (64 - pos))
}

/// Round a height down to a whole number of branch levels.
#[inline]
pub fn prune_height(height: u32) -> u32 {
    height / BRANCH_BITS * BRANCH_BITS
}

/// Mask of the bits below `height`.
#[inline]
pub fn low_ones(height: u32) -> u64 {
    match height {
        0 => u64::MAX,
        h if h >= 64 => 0,
        h => (1u64 << (64 - h)) - 1,
    }
}

/// Leading bits shared by both keys, 64 if equal.
#[inline]
pub fn match_height_precise(k1: MortonKey, k2: MortonKey) -> u32 {
    (k1 ^ k2).leading_zeros()
}

/// Shared leading bits rounded down to the branch width; usable as a trie height.
#[inline]
pub fn match_height(k1: MortonKey, k2: MortonKey) -> u32 {
    prune_height(match_height_precise(k1, k2))
}

/// True iff the top `height` bits of both keys agree.
#[inline]
pub fn check_match(k1: MortonKey, k2: MortonKey, height: u32) -> bool {
    match height {
        0 => true,
        h if h >= 64 => k1 == k2,
        h => (k1 ^ k2) >> (64 - h) == 0,
    }
}

/// Zero every bit below `height`.
#[inline]
pub fn prune_tail(key: MortonKey, height: u32) -> MortonKey {
    key & !low_ones(height)
}

/// Child slot selected by the branch-width bits right after `height`.
#[inline]
pub fn next_branch(key: MortonKey, height: u32) -> usize {
    if height > 64 - BRANCH_BITS {
        (key & BRANCH_MASK) as usize
    } else {
        ((key >> (64 - BRANCH_BITS - prune_height(height))) & BRANCH_MASK) as usize
    }
}

// =============================================================================
// Interleaving
// =============================================================================

/// Bits below this mask are dropped from dimension `d` when encoding.
#[inline]
fn truncated_mask(d: usize) -> i64 {
    let covered = 64 / DIM as u32 + u32::from(d < 64 % DIM);
    if covered >= COORD_BITS {
        0
    } else {
        (1i64 << (COORD_BITS - covered)) - 1
    }
}

/// Interleave a coordinate into its Morton key.
pub fn coord_to_key(coord: &Coord) -> MortonKey {
    let mut key = 0u64;
    let mut pos = 1u32;
    let mut src = KEY_START_POS;
    while pos <= 64 {
        for &c in coord.iter() {
            if pos > 64 {
                break;
            }
            if lookup_bit(c as u64, src) {
                key = set_bit(key, pos);
            }
            pos += 1;
        }
        src += 1;
    }
    key
}

/// De-interleave a key. Coordinate bits the key does not carry are set to one
/// when `fill_with_one`, which yields the max corner of a prefix's cell.
pub fn key_to_coord(key: MortonKey, fill_with_one: bool) -> Coord {
    let mut coord: Coord = [0; DIM];
    if fill_with_one {
        for (d, c) in coord.iter_mut().enumerate() {
            *c = truncated_mask(d);
        }
    }
    let mut pos = 1u32;
    let mut dst = KEY_START_POS;
    while pos <= 64 {
        for c in coord.iter_mut() {
            if pos > 64 {
                break;
            }
            if lookup_bit(key, pos) {
                *c |= 1i64 << (64 - dst);
            }
            pos += 1;
        }
        dst += 1;
    }
    coord
}

/// Axis-aligned cell covered by every key sharing `key`'s top `height` bits.
pub fn prefix_box(key: MortonKey, height: u32) -> (Coord, Coord) {
    let key = prune_tail(key, height);
    (
        key_to_coord(key, false),
        key_to_coord(key | low_ones(height), true),
    )
}

// =============================================================================
// Range decomposition
// =============================================================================

/// Rewrite the bits of the dimension owning `pos`, from `pos` down.
/// `high` loads `1000..`, otherwise `0111..`.
fn load_bits(mut key: u64, high: bool, pos: u32) -> u64 {
    let mut first = true;
    let mut j = pos;
    while j <= 64 {
        key = if first == high {
            set_bit(key, j)
        } else {
            reset_bit(key, j)
        };
        first = false;
        j += DIM as u32;
    }
    key
}

/// Split the key range of a box at the first bit where its corner keys
/// diverge (Tropf & Herzog). Returns `(litmax, bigmin)`: the largest key in
/// the box below the split and the smallest key in the box above it. Every
/// point inside the box has a key in `[key_min, litmax]` or `[bigmin, key_max]`.
///
/// `key_min` and `key_max` must be the keys of the box's min and max corners.
/// Equal keys yield `(key_min, key_max)`.
pub fn split(key_min: MortonKey, key_max: MortonKey) -> (MortonKey, MortonKey) {
    debug_assert!(key_min <= key_max);
    if key_min == key_max {
        return (key_min, key_max);
    }
    let pos = match_height_precise(key_min, key_max) + 1;
    // Corners share the prefix; at `pos` min carries 0 and max carries 1.
    // Lower half: clamp max's dimension just below the split plane.
    // Upper half: lift min's dimension onto it.
    let litmax = load_bits(key_max, false, pos);
    let bigmin = load_bits(key_min, true, pos);
    (litmax, bigmin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::COORD_MAX;
    use crate::geometry::vector_in_box;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn test_bit_helpers() {
        assert!(lookup_bit(1u64 << 63, 1));
        assert!(lookup_bit(1, 64));
        assert_eq!(prune_height(63), 60);
        assert_eq!(prune_height(4), 4);
        assert_eq!(match_height(5, 5), 64);
        assert_eq!(match_height_precise(0, 1), 63);
        assert_eq!(match_height(0, 1), 60);
        assert!(check_match(0xF0 << 56, 0xF7 << 56, 4));
        assert!(!check_match(0xF0 << 56, 0xF7 << 56, 6));
        assert!(check_match(1, 2, 0));
        assert_eq!(prune_tail(u64::MAX, 8), 0xFF << 56);
        assert_eq!(prune_tail(u64::MAX, 0), 0);
        assert_eq!(prune_tail(u64::MAX, 64), u64::MAX);
    }

    #[test]
    fn test_next_branch() {
        let key = 0x1234_5678_9ABC_DEF0u64;
        assert_eq!(next_branch(key, 0), 0x1);
        assert_eq!(next_branch(key, 4), 0x2);
        assert_eq!(next_branch(key, 7), 0x2);
        assert_eq!(next_branch(key, 56), 0xF);
        assert_eq!(next_branch(key, 60), 0x0);
        assert_eq!(next_branch(key, 64), 0x0);
        assert_eq!(next_branch(0xABCD, 61), 0xD);
    }

    #[test]
    fn test_top_bits_interleave() {
        let top = 1i64 << 30;
        assert_eq!(coord_to_key(&[top, 0, 0]), 1u64 << 63);
        assert_eq!(coord_to_key(&[0, top, 0]), 1u64 << 62);
        assert_eq!(coord_to_key(&[0, 0, top]), 1u64 << 61);
        assert_eq!(coord_to_key(&[0, 0, 0]), 0);
        assert_eq!(coord_to_key(&[COORD_MAX; DIM]), u64::MAX);
        // Last key bit is bit 9 of x.
        assert_eq!(coord_to_key(&[1 << 9, 0, 0]), 1);
        assert_eq!(coord_to_key(&[(1 << 9) - 1, (1 << 10) - 1, (1 << 10) - 1]), 0);
    }

    #[test]
    fn test_roundtrip_truncates_low_bits() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..10_000 {
            let c: Coord = std::array::from_fn(|_| rng.gen_range(0..=COORD_MAX));
            let key = coord_to_key(&c);
            let lo = key_to_coord(key, false);
            let hi = key_to_coord(key, true);
            for d in 0..DIM {
                let mask = truncated_mask(d);
                assert_eq!(lo[d], c[d] & !mask);
                assert_eq!(hi[d], c[d] | mask);
            }
            assert_eq!(coord_to_key(&lo), key);
            assert_eq!(coord_to_key(&hi), key);
        }
    }

    #[test]
    fn test_prefix_box_contains_matching_keys() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..2_000 {
            let c: Coord = std::array::from_fn(|_| rng.gen_range(0..=COORD_MAX));
            let key = coord_to_key(&c);
            let height = prune_height(rng.gen_range(0..=64));
            let (lo, hi) = prefix_box(key, height);
            assert!(vector_in_box(&c, &lo, &hi));
            assert!(check_match(coord_to_key(&lo), key, height));
            assert!(check_match(coord_to_key(&hi), key, height));
        }
        let (lo, hi) = prefix_box(0, 0);
        assert_eq!(lo, [0; DIM]);
        assert_eq!(hi, [COORD_MAX; DIM]);
    }

    #[test]
    fn test_morton_order_is_monotone_per_axis() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..5_000 {
            let a: Coord = std::array::from_fn(|_| rng.gen_range(0..=COORD_MAX));
            let mut b = a;
            let d = rng.gen_range(0..DIM);
            b[d] = rng.gen_range(a[d]..=COORD_MAX);
            assert!(coord_to_key(&a) <= coord_to_key(&b));
        }
    }

    /// Grid whose coordinates only occupy the top bits, so the first 8 key
    /// bits are the whole key: x and y take 3 bits, z takes 2.
    fn small_grid() -> Vec<Coord> {
        let mut grid = Vec::new();
        for x in 0..8i64 {
            for y in 0..8i64 {
                for z in 0..4i64 {
                    grid.push([x << 28, y << 28, z << 29]);
                }
            }
        }
        grid
    }

    #[test]
    fn test_split_exhaustive_8bit() {
        let grid = small_grid();
        for key in grid.iter().map(coord_to_key) {
            assert_eq!(key & low_ones(8), 0);
        }
        let axis = |d: usize| -> Vec<i64> {
            let (steps, shift) = if d == 2 { (4, 29) } else { (8, 28) };
            (0..steps).map(|v| v << shift).collect()
        };
        let (xs, ys, zs) = (axis(0), axis(1), axis(2));
        let mut boxes = 0usize;
        for (i, &x0) in xs.iter().enumerate() {
            for &x1 in &xs[i..] {
                for (j, &y0) in ys.iter().enumerate() {
                    for &y1 in &ys[j..] {
                        for (k, &z0) in zs.iter().enumerate() {
                            for &z1 in &zs[k..] {
                                let lo = [x0, y0, z0];
                                let hi = [x1, y1, z1];
                                let (kmin, kmax) = (coord_to_key(&lo), coord_to_key(&hi));
                                if kmin == kmax {
                                    continue;
                                }
                                boxes += 1;
                                let (litmax, bigmin) = split(kmin, kmax);
                                assert!(kmin <= litmax && litmax < bigmin && bigmin <= kmax);
                                assert!(vector_in_box(&key_to_coord(litmax, false), &lo, &hi));
                                assert!(vector_in_box(&key_to_coord(bigmin, false), &lo, &hi));
                                for p in grid.iter().filter(|p| vector_in_box(p, &lo, &hi)) {
                                    let key = coord_to_key(p);
                                    assert!(
                                        (kmin..=litmax).contains(&key)
                                            || (bigmin..=kmax).contains(&key),
                                        "{lo:?}..{hi:?} lost {p:?}"
                                    );
                                }
                            }
                        }
                    }
                }
            }
        }
        assert!(boxes > 10_000);
    }

    #[test]
    fn test_split_random_full_width() {
        let mut rng = StdRng::seed_from_u64(19);
        for _ in 0..2_000 {
            let a: Coord = std::array::from_fn(|_| rng.gen_range(0..=COORD_MAX));
            let b: Coord = std::array::from_fn(|_| rng.gen_range(0..=COORD_MAX));
            let lo: Coord = std::array::from_fn(|d| a[d].min(b[d]));
            let hi: Coord = std::array::from_fn(|d| a[d].max(b[d]));
            let (kmin, kmax) = (coord_to_key(&lo), coord_to_key(&hi));
            let (litmax, bigmin) = split(kmin, kmax);
            if kmin == kmax {
                continue;
            }
            assert!(kmin <= litmax && litmax < bigmin && bigmin <= kmax);
            for _ in 0..50 {
                let p: Coord = std::array::from_fn(|d| rng.gen_range(lo[d]..=hi[d]));
                let key = coord_to_key(&p);
                assert!(key <= litmax || key >= bigmin);
            }
        }
    }
}
