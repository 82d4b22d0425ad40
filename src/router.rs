//! Key-space partitioning across shards.
//!
//! A [`PartitionTable`] splits the 64-bit Morton key space into contiguous
//! ranges, one per shard. Point lookups map a key to its owner; box lookups
//! decompose the box's key range with LITMAX/BIGMIN so only shards whose
//! ranges can hold a point of the box are addressed.

use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::geometry::{BoundingBox, Coord, Metric};
use crate::morton::{split, MortonKey};

/// Below this many candidate borders, binary search hands over to a scan.
const LINEAR_SCAN_SPAN: usize = 16;

/// Shard ids addressed by one box or ball.
pub type ShardSpan = SmallVec<[u16; 8]>;

/// How [`PartitionTable::key_to_shard`] finds the owning shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouteStrategy {
    /// Divide the key by the per-shard range size. Needs uniform borders.
    #[default]
    Divide,
    /// Binary search over the borders, finishing with a linear scan.
    BinarySearch,
    /// Start at the uniform estimate and walk until the borders bracket the key.
    Interpolation,
}

/// Inclusive key range owned by one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyRange {
    pub start: MortonKey,
    pub end: MortonKey,
}

impl KeyRange {
    pub const FULL: KeyRange = KeyRange {
        start: 0,
        end: u64::MAX,
    };

    #[inline]
    pub fn contains(&self, key: MortonKey) -> bool {
        self.start <= key && key <= self.end
    }
}

impl Default for KeyRange {
    fn default() -> Self {
        Self::FULL
    }
}

/// Sorted shard borders. Shard `i` owns `[borders[i], borders[i + 1])`, and
/// the last shard also owns `u64::MAX`.
#[derive(Debug, Clone)]
pub struct PartitionTable {
    borders: Vec<u64>,
    range_size: u128,
    strategy: RouteStrategy,
}

impl PartitionTable {
    /// Even split of the key space over `shards` shards.
    pub fn uniform(shards: usize, strategy: RouteStrategy) -> Result<Self> {
        if shards == 0 || shards > u16::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "shard count must be in 1..={}, got {shards}",
                u16::MAX
            )));
        }
        let range_size = Self::uniform_range_size(shards);
        let mut borders: Vec<u64> = (0..shards).map(|i| (i as u128 * range_size) as u64).collect();
        borders.push(u64::MAX);
        Ok(Self {
            borders,
            range_size,
            strategy,
        })
    }

    /// Table over explicit borders: `shards + 1` strictly increasing keys
    /// starting at 0 and ending at `u64::MAX`.
    pub fn with_borders(borders: Vec<u64>, strategy: RouteStrategy) -> Result<Self> {
        if borders.len() < 2 || borders.len() - 1 > u16::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "partition table needs 2..={} borders, got {}",
                u16::MAX as usize + 1,
                borders.len()
            )));
        }
        if borders[0] != 0 || borders[borders.len() - 1] != u64::MAX {
            return Err(Error::InvalidConfig(
                "partition borders must start at 0 and end at u64::MAX".into(),
            ));
        }
        if borders.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::InvalidConfig("partition borders must be strictly increasing".into()));
        }
        let shards = borders.len() - 1;
        let range_size = Self::uniform_range_size(shards);
        let table = Self {
            borders,
            range_size,
            strategy,
        };
        if strategy == RouteStrategy::Divide && !table.is_uniform() {
            return Err(Error::InvalidConfig(
                "divide routing requires uniform partition borders".into(),
            ));
        }
        Ok(table)
    }

    fn uniform_range_size(shards: usize) -> u128 {
        let span = 1u128 << 64;
        let n = shards as u128;
        (span + n - 1) / n
    }

    fn is_uniform(&self) -> bool {
        (0..self.shard_count()).all(|i| self.borders[i] as u128 == i as u128 * self.range_size)
    }

    #[inline]
    pub fn shard_count(&self) -> usize {
        self.borders.len() - 1
    }

    pub fn strategy(&self) -> RouteStrategy {
        self.strategy
    }

    pub fn borders(&self) -> &[u64] {
        &self.borders
    }

    /// Inclusive key range of `shard`.
    pub fn shard_range(&self, shard: u16) -> KeyRange {
        let i = shard as usize;
        let end = if i + 1 == self.shard_count() {
            u64::MAX
        } else {
            self.borders[i + 1] - 1
        };
        KeyRange {
            start: self.borders[i],
            end,
        }
    }

    #[inline]
    fn owns(&self, shard: usize, key: MortonKey) -> bool {
        let last = shard + 1 == self.shard_count();
        self.borders[shard] <= key && (last || key < self.borders[shard + 1])
    }

    /// The unique shard owning `key`.
    pub fn key_to_shard(&self, key: MortonKey) -> Result<u16> {
        let shard = match self.strategy {
            RouteStrategy::Divide => self.divide(key),
            RouteStrategy::BinarySearch => self.binary_search(key),
            RouteStrategy::Interpolation => self.interpolate(key),
        };
        match shard {
            Some(s) if self.owns(s, key) => Ok(s as u16),
            _ => Err(Error::RoutingMiss { key }),
        }
    }

    fn divide(&self, key: MortonKey) -> Option<usize> {
        let s = (key as u128 / self.range_size) as usize;
        (s < self.shard_count()).then_some(s)
    }

    fn binary_search(&self, key: MortonKey) -> Option<usize> {
        let (mut ll, mut rr) = (0usize, self.shard_count());
        while ll + LINEAR_SCAN_SPAN < rr {
            let mid = (ll + rr) / 2;
            if self.borders[mid] <= key {
                ll = mid;
            } else {
                rr = mid;
            }
        }
        (ll..rr).find(|&s| self.owns(s, key))
    }

    fn interpolate(&self, key: MortonKey) -> Option<usize> {
        let n = self.shard_count();
        let mut s = ((key as u128 / self.range_size) as usize).min(n - 1);
        while s > 0 && key < self.borders[s] {
            s -= 1;
        }
        while s + 1 < n && key >= self.borders[s + 1] {
            s += 1;
        }
        Some(s)
    }

    /// Every shard whose range may hold a point of `query`, ascending and
    /// without duplicates. Corners outside the domain are clipped first; a box
    /// missing the domain entirely reaches no shard.
    pub fn box_shards(&self, query: &BoundingBox) -> Result<ShardSpan> {
        let mut span = ShardSpan::new();
        let Some(query) = query.clip_to_domain() else {
            return Ok(span);
        };
        let (key_min, key_max) = query.key_range();
        let litmin = self.key_to_shard(key_min)?;
        let bigmax = self.key_to_shard(key_max)?;
        if litmin == bigmax {
            span.push(litmin);
            return Ok(span);
        }
        let (litmax_key, bigmin_key) = split(key_min, key_max);
        let litmax = self.key_to_shard(litmax_key)?;
        let bigmin = self.key_to_shard(bigmin_key)?;
        if litmax >= bigmin {
            span.extend(litmin..=bigmax);
        } else {
            span.extend(litmin..=litmax);
            span.extend(bigmin..=bigmax);
        }
        log::debug!(
            "box {:?} spans shards [{litmin}, {litmax}] and [{bigmin}, {bigmax}]",
            query
        );
        Ok(span)
    }

    /// Every shard that may hold a point within `radius` of `center`.
    pub fn ball_shards(&self, center: &Coord, radius: i64, metric: Metric) -> Result<ShardSpan> {
        self.box_shards(&BoundingBox::around(center, metric.axis_extent(radius)))
    }
}
