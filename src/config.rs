//! Compile-time layout constants and runtime configuration.

use crate::error::{Error, Result};
use crate::geometry::Metric;
use crate::router::RouteStrategy;

// =============================================================================
// Layout constants
// =============================================================================

/// Number of coordinate dimensions.
pub const DIM: usize = 3;

/// Largest admissible coordinate value on every axis.
pub const COORD_MAX: i64 = i32::MAX as i64;

/// Number of significant bits in a coordinate (`COORD_MAX` is `2^31 - 1`).
pub const COORD_BITS: u32 = 31;

/// 1-indexed key bit position (from the MSB of a `u64`) of a coordinate's top bit.
pub const KEY_START_POS: u32 = 64 - (COORD_BITS - 1);

/// Bits consumed per trie level.
pub const BRANCH_BITS: u32 = 4;

/// Children per branch node.
pub const BRANCH_FACTOR: usize = 1 << BRANCH_BITS;

pub(crate) const BRANCH_MASK: u64 = (BRANCH_FACTOR - 1) as u64;

/// Maximum points held by one leaf.
pub const LEAF_SIZE: usize = 16;

/// Subtree sizes below this are exact; counting shortcuts only trust those.
pub const MAX_RANGE_QUERY_SIZE: i64 = 1000;

/// Mutexes guarding branch subtree counters.
pub const COUNTER_LOCK_POOL: usize = 16;

/// Fast-tier capacity of a traversal work list before it spills.
pub const WORKLIST_FAST_CAPACITY: usize = 10;

// =============================================================================
// Capabilities
// =============================================================================

/// Opcode families a shard is built to serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub insert: bool,
    pub box_count: bool,
    pub box_fetch: bool,
    pub knn: bool,
    /// Raw node fetches and key probes, for inspection only.
    pub debug: bool,
}

impl Capabilities {
    pub const fn all() -> Self {
        Self {
            insert: true,
            box_count: true,
            box_fetch: true,
            knn: true,
            debug: true,
        }
    }

    /// Everything except the debug node fetches.
    pub const fn serving() -> Self {
        Self {
            debug: false,
            ..Self::all()
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::serving()
    }
}

// =============================================================================
// Config
// =============================================================================

/// Configuration for a sharded index.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of shards the key space is partitioned over.
    pub shard_count: usize,
    /// Worker threads cooperating on one shard batch.
    pub workers_per_shard: usize,
    /// Maximum branch nodes per shard, root included.
    pub branch_capacity: usize,
    /// Maximum leaf nodes per shard.
    pub leaf_capacity: usize,
    /// Distance used by nearest-neighbor queries.
    pub metric: Metric,
    /// Key to shard lookup strategy.
    pub route_strategy: RouteStrategy,
    /// Maximum points one reply may carry from one shard. Box fetches beyond
    /// it are truncated; kNN requests needing more are rejected.
    pub fetch_capacity: usize,
    pub capabilities: Capabilities,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shard_count: 4,
            workers_per_shard: 4,
            branch_capacity: 1 << 16,
            leaf_capacity: 1 << 17,
            metric: Metric::default(),
            route_strategy: RouteStrategy::default(),
            fetch_capacity: 1 << 16,
            capabilities: Capabilities::default(),
        }
    }
}

impl Config {
    pub fn with_shards(mut self, shard_count: usize) -> Self {
        self.shard_count = shard_count;
        self
    }

    pub fn with_workers(mut self, workers_per_shard: usize) -> Self {
        self.workers_per_shard = workers_per_shard;
        self
    }

    pub fn with_capacity(mut self, branch_capacity: usize, leaf_capacity: usize) -> Self {
        self.branch_capacity = branch_capacity;
        self.leaf_capacity = leaf_capacity;
        self
    }

    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_route_strategy(mut self, strategy: RouteStrategy) -> Self {
        self.route_strategy = strategy;
        self
    }

    pub fn with_fetch_capacity(mut self, fetch_capacity: usize) -> Self {
        self.fetch_capacity = fetch_capacity;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 || self.shard_count > u16::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "shard_count must be in 1..={}, got {}",
                u16::MAX,
                self.shard_count
            )));
        }
        if self.workers_per_shard == 0 {
            return Err(Error::InvalidConfig("workers_per_shard must be positive".into()));
        }
        if self.branch_capacity == 0 || self.branch_capacity > u32::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "branch_capacity must be in 1..={}, got {}",
                u32::MAX,
                self.branch_capacity
            )));
        }
        if self.leaf_capacity > u32::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "leaf_capacity must be at most {}, got {}",
                u32::MAX,
                self.leaf_capacity
            )));
        }
        Ok(())
    }

    /// Per-shard view of this configuration.
    pub fn shard_config(&self) -> ShardConfig {
        ShardConfig {
            workers: self.workers_per_shard,
            branch_capacity: self.branch_capacity,
            leaf_capacity: self.leaf_capacity,
            metric: self.metric,
            fetch_capacity: self.fetch_capacity,
            capabilities: self.capabilities,
        }
    }
}

/// Settings one shard needs to run batches.
#[derive(Debug, Clone, Copy)]
pub struct ShardConfig {
    pub workers: usize,
    pub branch_capacity: usize,
    pub leaf_capacity: usize,
    pub metric: Metric,
    pub fetch_capacity: usize,
    pub capabilities: Capabilities,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Config::default().shard_config()
    }
}
