//! # zd-tree
//!
//! A sharded spatial index over 3-dimensional integer points.
//!
//! Points are ordered by their Morton (Z-order) key. Each shard owns one
//! contiguous slice of the key space and keeps its points in a compressed
//! 16-way trie over those keys. A coordinator routes insert batches, box
//! count/fetch queries, and k-nearest-neighbor queries to the shards that
//! can answer them, splitting box key ranges with LITMAX/BIGMIN so only the
//! shards a box actually touches are asked.
//!
//! ## Example
//!
//! ```rust
//! use zd_tree::{BoundingBox, Config, Coordinator};
//!
//! let index = Coordinator::new(Config::default().with_shards(4)).unwrap();
//! index.insert(&[[1, 1, 1], [1, 1, 2], [5, 5, 5]]).unwrap();
//!
//! let query = BoundingBox::new([0, 0, 0], [2, 2, 2]);
//! assert_eq!(index.box_count(&[query]).unwrap(), vec![2]);
//!
//! let nearest = index.knn(&[[0, 0, 0]], 1).unwrap();
//! assert_eq!(nearest[0][0].item.coord, [1, 1, 1]);
//! ```

#![deny(unsafe_op_in_unsafe_fn)]

pub mod box_query;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod geometry;
pub mod heap;
pub mod insert;
pub mod knn;
pub mod morton;
pub mod node;
pub mod router;
pub mod search;
pub mod shard;
pub mod storage;
pub mod transport;
pub mod worklist;

pub use box_query::FetchResult;
pub use config::{Capabilities, Config, ShardConfig, COORD_MAX, DIM, LEAF_SIZE, MAX_RANGE_QUERY_SIZE};
pub use coordinator::{Coordinator, Neighbor};
pub use error::{Error, Result};
pub use geometry::{BoundingBox, Coord, Metric, Point};
pub use heap::{BoundedHeap, Scored};
pub use morton::{coord_to_key, key_to_coord, split, MortonKey};
pub use node::{NodeKind, NodeRef, NodeView};
pub use router::{KeyRange, PartitionTable, RouteStrategy};
pub use shard::{Opcode, Reply, Request, Shard, ShardSnapshot, SnapshotHeader, TaskBatch};
pub use storage::{StorageStats, TrieStorage};
pub use transport::{InProcessTransport, Ticket, Transport};

#[cfg(test)]
mod proptests;
