//! One shard: its trie, its owned key range, and the batch executor.
//!
//! A shard runs one batch of homogeneous requests at a time. The batch is
//! validated up front, then split into contiguous slices, one per worker.
//! Workers line up on a barrier before starting and again after finishing,
//! and the replies come back in request order.

use std::sync::Barrier;

use log::{debug, info, warn};

use crate::box_query::FetchResult;
use crate::config::{Capabilities, ShardConfig};
use crate::error::{Error, Result};
use crate::geometry::{BoundingBox, Coord, Point};
use crate::heap::{BoundedHeap, Scored};
use crate::knn::ball_within_range;
use crate::morton::MortonKey;
use crate::node::{NodeRef, NodeView};
use crate::router::KeyRange;
use crate::storage::{StorageStats, TrieStorage};

// =============================================================================
// Opcodes and messages
// =============================================================================

/// Operation carried by a batch. Discriminants are the wire ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    Init = 1002,
    InitRange = 1004,
    Search = 101,
    Insert = 103,
    KeySearch = 104,
    FetchNodeByKey = 106,
    FetchNode = 107,
    StorageStat = 109,
    BoxCount = 201,
    BoxFetch = 203,
    Knn = 301,
    KnnBounded = 303,
}

impl Opcode {
    pub const ALL: [Opcode; 12] = [
        Opcode::Init,
        Opcode::InitRange,
        Opcode::Search,
        Opcode::Insert,
        Opcode::KeySearch,
        Opcode::FetchNodeByKey,
        Opcode::FetchNode,
        Opcode::StorageStat,
        Opcode::BoxCount,
        Opcode::BoxFetch,
        Opcode::Knn,
        Opcode::KnnBounded,
    ];

    #[inline]
    pub fn id(self) -> u16 {
        self as u16
    }

    pub fn from_id(id: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.id() == id)
    }

    /// Whether a shard built with `caps` serves this opcode.
    pub fn enabled(self, caps: &Capabilities) -> bool {
        match self {
            Opcode::Init | Opcode::InitRange | Opcode::StorageStat => true,
            Opcode::Search | Opcode::Insert => caps.insert,
            Opcode::BoxCount => caps.box_count,
            Opcode::BoxFetch => caps.box_fetch,
            Opcode::Knn | Opcode::KnnBounded => caps.knn,
            Opcode::KeySearch | Opcode::FetchNodeByKey | Opcode::FetchNode => caps.debug,
        }
    }
}

/// One request inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Init { shard: u16 },
    InitRange(KeyRange),
    Search { key: MortonKey },
    /// Key-sorted points and the node a search located for them.
    Insert { target: NodeRef, points: Vec<Point> },
    KeySearch { key: MortonKey },
    FetchNodeByKey { key: MortonKey },
    FetchNode { node: NodeRef },
    StorageStat,
    BoxCount(BoundingBox),
    BoxFetch(BoundingBox),
    Knn { k: usize, center: Coord },
    KnnBounded { k: usize, center: Coord, radius: i64 },
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Init { .. } => Opcode::Init,
            Request::InitRange(_) => Opcode::InitRange,
            Request::Search { .. } => Opcode::Search,
            Request::Insert { .. } => Opcode::Insert,
            Request::KeySearch { .. } => Opcode::KeySearch,
            Request::FetchNodeByKey { .. } => Opcode::FetchNodeByKey,
            Request::FetchNode { .. } => Opcode::FetchNode,
            Request::StorageStat => Opcode::StorageStat,
            Request::BoxCount(_) => Opcode::BoxCount,
            Request::BoxFetch(_) => Opcode::BoxFetch,
            Request::Knn { .. } => Opcode::Knn,
            Request::KnnBounded { .. } => Opcode::KnnBounded,
        }
    }
}

/// Reply to one request, in the same position as the request.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Done,
    Node(NodeRef),
    Key(Option<MortonKey>),
    View(NodeView),
    Stats(StorageStats),
    Count(u64),
    Fetched(FetchResult),
    /// Local candidates in ascending order. `continuation` is the radius
    /// other shards must be searched with, or `None` when this shard alone
    /// settles the query.
    Neighbors {
        candidates: Vec<Scored<Point>>,
        continuation: Option<i64>,
    },
}

/// Requests sharing one opcode, executed as a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskBatch {
    pub opcode: Opcode,
    pub requests: Vec<Request>,
}

impl TaskBatch {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            requests: Vec::new(),
        }
    }

    pub fn single(request: Request) -> Self {
        Self {
            opcode: request.opcode(),
            requests: vec![request],
        }
    }

    pub fn push(&mut self, request: Request) {
        self.requests.push(request);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

// =============================================================================
// Shard
// =============================================================================

/// Fixed-size record describing a shard's state at snapshot time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub shard_id: u16,
    pub key_range: KeyRange,
    pub branch_count: usize,
    pub leaf_count: usize,
    pub root: NodeRef,
}

/// A shard taken apart for a mode switch. Holds the arenas untouched.
pub struct ShardSnapshot {
    pub header: SnapshotHeader,
    storage: TrieStorage,
}

pub struct Shard {
    id: u16,
    config: ShardConfig,
    storage: TrieStorage,
    range: KeyRange,
}

impl Shard {
    pub fn new(id: u16, config: ShardConfig) -> Result<Self> {
        let storage = TrieStorage::new(id, config.branch_capacity, config.leaf_capacity)?;
        Ok(Self {
            id,
            config,
            storage,
            range: KeyRange::FULL,
        })
    }

    #[inline]
    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn config(&self) -> &ShardConfig {
        &self.config
    }

    /// Inclusive key range this shard owns.
    pub fn range(&self) -> KeyRange {
        self.range
    }

    pub fn storage(&self) -> &TrieStorage {
        &self.storage
    }

    /// Run one batch and return one reply per request, in order.
    pub fn execute(&mut self, batch: TaskBatch) -> Result<Vec<Reply>> {
        self.validate(&batch)?;
        debug!(
            "shard {}: {:?} x{}",
            self.id,
            batch.opcode,
            batch.requests.len()
        );
        match batch.opcode {
            Opcode::Init | Opcode::InitRange => {
                for request in &batch.requests {
                    self.configure(request)?;
                }
                Ok(vec![Reply::Done; batch.requests.len()])
            }
            Opcode::StorageStat => Ok(vec![Reply::Stats(self.storage.stats()); batch.requests.len()]),
            _ => self.run_workers(&batch.requests),
        }
    }

    fn validate(&self, batch: &TaskBatch) -> Result<()> {
        if !batch.opcode.enabled(&self.config.capabilities) {
            return Err(Error::Unsupported {
                opcode: batch.opcode,
            });
        }
        if let Some(stray) = batch.requests.iter().find(|r| r.opcode() != batch.opcode) {
            return Err(Error::MalformedRequest(format!(
                "{:?} request in a {:?} batch",
                stray.opcode(),
                batch.opcode
            )));
        }
        Ok(())
    }

    fn configure(&mut self, request: &Request) -> Result<()> {
        match *request {
            Request::Init { shard } => {
                self.id = shard;
                self.storage.set_shard_id(shard);
                self.storage.reset()?;
                self.range = KeyRange::FULL;
                info!("shard {shard} initialized");
            }
            Request::InitRange(range) => {
                if range.start > range.end {
                    return Err(Error::MalformedRequest(format!(
                        "empty key range {:#x}..={:#x}",
                        range.start, range.end
                    )));
                }
                self.range = range;
                info!(
                    "shard {} owns keys {:#018x}..={:#018x}",
                    self.id, range.start, range.end
                );
            }
            _ => {
                return Err(Error::MalformedRequest(format!(
                    "{:?} is not a configuration request",
                    request.opcode()
                )))
            }
        }
        Ok(())
    }

    /// Split `requests` into contiguous slices and run them on scoped workers.
    fn run_workers(&self, requests: &[Request]) -> Result<Vec<Reply>> {
        let workers = self.config.workers.clamp(1, requests.len().max(1));
        if workers == 1 {
            return requests.iter().map(|r| self.handle(r)).collect();
        }
        let slices: Vec<&[Request]> = requests.chunks(requests.len().div_ceil(workers)).collect();
        let barrier = Barrier::new(slices.len());

        let results: Vec<Result<Vec<Reply>>> = std::thread::scope(|scope| {
            let handles: Vec<_> = slices
                .iter()
                .map(|slice| {
                    let barrier = &barrier;
                    scope.spawn(move || {
                        barrier.wait();
                        let replies = slice.iter().map(|r| self.handle(r)).collect();
                        if barrier.wait().is_leader() {
                            debug!("shard {}: workers done", self.id);
                        }
                        replies
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        });

        let mut replies = Vec::with_capacity(requests.len());
        for part in results {
            replies.extend(part?);
        }
        Ok(replies)
    }

    fn handle(&self, request: &Request) -> Result<Reply> {
        let storage = &self.storage;
        let reply = match request {
            Request::Search { key } => Reply::Node(storage.locate(*key, true)?),
            Request::Insert { target, points } => {
                if target.shard() != self.id {
                    return Err(Error::DanglingNode(target.to_string()));
                }
                if points.windows(2).any(|w| w[0].key > w[1].key) {
                    return Err(Error::MalformedRequest("insert batch is not key-sorted".into()));
                }
                storage.insert_batch(*target, points).map_err(|e| {
                    warn!("shard {}: insert at {target} failed: {e}", self.id);
                    e
                })?;
                Reply::Done
            }
            Request::KeySearch { key } => Reply::Key(storage.key_search(*key)?),
            Request::FetchNodeByKey { key } => Reply::View(storage.node_view_by_key(*key)?),
            Request::FetchNode { node } => Reply::View(storage.node_view(*node)?),
            Request::BoxCount(query) => Reply::Count(storage.box_count(query)?),
            Request::BoxFetch(query) => Reply::Fetched(storage.box_fetch(query, self.config.fetch_capacity)?),
            Request::Knn { k, center } => self.knn_first_round(*k, center)?,
            Request::KnnBounded { k, center, radius } => {
                let mut heap = self.knn_heap(*k)?;
                if *k > 0 {
                    storage.knn(center, *radius, &mut heap, self.config.metric)?;
                }
                Reply::Neighbors {
                    candidates: heap.into_sorted_vec(),
                    continuation: None,
                }
            }
            Request::Init { .. } | Request::InitRange(_) | Request::StorageStat => {
                return Err(Error::MalformedRequest(format!(
                    "{:?} cannot run on a worker",
                    request.opcode()
                )))
            }
        };
        Ok(reply)
    }

    fn knn_first_round(&self, k: usize, center: &Coord) -> Result<Reply> {
        if k == 0 {
            return Ok(Reply::Neighbors {
                candidates: Vec::new(),
                continuation: None,
            });
        }
        let metric = self.config.metric;
        let mut heap = self.knn_heap(k)?;
        let found = self.storage.knn(center, i64::MAX, &mut heap, metric)?;
        // Fewer than k local points bound nothing.
        let radius = if heap.is_full() { found } else { i64::MAX };
        let continuation = (!ball_within_range(center, radius, metric, &self.range)).then_some(radius);
        Ok(Reply::Neighbors {
            candidates: heap.into_sorted_vec(),
            continuation,
        })
    }

    /// Candidate heap for a `k` query, sized for the metric's headroom.
    fn knn_heap(&self, k: usize) -> Result<BoundedHeap<Point>> {
        let needed = self.config.metric.shard_heap_capacity(k);
        if needed > self.config.fetch_capacity {
            return Err(Error::OutputOverflow {
                needed,
                capacity: self.config.fetch_capacity,
            });
        }
        Ok(BoundedHeap::new(needed))
    }

    /// Rewind both arenas and reinstall an empty root.
    pub fn reset(&mut self) -> Result<()> {
        self.storage.reset()?;
        info!("shard {} reset", self.id);
        Ok(())
    }

    pub fn header(&self) -> SnapshotHeader {
        let stats = self.storage.stats();
        SnapshotHeader {
            shard_id: self.id,
            key_range: self.range,
            branch_count: stats.branches,
            leaf_count: stats.leaves,
            root: self.storage.root(),
        }
    }

    /// Take the shard apart, keeping its arenas for [`Shard::restore`].
    pub fn snapshot(self) -> ShardSnapshot {
        let header = self.header();
        info!(
            "shard {} snapshot: {} branches, {} leaves",
            header.shard_id, header.branch_count, header.leaf_count
        );
        ShardSnapshot {
            header,
            storage: self.storage,
        }
    }

    /// Rebuild a shard from a snapshot, checking the header against the arenas.
    pub fn restore(snapshot: ShardSnapshot, config: ShardConfig) -> Result<Self> {
        let ShardSnapshot { header, storage } = snapshot;
        let stats = storage.stats();
        if stats.branches != header.branch_count
            || stats.leaves != header.leaf_count
            || storage.shard_id() != header.shard_id
            || storage.root() != header.root
        {
            return Err(Error::MalformedRequest(format!(
                "snapshot header {header:?} does not match its arenas"
            )));
        }
        info!("shard {} restored", header.shard_id);
        Ok(Self {
            id: header.shard_id,
            config,
            storage,
            range: header.key_range,
        })
    }
}
