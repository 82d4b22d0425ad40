//! Host-side driver: routes client batches to shards and merges replies.
//!
//! Every public operation holds the in-flight lock for its whole duration,
//! so at most one set of batches is outstanding against the shards. Each
//! operation is one or two rounds; a round submits at most one batch per
//! shard and collects all of them before the next round starts.

use std::collections::HashMap;

use log::{debug, info};
use parking_lot::Mutex;
use rayon::prelude::*;

use crate::box_query::FetchResult;
use crate::config::{Capabilities, Config, COORD_MAX};
use crate::error::{Error, Result};
use crate::geometry::{BoundingBox, Coord, Point};
use crate::heap::{BoundedHeap, Scored};
use crate::morton::{coord_to_key, MortonKey};
use crate::node::{NodeRef, NodeView};
use crate::router::PartitionTable;
use crate::shard::{Opcode, Reply, Request, TaskBatch};
use crate::storage::StorageStats;
use crate::transport::{InProcessTransport, Transport};

/// A neighbor and its distance to the query center.
pub type Neighbor = Scored<Point>;

/// Per-shard batches of one round, each request tagged with the caller's
/// index it answers.
struct Round {
    batches: Vec<Option<(TaskBatch, Vec<usize>)>>,
    opcode: Opcode,
}

impl Round {
    fn new(opcode: Opcode, shards: usize) -> Self {
        Self {
            batches: (0..shards).map(|_| None).collect(),
            opcode,
        }
    }

    fn push(&mut self, shard: u16, tag: usize, request: Request) {
        let opcode = self.opcode;
        let (batch, tags) = self.batches[shard as usize].get_or_insert_with(|| (TaskBatch::new(opcode), Vec::new()));
        batch.push(request);
        tags.push(tag);
    }

    /// Submit every batch, then collect them all. Yields `(shard, tag, reply)`.
    fn run<T: Transport>(self, transport: &mut T) -> Result<Vec<(u16, usize, Reply)>> {
        let mut submitted = Vec::new();
        for (shard, entry) in self.batches.into_iter().enumerate() {
            if let Some((batch, tags)) = entry {
                let ticket = transport.submit(shard as u16, batch)?;
                submitted.push((shard as u16, ticket, tags));
            }
        }
        debug!("{:?} round on {} shards", self.opcode, submitted.len());
        let mut out = Vec::new();
        for (shard, ticket, tags) in submitted {
            let replies = transport.collect(ticket)?;
            if replies.len() != tags.len() {
                return Err(Error::shard_fault(
                    shard,
                    Error::MalformedRequest(format!(
                        "{} replies for {} requests",
                        replies.len(),
                        tags.len()
                    )),
                ));
            }
            out.extend(tags.into_iter().zip(replies).map(|(tag, reply)| (shard, tag, reply)));
        }
        Ok(out)
    }
}

fn unexpected(shard: u16, reply: Reply) -> Error {
    Error::shard_fault(shard, Error::MalformedRequest(format!("unexpected reply {reply:?}")))
}

fn check_coord(c: &Coord) -> Result<()> {
    if c.iter().all(|v| (0..=COORD_MAX).contains(v)) {
        Ok(())
    } else {
        Err(Error::MalformedRequest(format!("coordinate {c:?} outside [0, {COORD_MAX}]")))
    }
}

/// Sharded spatial index driven through a [`Transport`].
pub struct Coordinator<T: Transport = InProcessTransport> {
    transport: Mutex<T>,
    router: PartitionTable,
    config: Config,
}

impl Coordinator<InProcessTransport> {
    /// Index with every shard in this process.
    pub fn new(config: Config) -> Result<Self> {
        let transport = InProcessTransport::new(&config)?;
        Self::with_transport(config, transport)
    }

    /// Restart every shard with a different opcode set, keeping its data.
    pub fn switch_capabilities(&mut self, capabilities: Capabilities) -> Result<()> {
        self.transport.get_mut().switch_capabilities(capabilities)?;
        self.config.capabilities = capabilities;
        Ok(())
    }
}

impl<T: Transport> Coordinator<T> {
    /// Take over `transport`, assigning each shard its id and key range.
    pub fn with_transport(config: Config, mut transport: T) -> Result<Self> {
        config.validate()?;
        if transport.shard_count() != config.shard_count {
            return Err(Error::InvalidConfig(format!(
                "transport has {} shards, config expects {}",
                transport.shard_count(),
                config.shard_count
            )));
        }
        let router = PartitionTable::uniform(config.shard_count, config.route_strategy)?;

        let mut init = Round::new(Opcode::Init, config.shard_count);
        let mut ranges = Round::new(Opcode::InitRange, config.shard_count);
        for shard in 0..config.shard_count as u16 {
            init.push(shard, 0, Request::Init { shard });
            ranges.push(shard, 0, Request::InitRange(router.shard_range(shard)));
        }
        init.run(&mut transport)?;
        ranges.run(&mut transport)?;
        info!(
            "coordinator up: {} shards, {:?} routing, {:?} metric",
            config.shard_count, config.route_strategy, config.metric
        );
        Ok(Self {
            transport: Mutex::new(transport),
            router,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn router(&self) -> &PartitionTable {
        &self.router
    }

    /// Insert a batch of points.
    ///
    /// Keys are computed and sorted on the host. A search round locates the
    /// node each key belongs at; points sharing a target become one insert.
    pub fn insert(&self, coords: &[Coord]) -> Result<()> {
        if coords.is_empty() {
            return Ok(());
        }
        coords.iter().try_for_each(check_coord)?;
        let mut points: Vec<Point> = coords.par_iter().map(|c| Point::new(*c)).collect();
        points.par_sort_unstable_by(|a, b| a.key.cmp(&b.key).then_with(|| a.coord.cmp(&b.coord)));
        let router = &self.router;
        let owners = points
            .par_iter()
            .map(|p| router.key_to_shard(p.key))
            .collect::<Result<Vec<u16>>>()?;

        let mut transport = self.transport.lock();

        // One search per distinct key.
        let mut search = Round::new(Opcode::Search, self.config.shard_count);
        let mut first_of_key = Vec::with_capacity(points.len());
        for (i, p) in points.iter().enumerate() {
            if i > 0 && points[i - 1].key == p.key {
                first_of_key.push(first_of_key[i - 1]);
            } else {
                first_of_key.push(i);
                search.push(owners[i], i, Request::Search { key: p.key });
            }
        }
        let mut targets = vec![NodeRef::NULL; points.len()];
        for (shard, tag, reply) in search.run(&mut *transport)? {
            match reply {
                Reply::Node(node) => targets[tag] = node,
                other => return Err(unexpected(shard, other)),
            }
        }

        // Group by target, slot annotation included. Groups stay key-sorted.
        let mut groups: Vec<(u16, NodeRef, Vec<Point>)> = Vec::new();
        let mut group_of: HashMap<NodeRef, usize> = HashMap::new();
        for (i, p) in points.iter().enumerate() {
            let target = targets[first_of_key[i]];
            let g = *group_of.entry(target).or_insert_with(|| {
                groups.push((owners[i], target, Vec::new()));
                groups.len() - 1
            });
            groups[g].2.push(*p);
        }
        debug!("inserting {} points as {} groups", points.len(), groups.len());

        let mut insert = Round::new(Opcode::Insert, self.config.shard_count);
        for (i, (shard, target, points)) in groups.into_iter().enumerate() {
            insert.push(shard, i, Request::Insert { target, points });
        }
        insert.run(&mut *transport)?;
        Ok(())
    }

    /// Points inside each box. Boxes are clipped to the domain first.
    pub fn box_count(&self, boxes: &[BoundingBox]) -> Result<Vec<u64>> {
        let mut round = Round::new(Opcode::BoxCount, self.config.shard_count);
        for (i, b) in boxes.iter().enumerate() {
            let Some(b) = b.clip_to_domain() else { continue };
            for shard in self.router.box_shards(&b)? {
                round.push(shard, i, Request::BoxCount(b));
            }
        }
        let replies = round.run(&mut *self.transport.lock())?;
        let mut counts = vec![0u64; boxes.len()];
        for (shard, tag, reply) in replies {
            match reply {
                Reply::Count(c) => counts[tag] += c,
                other => return Err(unexpected(shard, other)),
            }
        }
        Ok(counts)
    }

    /// Points inside each box. A shard returns at most the configured fetch
    /// capacity; `count` still reports every match.
    pub fn box_fetch(&self, boxes: &[BoundingBox]) -> Result<Vec<FetchResult>> {
        let mut round = Round::new(Opcode::BoxFetch, self.config.shard_count);
        for (i, b) in boxes.iter().enumerate() {
            let Some(b) = b.clip_to_domain() else { continue };
            for shard in self.router.box_shards(&b)? {
                round.push(shard, i, Request::BoxFetch(b));
            }
        }
        let replies = round.run(&mut *self.transport.lock())?;
        let mut results = vec![FetchResult::default(); boxes.len()];
        for (shard, tag, reply) in replies {
            match reply {
                Reply::Fetched(part) => {
                    results[tag].count += part.count;
                    results[tag].points.extend(part.points);
                }
                other => return Err(unexpected(shard, other)),
            }
        }
        Ok(results)
    }

    /// The `k` nearest points to each center, closest first.
    ///
    /// The shard owning a center answers first. If its candidates do not
    /// settle the query, every other shard the candidate ball reaches is asked
    /// for points within that radius, and all candidates are merged.
    pub fn knn(&self, centers: &[Coord], k: usize) -> Result<Vec<Vec<Neighbor>>> {
        if k == 0 {
            return Ok(vec![Vec::new(); centers.len()]);
        }
        centers.iter().try_for_each(check_coord)?;
        let metric = self.config.metric;
        let owners = centers
            .iter()
            .map(|c| self.router.key_to_shard(coord_to_key(c)))
            .collect::<Result<Vec<u16>>>()?;
        let mut heaps: Vec<BoundedHeap<Point>> = (0..centers.len()).map(|_| BoundedHeap::new(k)).collect();

        let mut transport = self.transport.lock();
        let mut first = Round::new(Opcode::Knn, self.config.shard_count);
        for (i, c) in centers.iter().enumerate() {
            first.push(owners[i], i, Request::Knn { k, center: *c });
        }

        let mut second = Round::new(Opcode::KnnBounded, self.config.shard_count);
        let mut widened = 0usize;
        for (shard, tag, reply) in first.run(&mut *transport)? {
            let (candidates, continuation) = match reply {
                Reply::Neighbors { candidates, continuation } => (candidates, continuation),
                other => return Err(unexpected(shard, other)),
            };
            heaps[tag].extend(candidates.into_iter().map(|s| (s.distance, s.item)));
            let Some(radius) = continuation else { continue };
            let center = centers[tag];
            for other in self.router.ball_shards(&center, radius, metric)? {
                if other != shard {
                    second.push(other, tag, Request::KnnBounded { k, center, radius });
                    widened += 1;
                }
            }
        }
        debug!("knn: {} queries, {} bounded follow-ups", centers.len(), widened);

        for (shard, tag, reply) in second.run(&mut *transport)? {
            let candidates = match reply {
                Reply::Neighbors { candidates, .. } => candidates,
                other => return Err(unexpected(shard, other)),
            };
            heaps[tag].extend(candidates.into_iter().map(|s| (s.distance, s.item)));
        }
        Ok(heaps.into_iter().map(BoundedHeap::into_sorted_vec).collect())
    }

    /// Arena occupancy summed over all shards.
    pub fn storage_stats(&self) -> Result<StorageStats> {
        let mut transport = self.transport.lock();
        let tickets = transport.broadcast(&TaskBatch::single(Request::StorageStat))?;
        let mut total = StorageStats::default();
        for (shard, ticket) in tickets.into_iter().enumerate() {
            for reply in transport.collect(ticket)? {
                match reply {
                    Reply::Stats(s) => total += s,
                    other => return Err(unexpected(shard as u16, other)),
                }
            }
        }
        Ok(total)
    }

    /// For each key, the stored key sharing its longest prefix on the owning
    /// shard, if the descent ends in a leaf.
    pub fn key_search(&self, keys: &[MortonKey]) -> Result<Vec<Option<MortonKey>>> {
        let mut round = Round::new(Opcode::KeySearch, self.config.shard_count);
        for (i, key) in keys.iter().enumerate() {
            round.push(self.router.key_to_shard(*key)?, i, Request::KeySearch { key: *key });
        }
        let mut found = vec![None; keys.len()];
        for (shard, tag, reply) in round.run(&mut *self.transport.lock())? {
            match reply {
                Reply::Key(k) => found[tag] = k,
                other => return Err(unexpected(shard, other)),
            }
        }
        Ok(found)
    }

    /// Debug view of the node a lookup for `key` stops at on its owning shard.
    pub fn node_view_by_key(&self, key: MortonKey) -> Result<NodeView> {
        let shard = self.router.key_to_shard(key)?;
        let mut round = Round::new(Opcode::FetchNodeByKey, self.config.shard_count);
        round.push(shard, 0, Request::FetchNodeByKey { key });
        match round.run(&mut *self.transport.lock())?.pop() {
            Some((_, _, Reply::View(view))) => Ok(view),
            Some((shard, _, other)) => Err(unexpected(shard, other)),
            None => Err(Error::shard_fault(shard, Error::MalformedRequest("no reply".into()))),
        }
    }
}
