//! Batch transport between the coordinator and its shards.
//!
//! The coordinator only sees [`Transport`]: submit a batch to a shard, get a
//! ticket, collect the replies later. [`InProcessTransport`] keeps every
//! shard in this process and runs the batches of one round in parallel.

use std::collections::HashMap;

use log::{debug, info};
use rayon::prelude::*;

use crate::config::{Capabilities, Config, ShardConfig};
use crate::error::{Error, Result};
use crate::shard::{Reply, Shard, ShardSnapshot, TaskBatch};

/// Handle for a submitted batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket(pub u64);

pub trait Transport {
    fn shard_count(&self) -> usize;

    /// Queue `batch` for `shard`.
    fn submit(&mut self, shard: u16, batch: TaskBatch) -> Result<Ticket>;

    /// Wait for a submitted batch and take its replies, one per request.
    fn collect(&mut self, ticket: Ticket) -> Result<Vec<Reply>>;

    /// Queue a copy of `batch` for every shard.
    fn broadcast(&mut self, batch: &TaskBatch) -> Result<Vec<Ticket>> {
        (0..self.shard_count())
            .map(|s| self.submit(s as u16, batch.clone()))
            .collect()
    }
}

/// All shards owned by this process.
///
/// Submitted batches wait until a ticket is collected; then every pending
/// batch runs, shards in parallel and each shard's batches in submit order.
pub struct InProcessTransport {
    shards: Vec<Shard>,
    config: ShardConfig,
    pending: Vec<(Ticket, u16, TaskBatch)>,
    done: HashMap<Ticket, Result<Vec<Reply>>>,
    next_ticket: u64,
}

impl InProcessTransport {
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        let shard_config = config.shard_config();
        let shards = (0..config.shard_count)
            .map(|i| Shard::new(i as u16, shard_config))
            .collect::<Result<Vec<_>>>()?;
        info!("in-process transport with {} shards", shards.len());
        Ok(Self {
            shards,
            config: shard_config,
            pending: Vec::new(),
            done: HashMap::new(),
            next_ticket: 0,
        })
    }

    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    /// Run every pending batch.
    pub fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let mut queues: Vec<Vec<(Ticket, TaskBatch)>> = vec![Vec::new(); self.shards.len()];
        for (ticket, shard, batch) in self.pending.drain(..) {
            queues[shard as usize].push((ticket, batch));
        }
        debug!(
            "running {} batches",
            queues.iter().map(Vec::len).sum::<usize>()
        );
        let finished: Vec<Vec<(Ticket, Result<Vec<Reply>>)>> = self
            .shards
            .par_iter_mut()
            .zip(queues.into_par_iter())
            .map(|(shard, queue)| {
                queue
                    .into_iter()
                    .map(|(ticket, batch)| {
                        let result = shard
                            .execute(batch)
                            .map_err(|e| Error::shard_fault(shard.id(), e));
                        (ticket, result)
                    })
                    .collect()
            })
            .collect();
        self.done.extend(finished.into_iter().flatten());
    }

    /// Take every shard apart. Pending batches run first.
    pub fn snapshot_all(&mut self) -> Vec<ShardSnapshot> {
        self.flush();
        std::mem::take(&mut self.shards)
            .into_iter()
            .map(Shard::snapshot)
            .collect()
    }

    /// Reinstall shards from snapshots, in shard order.
    pub fn restore_all(&mut self, snapshots: Vec<ShardSnapshot>, config: ShardConfig) -> Result<()> {
        self.shards = snapshots
            .into_iter()
            .map(|s| Shard::restore(s, config))
            .collect::<Result<Vec<_>>>()?;
        self.config = config;
        Ok(())
    }

    /// Switch every shard to a build serving `capabilities`, keeping its data.
    pub fn switch_capabilities(&mut self, capabilities: Capabilities) -> Result<()> {
        let config = ShardConfig {
            capabilities,
            ..self.config
        };
        let snapshots = self.snapshot_all();
        info!("switching {} shards to {:?}", snapshots.len(), capabilities);
        self.restore_all(snapshots, config)
    }
}

impl Transport for InProcessTransport {
    fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn submit(&mut self, shard: u16, batch: TaskBatch) -> Result<Ticket> {
        if shard as usize >= self.shards.len() {
            return Err(Error::MalformedRequest(format!(
                "no shard {shard} among {}",
                self.shards.len()
            )));
        }
        let ticket = Ticket(self.next_ticket);
        self.next_ticket += 1;
        self.pending.push((ticket, shard, batch));
        Ok(ticket)
    }

    fn collect(&mut self, ticket: Ticket) -> Result<Vec<Reply>> {
        if !self.done.contains_key(&ticket) {
            self.flush();
        }
        self.done
            .remove(&ticket)
            .ok_or(Error::UnknownTicket(ticket.0))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BoundingBox;
    use crate::shard::{Opcode, Request};
    use crate::storage::StorageStats;

    fn transport(shards: usize) -> InProcessTransport {
        InProcessTransport::new(&Config::default().with_shards(shards).with_capacity(64, 64)).unwrap()
    }

    #[test]
    fn test_collect_in_any_order() {
        let mut t = transport(3);
        let stat = TaskBatch::single(Request::StorageStat);
        let tickets = t.broadcast(&stat).unwrap();
        assert_eq!(tickets.len(), 3);
        for ticket in tickets.into_iter().rev() {
            let replies = t.collect(ticket).unwrap();
            assert_eq!(
                replies,
                vec![Reply::Stats(StorageStats {
                    branches: 1,
                    leaves: 0
                })]
            );
        }
    }

    #[test]
    fn test_ticket_collected_once() {
        let mut t = transport(1);
        let ticket = t
            .submit(0, TaskBatch::single(Request::BoxCount(BoundingBox::domain())))
            .unwrap();
        assert_eq!(t.collect(ticket).unwrap(), vec![Reply::Count(0)]);
        assert!(matches!(t.collect(ticket), Err(Error::UnknownTicket(_))));
        assert!(t.submit(1, TaskBatch::new(Opcode::BoxCount)).is_err());
    }

    #[test]
    fn test_failed_batch_faults_its_shard() {
        let mut t = transport(2);
        let ticket = t
            .submit(1, TaskBatch::single(Request::KeySearch { key: 0 }))
            .unwrap();
        match t.collect(ticket) {
            Err(Error::ShardFault { shard, source }) => {
                assert_eq!(shard, 1);
                assert!(matches!(*source, Error::Unsupported { .. }));
            }
            other => panic!("expected a shard fault, got {other:?}"),
        }
    }

    #[test]
    fn test_switch_capabilities_keeps_shards() {
        let mut t = transport(2);
        t.switch_capabilities(Capabilities::all()).unwrap();
        assert_eq!(t.shard_count(), 2);
        let ticket = t
            .submit(1, TaskBatch::single(Request::KeySearch { key: 0 }))
            .unwrap();
        assert_eq!(t.collect(ticket).unwrap(), vec![Reply::Key(None)]);
        assert_eq!(t.shards()[1].id(), 1);
    }
}
