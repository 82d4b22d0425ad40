//! Error types shared by shards, the router, and the coordinator.

use crate::node::NodeKind;
use crate::shard::Opcode;

/// Errors surfaced by index operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A node arena reached its configured capacity. The shard cannot accept
    /// further structural changes.
    #[error("{kind:?} arena exhausted at {capacity} nodes")]
    ArenaExhausted { kind: NodeKind, capacity: usize },

    #[error("output buffer overflow: {needed} entries exceed capacity {capacity}")]
    OutputOverflow { needed: usize, capacity: usize },

    /// More points share one Morton key than a leaf can hold.
    #[error("more than a leaf of points share key {key:#018x}")]
    KeyCollision { key: u64 },

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("opcode {opcode:?} is not enabled on this shard")]
    Unsupported { opcode: Opcode },

    #[error("key {key:#018x} is not owned by any shard")]
    RoutingMiss { key: u64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("shard {shard} faulted: {source}")]
    ShardFault {
        shard: u16,
        #[source]
        source: Box<Error>,
    },

    #[error("unknown or already collected ticket {0}")]
    UnknownTicket(u64),

    #[error("node reference {0} does not name an allocated node")]
    DanglingNode(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn shard_fault(shard: u16, source: Error) -> Self {
        Error::ShardFault {
            shard,
            source: Box::new(source),
        }
    }
}
