//! Shard Module
//!
//! Partitions the keyspace across a fixed set of single-threaded workers.
//!
//! ## Ownership
//! Each worker thread owns its [`Store`](crate::store::Store) outright and is
//! the only code that ever touches it. That single-owner rule is the whole
//! concurrency story for key data: no locks are taken on the execution path
//! because nothing else can reach the store.
//!
//! ## Message Flow
//! ```text
//!  Dispatcher ──ShardOp──▶ [bounded queue] ──▶ ShardWorker ──▶ Store
//!      ▲                                          │
//!      └──────────── StoreResponse ───────────────┘
//!      ▲                                          │
//!      └──── FatalSignal (requester + global) ◀───┘  (store failure only)
//! ```

mod manager;
mod worker;

use crossbeam::channel::Sender;

use crate::error::CommandError;
use crate::protocol::{Command, Value};

pub use manager::ShardManager;
pub use worker::ShardWorker;

/// Index of a shard, `0..shard_count`
pub type ShardId = usize;

/// Unit of work sent to a shard
#[derive(Debug, Clone)]
pub struct ShardOp {
    /// Position of this sub-command in the decomposed command
    pub seq_id: usize,

    /// Unique across the process, assigned monotonically
    pub request_id: u64,

    pub command: Command,

    pub shard_id: ShardId,

    /// Connection that issued the op
    pub requester_id: u64,

    /// Read issued before decomposition; answered on the preprocessing channel
    pub is_preprocessing: bool,

    /// Where the response goes
    pub reply: Sender<StoreResponse>,

    /// Where the requester hears about shard failures
    pub faults: Sender<FatalSignal>,
}

/// Result of one [`ShardOp`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreResponse {
    pub request_id: u64,
    pub seq_id: usize,
    pub shard_id: ShardId,
    pub result: std::result::Result<Value, CommandError>,
}

/// Failures that cross component boundaries as signals rather than values
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalSignal {
    /// A shard's store failed while serving `request_id`
    Shard {
        shard_id: ShardId,
        request_id: u64,
        message: String,
    },

    /// Explicit ABORT: shut the whole process down
    Abort,
}
