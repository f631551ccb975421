//! Shard manager
//!
//! Owns the fixed set of shards, maps keys to shards and runs the workers.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, SendTimeoutError, Sender};
use parking_lot::Mutex;
use xxhash_rust::xxh3::xxh3_64;

use super::{FatalSignal, ShardId, ShardOp, ShardWorker};
use crate::context::Context;
use crate::error::{KvError, Result};
use crate::store::StoreFactory;

/// Fixed-size set of shards.
///
/// The shard count never changes after construction, so a key maps to the
/// same shard for the life of the process.
pub struct ShardManager {
    senders: Vec<Sender<ShardOp>>,

    /// Workers not yet started
    idle: Mutex<Vec<ShardWorker>>,

    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ShardManager {
    pub fn new(
        shard_count: usize,
        queue_capacity: usize,
        sweep_interval: Duration,
        global_errors: Sender<FatalSignal>,
        stores: &StoreFactory,
    ) -> Self {
        let mut senders = Vec::with_capacity(shard_count);
        let mut workers = Vec::with_capacity(shard_count);

        for id in 0..shard_count {
            let (tx, rx) = channel::bounded(queue_capacity);
            senders.push(tx);
            workers.push(ShardWorker::new(
                id,
                stores(id),
                rx,
                global_errors.clone(),
                sweep_interval,
            ));
        }

        Self {
            senders,
            idle: Mutex::new(workers),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.senders.len()
    }

    /// Shard owning `key`: xxh3-64 of the key modulo the shard count
    pub fn shard_for_key(&self, key: &str) -> ShardId {
        (xxh3_64(key.as_bytes()) % self.senders.len() as u64) as ShardId
    }

    /// Owning shard and its request queue
    pub fn get_shard_info(&self, key: &str) -> (ShardId, &Sender<ShardOp>) {
        let id = self.shard_for_key(key);
        (id, &self.senders[id])
    }

    /// Request queue of shard `id`
    pub fn get_shard(&self, id: ShardId) -> Option<&Sender<ShardOp>> {
        self.senders.get(id)
    }

    /// Enqueue `op` on the shard named by `op.shard_id`, waiting for queue
    /// space no later than `deadline`
    pub fn submit(&self, op: ShardOp, deadline: Option<Instant>) -> Result<()> {
        let shard_id = op.shard_id;
        let sender = self
            .senders
            .get(shard_id)
            .ok_or_else(|| KvError::Internal(format!("no shard {}", shard_id)))?;

        let sent = match deadline {
            Some(deadline) => sender.send_deadline(op, deadline),
            None => sender.send(op).map_err(|e| SendTimeoutError::Disconnected(e.0)),
        };
        sent.map_err(|e| match e {
            SendTimeoutError::Timeout(_) => KvError::Timeout,
            SendTimeoutError::Disconnected(_) => {
                KvError::Internal(format!("shard {} is not running", shard_id))
            }
        })
    }

    /// Spawn one thread per shard. Later calls are no-ops.
    pub fn start(&self, ctx: &Context) -> Result<()> {
        let workers: Vec<ShardWorker> = self.idle.lock().drain(..).collect();
        let mut handles = self.handles.lock();

        for worker in workers {
            let ctx = ctx.clone();
            let handle = thread::Builder::new()
                .name(format!("shard-{}", worker.id()))
                .spawn(move || worker.run(ctx))?;
            handles.push(handle);
        }
        Ok(())
    }

    /// Start the shards, block until `ctx` is cancelled, then wait for
    /// every shard loop to exit
    pub fn run(&self, ctx: Context) -> Result<()> {
        self.start(&ctx)?;
        let _ = ctx.done().recv();
        self.join();
        Ok(())
    }

    /// Wait for all started shard threads to finish
    pub fn join(&self) {
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("Shard thread panicked");
            }
        }
    }
}
