//! Shard worker
//!
//! The single-threaded loop that owns one store partition.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};

use super::{FatalSignal, ShardId, ShardOp, StoreResponse};
use crate::context::Context;
use crate::store::{Store, StoreError};

pub struct ShardWorker {
    id: ShardId,
    store: Box<dyn Store>,
    requests: Receiver<ShardOp>,
    global_errors: Sender<FatalSignal>,
    sweep_interval: Duration,
}

impl ShardWorker {
    pub fn new(
        id: ShardId,
        store: Box<dyn Store>,
        requests: Receiver<ShardOp>,
        global_errors: Sender<FatalSignal>,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            id,
            store,
            requests,
            global_errors,
            sweep_interval,
        }
    }

    pub fn id(&self) -> ShardId {
        self.id
    }

    /// Serve requests until `ctx` is cancelled or every sender is gone.
    ///
    /// Ops already queued at cancellation are still executed so no caller is
    /// left with a half-applied multi-shard command it never hears about.
    pub fn run(mut self, ctx: Context) {
        tracing::debug!("Shard {} started", self.id);
        let ticker = channel::tick(self.sweep_interval);
        let requests = self.requests.clone();
        let done = ctx.done().clone();

        loop {
            crossbeam::select! {
                recv(requests) -> op => match op {
                    Ok(op) => self.handle(op),
                    Err(_) => break,
                },
                recv(ticker) -> _ => self.sweep(),
                recv(done) -> _ => break,
            }
        }

        let mut drained = 0;
        while let Ok(op) = requests.try_recv() {
            self.handle(op);
            drained += 1;
        }
        self.store.cleanup();
        tracing::debug!("Shard {} stopped ({} ops drained)", self.id, drained);
    }

    fn sweep(&mut self) {
        let removed = self.store.sweep_expired(Instant::now());
        if removed > 0 {
            tracing::debug!("Shard {} expired {} keys", self.id, removed);
        }
    }

    /// Execute one op and answer it.
    ///
    /// A panicking store is reported like a fatal store error and the shard
    /// keeps serving.
    pub fn handle(&mut self, op: ShardOp) {
        let store = &mut self.store;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| store.execute(&op.command)))
            .unwrap_or_else(|payload| Err(StoreError::Fatal(panic_message(payload.as_ref()))));

        let result = match outcome {
            Ok(value) => Ok(value),
            Err(StoreError::Command(e)) => Err(e),
            Err(StoreError::Fatal(message)) => {
                tracing::error!(
                    "Shard {} failed executing '{}': {}",
                    self.id,
                    op.command.name,
                    message
                );
                let signal = FatalSignal::Shard {
                    shard_id: self.id,
                    request_id: op.request_id,
                    message,
                };
                let _ = op.faults.send(signal.clone());
                let _ = self.global_errors.send(signal);
                return;
            }
        };

        let response = StoreResponse {
            request_id: op.request_id,
            seq_id: op.seq_id,
            shard_id: self.id,
            result,
        };
        // Requester timed out and went away
        if op.reply.send(response).is_err() {
            tracing::trace!(
                "Shard {} dropped response {} for requester {}",
                self.id,
                op.request_id,
                op.requester_id
            );
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown cause");
    format!("store panicked: {}", detail)
}
