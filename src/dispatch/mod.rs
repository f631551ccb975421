//! Dispatch Module
//!
//! Turns one client command into shard work and back into one reply.
//!
//! ## Pipeline
//! ```text
//!  Command ─▶ classify ─▶ [preprocess] ─▶ decompose ─▶ scatter ─▶ gather ─▶ compose
//!                │                                                           │
//!                └─▶ local handler (Global / Custom)         WAL + watch ◀──┘
//! ```
//!
//! Each connection owns one [`Dispatcher`]. It holds private response,
//! preprocessing and fault channels, so shards reply straight to the
//! requester and no two connections ever read each other's responses.
//! Responses belonging to requests that already timed out are discarded.

mod local;
mod meta;
mod plans;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};

use crate::auth::AuthSession;
use crate::context::Context;
use crate::error::{CommandError, KvError, Result};
use crate::protocol::{Command, Response, Value};
use crate::shard::{FatalSignal, ShardId, ShardManager, ShardOp, StoreResponse};
use crate::wal::{ReplayStats, Wal};
use crate::watch::{MutationEvent, WatchManager, WatchNotification};

pub use meta::{command_table, CmdMeta, CmdType, CommandTable, WATCHABLE};
pub use plans::{SetOp, ShardPlan};

const WATCH_SUFFIX: &str = ".WATCH";
const UNWATCH_SUFFIX: &str = ".UNWATCH";

/// Whether side effects of executed commands are recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Serving a client: log writes and emit watch events
    Client,

    /// Re-applying the WAL at startup: no logging, no events, no auth
    Replay,
}

/// Server components shared by every dispatcher
#[derive(Clone)]
pub struct DispatchShared {
    pub shards: Arc<ShardManager>,
    pub wal: Arc<dyn Wal>,
    pub watch: Arc<WatchManager>,
    pub global_errors: Sender<FatalSignal>,
    pub request_ids: Arc<AtomicU64>,
    pub request_timeout: Duration,
    pub require_pass: Option<(String, String)>,
}

/// Per-connection command router
pub struct Dispatcher {
    client_id: u64,
    shared: DispatchShared,
    session: AuthSession,
    mode: DispatchMode,

    responses_tx: Sender<StoreResponse>,
    responses_rx: Receiver<StoreResponse>,

    /// Preprocessing reads answer here, never on `responses_rx`
    preprocess_tx: Sender<StoreResponse>,
    preprocess_rx: Receiver<StoreResponse>,

    faults_tx: Sender<FatalSignal>,
    faults_rx: Receiver<FatalSignal>,

    notify_tx: Sender<WatchNotification>,
    notify_rx: Receiver<WatchNotification>,
}

impl Dispatcher {
    pub fn new(shared: DispatchShared, client_id: u64, mode: DispatchMode) -> Self {
        let session = match mode {
            DispatchMode::Client => AuthSession::new(shared.require_pass.clone()),
            DispatchMode::Replay => AuthSession::new(None),
        };
        let (responses_tx, responses_rx) = channel::unbounded();
        let (preprocess_tx, preprocess_rx) = channel::unbounded();
        let (faults_tx, faults_rx) = channel::unbounded();
        let (notify_tx, notify_rx) = channel::unbounded();

        Self {
            client_id,
            shared,
            session,
            mode,
            responses_tx,
            responses_rx,
            preprocess_tx,
            preprocess_rx,
            faults_tx,
            faults_rx,
            notify_tx,
            notify_rx,
        }
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Watch notifications addressed to this connection
    pub fn notifications(&self) -> &Receiver<WatchNotification> {
        &self.notify_rx
    }

    // =========================================================================
    // Entry points
    // =========================================================================

    /// Execute one command under the configured request timeout
    pub fn execute(&mut self, ctx: &Context, command: Command) -> Result<Value> {
        let ctx = ctx.with_timeout(self.shared.request_timeout);

        if command.name != "AUTH" && !self.session.is_active() {
            return Err(KvError::Auth("Authentication required.".into()));
        }

        match self.route(&ctx, command) {
            Err(KvError::PreProcess { fallback }) => Ok(fallback),
            other => other,
        }
    }

    /// Execute `command` and shape the client-visible response.
    ///
    /// A successful `.WATCH` answers with a push frame carrying the
    /// subscription fingerprint.
    pub fn handle(&mut self, ctx: &Context, command: Command) -> Response {
        let is_watch = command_table()
            .get(&command.name)
            .is_some_and(|m| m.cmd_type == CmdType::Watch);
        if !is_watch {
            return into_response(self.execute(ctx, command));
        }

        let (canonical, label) = split_watch(&command);
        let label = label.unwrap_or_else(|| command.name.clone());
        let fingerprint = canonical.fingerprint();
        match self.execute(ctx, command) {
            Ok(value) => Response::Push {
                label,
                fingerprint,
                result: Ok(value),
            },
            Err(e) => Response::error(e.to_string()),
        }
    }

    /// Re-run a watched query and format the result as a push
    pub fn handle_notification(&mut self, ctx: &Context, notification: WatchNotification) -> Response {
        let label = notification
            .label
            .unwrap_or_else(|| format!("{}{}", notification.command.name, WATCH_SUFFIX));
        let result = self
            .execute(ctx, notification.command)
            .map_err(|e| e.to_string());
        Response::Push {
            label,
            fingerprint: notification.fingerprint,
            result,
        }
    }

    /// Re-apply every logged command. Per-command failures are logged and
    /// skipped; anything else aborts the replay.
    pub fn replay(&mut self, ctx: &Context) -> Result<ReplayStats> {
        let wal = Arc::clone(&self.shared.wal);
        let mut skipped = 0u64;
        let stats = wal.replay_command(&mut |command| match self.execute(ctx, command.clone()) {
            Ok(_) => Ok(()),
            Err(KvError::Command(e)) => {
                skipped += 1;
                tracing::warn!("Replay of '{}' failed: {}", command, e);
                Ok(())
            }
            Err(e) => Err(e),
        })?;
        if skipped > 0 {
            tracing::warn!("Replay skipped {} failing commands", skipped);
        }
        Ok(stats)
    }

    // =========================================================================
    // Classification
    // =========================================================================

    fn route(&mut self, ctx: &Context, command: Command) -> Result<Value> {
        // Unknown commands go to the shard owning their first argument
        let Some(meta) = command_table().get(&command.name) else {
            return self.single_shard(ctx, command);
        };

        match meta.cmd_type {
            CmdType::Global | CmdType::Custom => {
                let env = local::LocalEnv {
                    session: &mut self.session,
                    global_errors: &self.shared.global_errors,
                    client_id: self.client_id,
                    shard_count: self.shared.shards.shard_count(),
                };
                local::execute(ctx, &command, env)
            }
            CmdType::SingleShard => self.single_shard(ctx, command),
            CmdType::MultiShard => self.multi_shard(ctx, meta, &command),
            CmdType::AllShard => self.all_shard(ctx, meta, &command),
            CmdType::Watch => self.watch(ctx, &command),
            CmdType::Unwatch => self.unwatch(&command),
        }
    }

    fn single_shard(&mut self, ctx: &Context, command: Command) -> Result<Value> {
        let shard_id = self.shared.shards.shard_for_key(command.routing_key());
        let subs = vec![(shard_id, command)];
        let mut responses = self.scatter_gather(ctx, &subs, false)?;
        let response = responses
            .pop()
            .ok_or_else(|| KvError::Internal("no response gathered".into()))?;
        self.record_effects(&subs, std::slice::from_ref(&response), false)?;
        response.result.map_err(KvError::Command)
    }

    fn multi_shard(&mut self, ctx: &Context, meta: &CmdMeta, command: &Command) -> Result<Value> {
        let plan = plan_of(meta)?;

        let fetched = if plan.requires_preprocessing() {
            let reads = self.routed(plan.preprocess(command)?);
            let mut fetched = self.scatter_gather(ctx, &reads, true)?;
            fetched.sort_by_key(|r| r.seq_id);
            fetched
        } else {
            Vec::new()
        };

        let subs = self.routed(plan.decompose(command, &fetched)?);
        let responses = self.scatter_gather(ctx, &subs, false)?;
        self.record_effects(&subs, &responses, false)?;
        if responses.is_empty() {
            return Err(KvError::Internal(format!("{} gathered no responses", command.name)));
        }
        plan.compose(command, responses)
    }

    fn all_shard(&mut self, ctx: &Context, meta: &CmdMeta, command: &Command) -> Result<Value> {
        let plan = plan_of(meta)?;
        let broadcast = match plan.decompose(command, &[])?.as_slice() {
            [one] => one.clone(),
            other => {
                return Err(KvError::Internal(format!(
                    "{} must decompose to one broadcast command, got {}",
                    command.name,
                    other.len()
                )));
            }
        };

        // seq_id == shard id
        let subs: Vec<(ShardId, Command)> = (0..self.shared.shards.shard_count())
            .map(|id| (id, broadcast.clone()))
            .collect();
        let responses = self.scatter_gather(ctx, &subs, false)?;
        self.record_effects(&subs, &responses, true)?;
        if responses.is_empty() {
            return Err(KvError::Internal(format!("{} gathered no responses", command.name)));
        }
        plan.compose(command, responses)
    }

    fn watch(&mut self, ctx: &Context, command: &Command) -> Result<Value> {
        let (canonical, label) = split_watch(command);
        let value = self.route(ctx, canonical.clone())?;

        if self.mode == DispatchMode::Client {
            let key = canonical.routing_key().to_string();
            self.shared.watch.handle_subscribe(
                canonical.fingerprint(),
                key,
                canonical,
                self.client_id,
                label,
                self.notify_tx.clone(),
            );
        }
        Ok(value)
    }

    /// Reply OK at once; the watch manager drops the subscription later
    fn unwatch(&mut self, command: &Command) -> Result<Value> {
        let [fingerprint] = command.args.as_slice() else {
            return Err(KvError::Command(CommandError::WrongArity(
                command.name.to_ascii_lowercase(),
            )));
        };
        let fingerprint: u32 = fingerprint.parse().map_err(|_| {
            CommandError::InvalidArgument(format!("invalid fingerprint '{}'", fingerprint))
        })?;
        tracing::debug!(
            "Client {} unwatching {} ({})",
            self.client_id,
            command.name.strip_suffix(UNWATCH_SUFFIX).unwrap_or(&command.name),
            fingerprint
        );
        self.shared.watch.handle_unsubscribe(fingerprint, self.client_id);
        Ok(Value::Ok)
    }

    // =========================================================================
    // Scatter / gather
    // =========================================================================

    fn routed(&self, commands: Vec<Command>) -> Vec<(ShardId, Command)> {
        commands
            .into_iter()
            .map(|c| (self.shared.shards.shard_for_key(c.routing_key()), c))
            .collect()
    }

    fn scatter_gather(
        &self,
        ctx: &Context,
        subs: &[(ShardId, Command)],
        preprocessing: bool,
    ) -> Result<Vec<StoreResponse>> {
        let pending = self.scatter(ctx, subs, preprocessing)?;
        self.gather(ctx, pending, preprocessing)
    }

    /// Enqueue one op per sub-command; `seq_id` is its index in `subs`
    fn scatter(&self, ctx: &Context, subs: &[(ShardId, Command)], preprocessing: bool) -> Result<HashSet<u64>> {
        let reply = if preprocessing {
            &self.preprocess_tx
        } else {
            &self.responses_tx
        };

        let mut pending = HashSet::with_capacity(subs.len());
        for (seq_id, (shard_id, command)) in subs.iter().enumerate() {
            let request_id = self.shared.request_ids.fetch_add(1, Ordering::Relaxed) + 1;
            let op = ShardOp {
                seq_id,
                request_id,
                command: command.clone(),
                shard_id: *shard_id,
                requester_id: self.client_id,
                is_preprocessing: preprocessing,
                reply: reply.clone(),
                faults: self.faults_tx.clone(),
            };
            self.shared.shards.submit(op, ctx.deadline())?;
            pending.insert(request_id);
        }
        Ok(pending)
    }

    /// Collect one response per pending request id.
    ///
    /// The first of: all responses in, a shard fault for one of them, the
    /// deadline, or cancellation.
    fn gather(&self, ctx: &Context, mut pending: HashSet<u64>, preprocessing: bool) -> Result<Vec<StoreResponse>> {
        let responses = if preprocessing {
            &self.preprocess_rx
        } else {
            &self.responses_rx
        };
        let deadline = match ctx.remaining() {
            Some(left) => channel::after(left),
            None => channel::never(),
        };

        let mut gathered = Vec::with_capacity(pending.len());
        while !pending.is_empty() {
            crossbeam::select! {
                recv(responses) -> msg => {
                    let response = msg.map_err(|_| KvError::Internal("response channel closed".into()))?;
                    if pending.remove(&response.request_id) {
                        gathered.push(response);
                    } else {
                        tracing::trace!(
                            "Client {} discarding stale response {}",
                            self.client_id,
                            response.request_id
                        );
                    }
                }
                recv(self.faults_rx) -> msg => {
                    if let Ok(FatalSignal::Shard { shard_id, request_id, message }) = msg {
                        if pending.contains(&request_id) {
                            return Err(KvError::ShardFatal { shard_id, message });
                        }
                    }
                }
                recv(deadline) -> _ => return Err(KvError::Timeout),
                recv(ctx.done()) -> _ => return Err(KvError::Cancelled),
            }
        }
        Ok(gathered)
    }

    // =========================================================================
    // Side effects
    // =========================================================================

    /// Log applied writes and tell the watch manager about them.
    ///
    /// Broadcast commands are logged once if any shard applied them and
    /// produce a keyspace-wide event.
    fn record_effects(
        &self,
        subs: &[(ShardId, Command)],
        responses: &[StoreResponse],
        broadcast: bool,
    ) -> Result<()> {
        if self.mode == DispatchMode::Replay {
            return Ok(());
        }

        let table = command_table();
        let applied: HashMap<usize, &Command> = responses
            .iter()
            .filter(|r| r.result.is_ok())
            .filter_map(|r| subs.get(r.seq_id).map(|(_, c)| (r.seq_id, c)))
            .filter(|(_, c)| table.is_mutating(&c.name))
            .collect();

        if broadcast {
            if let Some(command) = applied.values().next() {
                self.log(command)?;
                self.shared.watch.on_mutation(MutationEvent {
                    key: None,
                    command: command.name.clone(),
                });
            }
            return Ok(());
        }

        let mut seq_ids: Vec<usize> = applied.keys().copied().collect();
        seq_ids.sort_unstable();
        for seq_id in seq_ids {
            let command = applied[&seq_id];
            self.log(command)?;
            self.shared.watch.on_mutation(MutationEvent {
                key: Some(command.routing_key().to_string()),
                command: command.name.clone(),
            });
        }
        Ok(())
    }

    fn log(&self, command: &Command) -> Result<()> {
        self.shared.wal.log_command(command).map_err(|e| {
            tracing::error!("Failed to log '{}': {}", command.name, e);
            match e {
                KvError::WalWrite(_) => e,
                other => KvError::WalWrite(other.to_string()),
            }
        })
    }
}

fn plan_of(meta: &CmdMeta) -> Result<&dyn ShardPlan> {
    meta.plan
        .as_deref()
        .ok_or_else(|| KvError::Internal(format!("{} has no shard plan", meta.name)))
}

/// `GET.WATCH k [uuid]` → (`GET k`, label)
pub fn split_watch(command: &Command) -> (Command, Option<String>) {
    let name = command
        .name
        .strip_suffix(WATCH_SUFFIX)
        .unwrap_or(&command.name)
        .to_string();
    let mut args = command.args.clone();
    let label = match args.last() {
        Some(last) if uuid::Uuid::parse_str(last).is_ok() => args.pop(),
        _ => None,
    };
    (Command { name, args }, label)
}

fn into_response(result: Result<Value>) -> Response {
    match result {
        Ok(value) => Response::Reply(value),
        Err(e) => Response::error(e.to_string()),
    }
}
