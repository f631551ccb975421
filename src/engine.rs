//! Engine Module
//!
//! Wires every component together and owns their lifetimes.
//!
//! ## Responsibilities
//! - Validate configuration and the command table before serving anything
//! - Start shard workers and the watch manager
//! - Open the configured WAL backend and replay it
//! - Hand out per-connection dispatchers
//! - Supervise fatal signals and shut everything down in order

use std::fs;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver};
use parking_lot::Mutex;

use crate::config::Config;
use crate::context::{CancelToken, Context};
use crate::dispatch::{command_table, DispatchMode, DispatchShared, Dispatcher};
use crate::error::Result;
use crate::shard::{FatalSignal, ShardManager};
use crate::store::{mem_store_factory, StoreFactory};
use crate::wal::{open_wal, ReplayStats, Wal};
use crate::watch::WatchManager;

/// The running server core
///
/// ## Startup order
/// 1. Validate config and command table
/// 2. Start shard workers and the watch manager
/// 3. Open and initialise the WAL
/// 4. Replay the WAL through a replay-mode dispatcher
/// 5. Start the supervisor
///
/// ## Shutdown order
/// Cancel the root token, join shards, watch manager and supervisor, then
/// close the WAL.
pub struct Engine {
    config: Config,

    /// Cancelled on shutdown or ABORT; every background loop watches it
    root: CancelToken,

    shards: Arc<ShardManager>,
    watch: Arc<WatchManager>,
    wal: Arc<dyn Wal>,

    /// Cloned into every dispatcher
    shared: DispatchShared,

    /// Replay runs as client 0
    client_ids: AtomicU64,

    replay_stats: ReplayStats,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Engine {
    /// Open an engine backed by in-memory stores
    pub fn open(config: Config) -> Result<Self> {
        Self::open_with_stores(config, mem_store_factory())
    }

    /// Open an engine whose shards use stores built by `stores`
    pub fn open_with_stores(config: Config, stores: StoreFactory) -> Result<Self> {
        // Step 1: Refuse to start on a bad config or command table
        config.validate()?;
        command_table().validate()?;
        fs::create_dir_all(&config.data_dir)?;

        // Step 2: Shards and watch manager
        let root = CancelToken::new();
        let (global_tx, global_rx) = channel::unbounded();
        let shards = Arc::new(ShardManager::new(
            config.num_shards,
            config.shard_queue_capacity,
            config.expiry_sweep_interval,
            global_tx.clone(),
            &stores,
        ));
        shards.start(&Context::background(root.clone()))?;

        let watch = match WatchManager::start(root.clone()) {
            Ok(watch) => Arc::new(watch),
            Err(e) => {
                root.cancel();
                shards.join();
                return Err(e);
            }
        };

        // Step 3: WAL
        let wal = open_wal(&config);
        let shared = DispatchShared {
            shards: Arc::clone(&shards),
            wal: Arc::clone(&wal),
            watch: Arc::clone(&watch),
            global_errors: global_tx,
            request_ids: Arc::new(AtomicU64::new(0)),
            request_timeout: config.request_timeout,
            require_pass: config.require_pass.clone(),
        };

        // Step 4: Rebuild state before the first client arrives
        let recovered = wal.init().and_then(|_| {
            let mut replayer = Dispatcher::new(shared.clone(), 0, DispatchMode::Replay);
            replayer.replay(&Context::background(root.clone()))
        });
        let replay_stats = match recovered {
            Ok(stats) => stats,
            Err(e) => {
                tracing::error!("Engine startup failed: {}", e);
                root.cancel();
                shards.join();
                watch.join();
                if let Err(close_err) = wal.close() {
                    tracing::error!("Failed to close WAL: {}", close_err);
                }
                return Err(e);
            }
        };

        // Step 5: Supervisor
        let supervisor = {
            let root = root.clone();
            thread::Builder::new()
                .name("supervisor".into())
                .spawn(move || supervise(global_rx, root))?
        };

        tracing::info!(
            "Engine ready: {} shards, {:?} WAL, {} commands replayed",
            config.num_shards,
            config.wal.mode,
            replay_stats.entries_replayed
        );

        Ok(Self {
            config,
            root,
            shards,
            watch,
            wal,
            shared,
            client_ids: AtomicU64::new(0),
            replay_stats,
            supervisor: Mutex::new(Some(supervisor)),
            closed: AtomicBool::new(false),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// New dispatcher for one client connection
    pub fn dispatcher(&self) -> Dispatcher {
        let client_id = self.client_ids.fetch_add(1, Ordering::Relaxed) + 1;
        Dispatcher::new(self.shared.clone(), client_id, DispatchMode::Client)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Root cancellation token
    pub fn token(&self) -> &CancelToken {
        &self.root
    }

    /// Context with no deadline, cancelled with the engine
    pub fn context(&self) -> Context {
        Context::background(self.root.clone())
    }

    pub fn shards(&self) -> &ShardManager {
        &self.shards
    }

    pub fn watch(&self) -> &WatchManager {
        &self.watch
    }

    /// What startup replay found
    pub fn replay_stats(&self) -> ReplayStats {
        self.replay_stats
    }

    pub fn is_running(&self) -> bool {
        !self.root.is_cancelled()
    }

    /// Block until the engine is cancelled
    pub fn wait(&self) {
        let _ = self.root.done().recv();
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stop every component and close the WAL. Later calls are no-ops.
    pub fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!("Engine shutting down");

        self.root.cancel();
        self.shards.join();
        self.watch.join();
        if let Some(handle) = self.supervisor.lock().take() {
            if handle.join().is_err() {
                tracing::error!("Supervisor thread panicked");
            }
        }
        self.wal.close()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!("Engine shutdown failed: {}", e);
        }
    }
}

/// Consume fatal signals until the root token is cancelled.
/// ABORT cancels the root token; shard failures are logged.
fn supervise(signals: Receiver<FatalSignal>, root: CancelToken) {
    let done = root.done().clone();
    loop {
        crossbeam::select! {
            recv(signals) -> signal => match signal {
                Ok(FatalSignal::Shard { shard_id, request_id, message }) => {
                    tracing::error!(
                        "Shard {} fatal while serving request {}: {}",
                        shard_id,
                        request_id,
                        message
                    );
                }
                Ok(FatalSignal::Abort) => {
                    tracing::warn!("Abort requested, shutting down");
                    root.cancel();
                    break;
                }
                Err(_) => break,
            },
            recv(done) -> _ => break,
        }
    }
}
