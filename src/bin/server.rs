//! ShardKV Server Binary
//!
//! Starts the TCP server for ShardKV.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use shardkv::config::{ReplayPolicy, WalMode};
use shardkv::network::Server;
use shardkv::{Config, Engine};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum WalArg {
    Null,
    Segmented,
    Sqlite,
}

impl From<WalArg> for WalMode {
    fn from(arg: WalArg) -> Self {
        match arg {
            WalArg::Null => WalMode::Null,
            WalArg::Segmented => WalMode::Segmented,
            WalArg::Sqlite => WalMode::Sqlite,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ReplayArg {
    Strict,
    TruncateTorn,
}

impl From<ReplayArg> for ReplayPolicy {
    fn from(arg: ReplayArg) -> Self {
        match arg {
            ReplayArg::Strict => ReplayPolicy::Strict,
            ReplayArg::TruncateTorn => ReplayPolicy::TruncateTorn,
        }
    }
}

/// ShardKV Server
#[derive(Parser, Debug)]
#[command(name = "shardkv-server")]
#[command(about = "In-memory multi-shard key-value server")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./shardkv_data")]
    data_dir: String,

    /// Listen address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:7379")]
    listen: String,

    /// Maximum concurrent connections
    #[arg(short, long, default_value = "1024")]
    max_connections: usize,

    /// Number of shards (defaults to available parallelism)
    #[arg(short = 'n', long)]
    shards: Option<usize>,

    /// Per-request timeout in milliseconds
    #[arg(long, default_value = "6000")]
    request_timeout_ms: u64,

    /// WAL backend
    #[arg(long, value_enum, default_value = "segmented")]
    wal: WalArg,

    /// Max WAL segment size in MB
    #[arg(long, default_value = "16")]
    segment_mb: u64,

    /// Rotate WAL segments every N seconds as well as by size
    #[arg(long)]
    rotation_secs: Option<u64>,

    /// Flush and fsync the WAL buffer every N milliseconds
    #[arg(long, default_value = "1000")]
    sync_ms: u64,

    /// What replay does with a torn final record
    #[arg(long, value_enum, default_value = "strict")]
    replay_policy: ReplayArg,

    /// Require AUTH with this password (user "default")
    #[arg(long)]
    requirepass: Option<String>,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,shardkv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("ShardKV Server v{}", shardkv::VERSION);
    tracing::info!("Data directory: {}", args.data_dir);
    tracing::info!("Listen address: {}", args.listen);

    // Build config from args
    let mut builder = Config::builder()
        .data_dir(&args.data_dir)
        .listen_addr(&args.listen)
        .max_connections(args.max_connections)
        .request_timeout(Duration::from_millis(args.request_timeout_ms))
        .wal_mode(args.wal.into())
        .wal_max_segment_size(args.segment_mb * 1024 * 1024)
        .wal_rotation_interval(args.rotation_secs.map(Duration::from_secs))
        .wal_buffer_sync_interval(Duration::from_millis(args.sync_ms))
        .wal_replay_policy(args.replay_policy.into());
    if let Some(shards) = args.shards {
        builder = builder.num_shards(shards);
    }
    if let Some(pass) = &args.requirepass {
        builder = builder.require_pass("default", pass);
    }
    let config = builder.build();

    // Open engine (replays the WAL)
    let engine = match Engine::open(config.clone()) {
        Ok(e) => Arc::new(e),
        Err(e) => {
            tracing::error!("Failed to open engine: {}", e);
            std::process::exit(1);
        }
    };

    // Ctrl+C cancels the engine, which stops the accept loop
    let token = engine.token().clone();
    if let Err(e) = ctrlc::set_handler(move || {
        tracing::info!("Received Ctrl+C, initiating shutdown...");
        token.cancel();
    }) {
        tracing::warn!("Failed to install Ctrl+C handler: {}", e);
    }

    let server = Server::new(config, Arc::clone(&engine));
    let served = server.run();

    if let Err(e) = engine.shutdown() {
        tracing::error!("Engine shutdown failed: {}", e);
    }
    if let Err(e) = served {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }

    tracing::info!("Server stopped");
}
