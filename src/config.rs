//! Configuration for ShardKV
//!
//! Centralized configuration with sensible defaults. Core components never
//! read this directly from global state; the engine hands the relevant
//! pieces to each component's constructor.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{KvError, Result};

/// Main configuration for a ShardKV instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all data files
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── wal/             (segment files, seg-<index>.wal)
    ///     └── wal.sqlite       (SQLite WAL variant)
    pub data_dir: PathBuf,

    /// WAL settings
    pub wal: WalConfig,

    // -------------------------------------------------------------------------
    // Shard Configuration
    // -------------------------------------------------------------------------
    /// Number of shard workers. Fixed for the lifetime of the process.
    pub num_shards: usize,

    /// Capacity of each shard's request queue
    pub shard_queue_capacity: usize,

    /// How often each shard sweeps expired keys
    pub expiry_sweep_interval: Duration,

    /// Deadline applied to every dispatched request
    pub request_timeout: Duration,

    // -------------------------------------------------------------------------
    // Network Configuration
    // -------------------------------------------------------------------------
    /// TCP listen address
    pub listen_addr: String,

    /// Max concurrent client connections
    pub max_connections: usize,

    /// Connection read timeout (milliseconds, 0 = none)
    pub read_timeout_ms: u64,

    /// Connection write timeout (milliseconds, 0 = none)
    pub write_timeout_ms: u64,

    /// Credentials required by AUTH. `None` disables authentication.
    pub require_pass: Option<(String, String)>,
}

/// WAL backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalMode {
    /// Logging disabled
    Null,

    /// Append-only segment files with CRC framed records
    Segmented,

    /// Records stored in a SQLite table
    Sqlite,
}

/// What replay does when it meets a damaged record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayPolicy {
    /// Any structural error halts replay
    Strict,

    /// An incomplete record at the very end of the newest segment is cut off
    /// with a warning. CRC mismatches still halt replay.
    TruncateTorn,
}

/// WAL configuration
#[derive(Debug, Clone)]
pub struct WalConfig {
    pub mode: WalMode,

    /// Rotate once the next record would push a segment past this many bytes
    pub max_segment_size: u64,

    /// Rotate on a timer as well as by size
    pub rotation_interval: Option<Duration>,

    /// Flush + fsync the buffered writer this often
    pub buffer_sync_interval: Duration,

    /// Size of the in-memory write buffer in front of the segment file
    pub buffer_size: usize,

    pub replay_policy: ReplayPolicy,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            mode: WalMode::Segmented,
            max_segment_size: 16 * 1024 * 1024, // 16 MB
            rotation_interval: None,
            buffer_sync_interval: Duration::from_secs(1),
            buffer_size: 1024 * 1024, // 1 MB
            replay_policy: ReplayPolicy::Strict,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let num_shards = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            data_dir: PathBuf::from("./shardkv_data"),
            wal: WalConfig::default(),
            num_shards,
            shard_queue_capacity: 1024,
            expiry_sweep_interval: Duration::from_millis(100),
            request_timeout: Duration::from_secs(6),
            listen_addr: "127.0.0.1:7379".to_string(),
            max_connections: 1024,
            read_timeout_ms: 0,
            write_timeout_ms: 5000,
            require_pass: None,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Directory holding WAL segment files
    pub fn wal_dir(&self) -> PathBuf {
        self.data_dir.join("wal")
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.num_shards == 0 {
            return Err(KvError::Config("num_shards must be at least 1".into()));
        }
        if self.shard_queue_capacity == 0 {
            return Err(KvError::Config("shard_queue_capacity must be at least 1".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(KvError::Config("request_timeout must be non-zero".into()));
        }
        if self.expiry_sweep_interval.is_zero() {
            return Err(KvError::Config("expiry_sweep_interval must be non-zero".into()));
        }
        if self.wal.mode != WalMode::Null {
            if self.wal.max_segment_size == 0 {
                return Err(KvError::Config("max_segment_size must be non-zero".into()));
            }
            if self.wal.buffer_sync_interval.is_zero() {
                return Err(KvError::Config("buffer_sync_interval must be non-zero".into()));
            }
            if matches!(self.wal.rotation_interval, Some(d) if d.is_zero()) {
                return Err(KvError::Config("rotation_interval must be non-zero".into()));
            }
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all storage)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the number of shards
    pub fn num_shards(mut self, count: usize) -> Self {
        self.config.num_shards = count;
        self
    }

    /// Set each shard's request queue capacity
    pub fn shard_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.shard_queue_capacity = capacity;
        self
    }

    /// Set the expiry sweep interval
    pub fn expiry_sweep_interval(mut self, interval: Duration) -> Self {
        self.config.expiry_sweep_interval = interval;
        self
    }

    /// Set the per-request deadline
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set the WAL backend
    pub fn wal_mode(mut self, mode: WalMode) -> Self {
        self.config.wal.mode = mode;
        self
    }

    /// Set the maximum WAL segment size (in bytes)
    pub fn wal_max_segment_size(mut self, size: u64) -> Self {
        self.config.wal.max_segment_size = size;
        self
    }

    /// Set the timed WAL rotation interval
    pub fn wal_rotation_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.wal.rotation_interval = interval;
        self
    }

    /// Set the WAL buffer sync interval
    pub fn wal_buffer_sync_interval(mut self, interval: Duration) -> Self {
        self.config.wal.buffer_sync_interval = interval;
        self
    }

    /// Set the WAL replay policy
    pub fn wal_replay_policy(mut self, policy: ReplayPolicy) -> Self {
        self.config.wal.replay_policy = policy;
        self
    }

    /// Set the TCP listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    /// Set the maximum number of concurrent connections
    pub fn max_connections(mut self, count: usize) -> Self {
        self.config.max_connections = count;
        self
    }

    /// Set the read timeout (in milliseconds)
    pub fn read_timeout_ms(mut self, ms: u64) -> Self {
        self.config.read_timeout_ms = ms;
        self
    }

    /// Set the write timeout (in milliseconds)
    pub fn write_timeout_ms(mut self, ms: u64) -> Self {
        self.config.write_timeout_ms = ms;
        self
    }

    /// Require AUTH with the given credentials
    pub fn require_pass(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.config.require_pass = Some((user.into(), pass.into()));
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
