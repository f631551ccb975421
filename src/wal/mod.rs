//! Write-Ahead Log (WAL) Module
//!
//! Provides durability through an append-only command log.
//!
//! ## Responsibilities
//! - Append every applied mutating command as a checksummed record
//! - CRC32 checksums for corruption detection
//! - Log Sequence Numbers (LSN) for ordering
//! - Segment rotation by size or time
//! - Ordered replay on startup
//!
//! ## Record Format
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ Record 1                                │
//! │ ┌─────────┬─────────┬─────────────────┐ │
//! │ │ CRC (4) │ Len (4) │ Entry (bincode) │ │
//! │ └─────────┴─────────┴─────────────────┘ │
//! ├─────────────────────────────────────────┤
//! │ Record 2 ...                            │
//! └─────────────────────────────────────────┘
//! ```
//! The CRC covers the entry bytes. An entry wraps `{lsn, timestamp, payload}`
//! where the payload is the serialized command.
//!
//! ## Backends
//! All variants satisfy [`Wal`]; callers never know which one is active.
//! - [`SegmentedWal`]: numbered `seg-<index>.wal` files
//! - [`SqliteWal`]: rows in a SQLite table
//! - [`NullWal`]: logging disabled

mod entry;
mod null;
mod reader;
mod recovery;
mod segment;
mod sqlite;
mod writer;

use std::sync::Arc;

use crate::config::{Config, WalMode};
use crate::error::Result;
use crate::protocol::Command;

pub use entry::{WalEntry, HEADER_SIZE};
pub use null::NullWal;
pub use reader::{ReadFault, SegmentReader};
pub use recovery::{replay_segments, ReplayStats};
pub use segment::{list_segments, segment_path};
pub use sqlite::SqliteWal;
pub use writer::SegmentedWal;

/// Durable command log
pub trait Wal: Send + Sync {
    /// Create or open the log's storage and start background work
    fn init(&self) -> Result<()>;

    /// Append one command
    fn log_command(&self, command: &Command) -> Result<()>;

    /// Flush, sync and close. Safe to call more than once.
    fn close(&self) -> Result<()>;

    /// Feed every logged command to `callback`, oldest first.
    ///
    /// Structural damage aborts replay with `KvError::WalCorruption`.
    fn replay_command(&self, callback: &mut dyn FnMut(Command) -> Result<()>) -> Result<ReplayStats>;
}

/// Build the backend selected by `config.wal.mode`
pub fn open_wal(config: &Config) -> Arc<dyn Wal> {
    match config.wal.mode {
        WalMode::Null => Arc::new(NullWal),
        WalMode::Segmented => Arc::new(SegmentedWal::new(config.wal_dir(), config.wal.clone())),
        WalMode::Sqlite => Arc::new(SqliteWal::new(config.data_dir.join(SqliteWal::FILENAME))),
    }
}

/// Current unix time in milliseconds
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
