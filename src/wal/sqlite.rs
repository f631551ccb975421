//! SQLite WAL
//!
//! Stores each record as a row keyed by LSN. The row carries the same
//! CRC32 as a file record so replay detects damaged payloads the same way.

use std::path::PathBuf;

use parking_lot::Mutex;
use rusqlite::{params, Connection};

use super::entry::compute_crc;
use super::{now_millis, ReplayStats, Wal};
use crate::error::{KvError, Result};
use crate::protocol::Command;

struct SqliteState {
    conn: Option<Connection>,
    last_lsn: u64,
}

pub struct SqliteWal {
    path: PathBuf,
    state: Mutex<SqliteState>,
}

impl SqliteWal {
    pub const FILENAME: &'static str = "wal.sqlite";

    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: Mutex::new(SqliteState {
                conn: None,
                last_lsn: 0,
            }),
        }
    }

    pub fn last_lsn(&self) -> u64 {
        self.state.lock().last_lsn
    }
}

impl Wal for SqliteWal {
    fn init(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.conn.is_some() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&self.path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS wal_entries (
                lsn INTEGER PRIMARY KEY,
                timestamp INTEGER NOT NULL,
                checksum INTEGER NOT NULL,
                payload BLOB NOT NULL
            )",
            [],
        )?;
        let max: Option<i64> =
            conn.query_row("SELECT MAX(lsn) FROM wal_entries", [], |row| row.get(0))?;

        state.last_lsn = max.unwrap_or(0) as u64;
        state.conn = Some(conn);
        tracing::debug!("SQLite WAL opened at {}", self.path.display());
        Ok(())
    }

    fn log_command(&self, command: &Command) -> Result<()> {
        let payload = bincode::serialize(command)?;
        let checksum = compute_crc(&payload);

        let mut state = self.state.lock();
        let lsn = state.last_lsn + 1;
        let conn = state
            .conn
            .as_ref()
            .ok_or_else(|| KvError::WalWrite("WAL is not open".into()))?;
        conn.execute(
            "INSERT INTO wal_entries (lsn, timestamp, checksum, payload) VALUES (?1, ?2, ?3, ?4)",
            params![lsn as i64, now_millis() as i64, checksum as i64, payload],
        )?;
        state.last_lsn = lsn;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(conn) = state.conn.take() {
            conn.close().map_err(|(_, e)| KvError::Sqlite(e))?;
        }
        Ok(())
    }

    fn replay_command(&self, callback: &mut dyn FnMut(Command) -> Result<()>) -> Result<ReplayStats> {
        let state = self.state.lock();
        let conn = state
            .conn
            .as_ref()
            .ok_or_else(|| KvError::WalWrite("WAL is not open".into()))?;

        let mut stmt = conn.prepare("SELECT lsn, checksum, payload FROM wal_entries ORDER BY lsn")?;
        let mut rows = stmt.query([])?;
        let mut stats = ReplayStats {
            segments: 1,
            ..ReplayStats::default()
        };

        while let Some(row) = rows.next()? {
            let lsn: i64 = row.get(0)?;
            let checksum: i64 = row.get(1)?;
            let payload: Vec<u8> = row.get(2)?;

            if compute_crc(&payload) as i64 != checksum {
                return Err(KvError::WalCorruption(format!("lsn {}: checksum mismatch", lsn)));
            }
            let command: Command = bincode::deserialize(&payload).map_err(|e| {
                KvError::WalCorruption(format!("lsn {}: undecodable command: {}", lsn, e))
            })?;
            callback(command)?;
            stats.entries_replayed += 1;
            stats.last_lsn = lsn as u64;
        }

        tracing::info!(
            "SQLite WAL replay: {} commands, last_lsn={}",
            stats.entries_replayed,
            stats.last_lsn
        );
        Ok(stats)
    }
}
