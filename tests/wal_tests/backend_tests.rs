//! Tests for the SQLite and null WAL backends

use rusqlite::Connection;
use shardkv::config::{Config, WalMode};
use shardkv::error::KvError;
use shardkv::protocol::Command;
use shardkv::wal::{open_wal, NullWal, SqliteWal, Wal};
use tempfile::TempDir;

use super::{collect, set_commands};

fn open_sqlite(temp: &TempDir) -> SqliteWal {
    let wal = SqliteWal::new(temp.path().join(SqliteWal::FILENAME));
    wal.init().unwrap();
    wal
}

// =============================================================================
// SQLite Tests
// =============================================================================

#[test]
fn test_sqlite_log_and_replay() {
    let temp = TempDir::new().unwrap();
    let commands = set_commands(0..20);

    let wal = open_sqlite(&temp);
    for cmd in &commands {
        wal.log_command(cmd).unwrap();
    }
    assert_eq!(wal.last_lsn(), 20);
    wal.close().unwrap();

    let wal = open_sqlite(&temp);
    assert_eq!(wal.last_lsn(), 20);
    assert_eq!(collect(&wal).unwrap(), commands);

    wal.log_command(&Command::new("DEL", ["key0"])).unwrap();
    assert_eq!(wal.last_lsn(), 21);
}

#[test]
fn test_sqlite_checksum_mismatch_is_fatal() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join(SqliteWal::FILENAME);

    let wal = open_sqlite(&temp);
    for cmd in set_commands(0..3) {
        wal.log_command(&cmd).unwrap();
    }
    wal.close().unwrap();

    let conn = Connection::open(&path).unwrap();
    conn.execute("UPDATE wal_entries SET checksum = checksum + 1 WHERE lsn = 2", [])
        .unwrap();
    drop(conn);

    let wal = open_sqlite(&temp);
    let err = collect(&wal).unwrap_err();
    assert!(matches!(err, KvError::WalCorruption(_)), "{:?}", err);
}

#[test]
fn test_sqlite_log_before_init_fails() {
    let temp = TempDir::new().unwrap();
    let wal = SqliteWal::new(temp.path().join(SqliteWal::FILENAME));
    let err = wal.log_command(&Command::new("SET", ["k", "v"])).unwrap_err();
    assert!(matches!(err, KvError::WalWrite(_)));
}

// =============================================================================
// Null Tests
// =============================================================================

#[test]
fn test_null_wal_keeps_nothing() {
    let wal = NullWal;
    wal.init().unwrap();
    wal.log_command(&Command::new("SET", ["k", "v"])).unwrap();

    let stats = wal
        .replay_command(&mut |_| Err(KvError::Internal("nothing to replay".into())))
        .unwrap();
    assert_eq!(stats.entries_replayed, 0);
    wal.close().unwrap();
}

// =============================================================================
// Selection Tests
// =============================================================================

#[test]
fn test_open_wal_selects_sqlite_file() {
    let temp = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp.path())
        .wal_mode(WalMode::Sqlite)
        .build();

    let wal = open_wal(&config);
    wal.init().unwrap();
    wal.log_command(&Command::new("SET", ["k", "v"])).unwrap();
    wal.close().unwrap();

    assert!(temp.path().join(SqliteWal::FILENAME).exists());
}

#[test]
fn test_open_wal_segmented_uses_wal_dir() {
    let temp = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp.path())
        .wal_mode(WalMode::Segmented)
        .build();

    let wal = open_wal(&config);
    wal.init().unwrap();
    wal.close().unwrap();

    assert!(config.wal_dir().join("seg-1.wal").exists());
}
