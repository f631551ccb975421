//! Tests for engine startup, recovery and shutdown
//!
//! These tests verify:
//! - State written through the engine survives a restart on every durable backend
//! - Only applied writes are replayed
//! - Replay does not re-log what it applies
//! - Corrupt logs stop startup
//! - Bad configuration is rejected before anything starts

use std::fs;
use std::time::Duration;

use shardkv::config::{Config, ReplayPolicy, WalMode};
use shardkv::error::KvError;
use shardkv::protocol::{Command, Value};
use shardkv::wal::{list_segments, HEADER_SIZE};
use shardkv::Engine;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn config(dir: &TempDir, mode: WalMode) -> Config {
    Config::builder()
        .data_dir(dir.path())
        .num_shards(4)
        .wal_mode(mode)
        .wal_buffer_sync_interval(Duration::from_millis(50))
        .build()
}

fn exec<const N: usize>(engine: &Engine, name: &str, args: [&str; N]) -> shardkv::Result<Value> {
    let mut dispatcher = engine.dispatcher();
    dispatcher.execute(&engine.context(), Command::new(name, args))
}

fn write_workload(engine: &Engine) {
    exec(engine, "MSET", ["a", "1", "b", "2", "c", "3"]).unwrap();
    exec(engine, "SADD", ["team", "ann", "bob"]).unwrap();
    exec(engine, "ZADD", ["board", "10", "ann", "20", "bob"]).unwrap();
    exec(engine, "INCR", ["a"]).unwrap();
    exec(engine, "DEL", ["b"]).unwrap();
    exec(engine, "RENAME", ["c", "d"]).unwrap();
    // Fails: nothing to replay
    exec(engine, "INCR", ["team"]).unwrap_err();
}

fn assert_workload(engine: &Engine) {
    assert_eq!(exec(engine, "GET", ["a"]).unwrap(), Value::str("2"));
    assert!(exec(engine, "GET", ["b"]).unwrap().is_nil());
    assert!(exec(engine, "GET", ["c"]).unwrap().is_nil());
    assert_eq!(exec(engine, "GET", ["d"]).unwrap(), Value::str("3"));
    assert_eq!(exec(engine, "SCARD", ["team"]).unwrap(), Value::Int(2));
    assert_eq!(
        exec(engine, "ZRANGE", ["board", "0", "-1"]).unwrap(),
        Value::Array(vec![Value::str("ann"), Value::str("bob")])
    );
    assert_eq!(exec(engine, "DBSIZE", []).unwrap(), Value::Int(4));
}

// =============================================================================
// Recovery Tests
// =============================================================================

#[test]
fn test_segmented_wal_survives_restart() {
    let dir = TempDir::new().unwrap();

    let engine = Engine::open(config(&dir, WalMode::Segmented)).unwrap();
    assert_eq!(engine.replay_stats().entries_replayed, 0);
    write_workload(&engine);
    engine.shutdown().unwrap();
    drop(engine);

    let engine = Engine::open(config(&dir, WalMode::Segmented)).unwrap();
    // MSET(3) + SADD + ZADD + INCR + DEL + RENAME(DEL, SET)
    assert_eq!(engine.replay_stats().entries_replayed, 9);
    assert_workload(&engine);
}

#[test]
fn test_sqlite_wal_survives_restart() {
    let dir = TempDir::new().unwrap();

    let engine = Engine::open(config(&dir, WalMode::Sqlite)).unwrap();
    write_workload(&engine);
    engine.shutdown().unwrap();
    drop(engine);

    let engine = Engine::open(config(&dir, WalMode::Sqlite)).unwrap();
    assert_eq!(engine.replay_stats().entries_replayed, 9);
    assert_workload(&engine);
}

#[test]
fn test_null_wal_forgets_everything() {
    let dir = TempDir::new().unwrap();

    let engine = Engine::open(config(&dir, WalMode::Null)).unwrap();
    write_workload(&engine);
    drop(engine);

    let engine = Engine::open(config(&dir, WalMode::Null)).unwrap();
    assert_eq!(exec(&engine, "DBSIZE", []).unwrap(), Value::Int(0));
}

#[test]
fn test_flushdb_replays_once() {
    let dir = TempDir::new().unwrap();

    let engine = Engine::open(config(&dir, WalMode::Segmented)).unwrap();
    exec(&engine, "MSET", ["a", "1", "b", "2"]).unwrap();
    exec(&engine, "FLUSHDB", []).unwrap();
    exec(&engine, "SET", ["c", "3"]).unwrap();
    drop(engine);

    let engine = Engine::open(config(&dir, WalMode::Segmented)).unwrap();
    assert_eq!(engine.replay_stats().entries_replayed, 4);
    assert_eq!(exec(&engine, "DBSIZE", []).unwrap(), Value::Int(1));
    assert_eq!(exec(&engine, "GET", ["c"]).unwrap(), Value::str("3"));
}

#[test]
fn test_replay_does_not_relog() {
    let dir = TempDir::new().unwrap();

    let engine = Engine::open(config(&dir, WalMode::Segmented)).unwrap();
    exec(&engine, "SET", ["k", "v"]).unwrap();
    drop(engine);

    // Every restart replays the same single command
    for _ in 0..3 {
        let engine = Engine::open(config(&dir, WalMode::Segmented)).unwrap();
        assert_eq!(engine.replay_stats().entries_replayed, 1);
        assert_eq!(engine.replay_stats().last_lsn, 1);
    }
}

#[test]
fn test_lsn_continues_across_restarts() {
    let dir = TempDir::new().unwrap();

    for i in 0..3 {
        let engine = Engine::open(config(&dir, WalMode::Segmented)).unwrap();
        exec(&engine, "INCR", ["n"]).unwrap();
        assert_eq!(engine.replay_stats().last_lsn, i);
    }

    let engine = Engine::open(config(&dir, WalMode::Segmented)).unwrap();
    assert_eq!(exec(&engine, "GET", ["n"]).unwrap(), Value::str("3"));
}

#[test]
fn test_expired_keys_replay_with_fresh_ttl() {
    let dir = TempDir::new().unwrap();

    let engine = Engine::open(config(&dir, WalMode::Segmented)).unwrap();
    exec(&engine, "SET", ["session", "x", "EX", "100"]).unwrap();
    drop(engine);

    let engine = Engine::open(config(&dir, WalMode::Segmented)).unwrap();
    let ttl = exec(&engine, "TTL", ["session"]).unwrap().as_int().unwrap();
    assert!(ttl > 0 && ttl <= 100);
}

// =============================================================================
// Startup Failure Tests
// =============================================================================

#[test]
fn test_corrupt_wal_stops_startup() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir, WalMode::Segmented);

    let engine = Engine::open(cfg.clone()).unwrap();
    exec(&engine, "SET", ["k", "v"]).unwrap();
    drop(engine);

    let (_, path) = list_segments(&cfg.wal_dir()).unwrap().remove(0);
    let mut bytes = fs::read(&path).unwrap();
    bytes[HEADER_SIZE] ^= 0xFF;
    fs::write(&path, bytes).unwrap();

    let err = Engine::open(cfg).err().expect("startup should fail");
    assert!(matches!(err, KvError::WalCorruption(_)), "{:?}", err);
}

#[test]
fn test_torn_tail_recovers_under_policy() {
    let dir = TempDir::new().unwrap();
    let cfg = Config::builder()
        .data_dir(dir.path())
        .num_shards(2)
        .wal_mode(WalMode::Segmented)
        .wal_replay_policy(ReplayPolicy::TruncateTorn)
        .build();

    let engine = Engine::open(cfg.clone()).unwrap();
    exec(&engine, "SET", ["a", "1"]).unwrap();
    exec(&engine, "SET", ["b", "2"]).unwrap();
    drop(engine);

    let (_, path) = list_segments(&cfg.wal_dir()).unwrap().remove(0);
    let len = fs::metadata(&path).unwrap().len();
    fs::OpenOptions::new()
        .write(true)
        .open(&path)
        .unwrap()
        .set_len(len - 2)
        .unwrap();

    let engine = Engine::open(cfg).unwrap();
    assert!(engine.replay_stats().was_truncated);
    assert_eq!(exec(&engine, "GET", ["a"]).unwrap(), Value::str("1"));
    assert!(exec(&engine, "GET", ["b"]).unwrap().is_nil());
}

#[test]
fn test_invalid_config_is_rejected() {
    let dir = TempDir::new().unwrap();
    let cfg = Config::builder()
        .data_dir(dir.path())
        .num_shards(0)
        .build();
    assert!(matches!(Engine::open(cfg), Err(KvError::Config(_))));
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_commands_fail_after_shutdown() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::open(config(&dir, WalMode::Null)).unwrap();
    let ctx = engine.context();
    let mut dispatcher = engine.dispatcher();

    engine.shutdown().unwrap();
    assert!(dispatcher.execute(&ctx, Command::new("GET", ["k"])).is_err());
}
