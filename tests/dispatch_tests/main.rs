//! Tests for command dispatch
//!
//! These tests verify:
//! - Global commands are answered without touching a shard
//! - Multi-shard commands decompose, scatter and compose correctly
//! - Preprocessing commands (RENAME, COPY) and their fallbacks
//! - All-shard commands (DBSIZE, KEYS, FLUSHDB)
//! - Authentication gating
//! - Which sub-commands reach the WAL, and in what order

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel;
use parking_lot::Mutex;
use shardkv::config::{Config, WalMode};
use shardkv::context::{CancelToken, Context};
use shardkv::dispatch::{DispatchMode, DispatchShared, Dispatcher};
use shardkv::error::{CommandError, KvError};
use shardkv::protocol::{Command, Response, Value};
use shardkv::shard::ShardManager;
use shardkv::store::{MemStore, Store, StoreError, StoreFactory, StoreResult};
use shardkv::wal::{ReplayStats, Wal};
use shardkv::watch::WatchManager;
use shardkv::Engine;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn config(dir: &TempDir) -> Config {
    Config::builder()
        .data_dir(dir.path())
        .num_shards(4)
        .wal_mode(WalMode::Null)
        .request_timeout(Duration::from_millis(500))
        .build()
}

struct Fixture {
    _dir: TempDir,
    engine: Engine,
    ctx: Context,
    dispatcher: Dispatcher,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        Self::with_config(config(&dir), dir)
    }

    fn with_config(config: Config, dir: TempDir) -> Self {
        let engine = Engine::open_with_stores(config, guarded_factory()).unwrap();
        let ctx = engine.context();
        let dispatcher = engine.dispatcher();
        Self {
            _dir: dir,
            engine,
            ctx,
            dispatcher,
        }
    }

    fn exec<const N: usize>(&mut self, name: &str, args: [&str; N]) -> shardkv::Result<Value> {
        self.dispatcher.execute(&self.ctx, Command::new(name, args))
    }

    fn ok<const N: usize>(&mut self, name: &str, args: [&str; N]) -> Value {
        self.exec(name, args).unwrap()
    }
}

/// A MemStore that refuses `SET` on `locked:*` keys with WRONGTYPE
struct GuardedStore {
    inner: MemStore,
}

impl Store for GuardedStore {
    fn execute(&mut self, command: &Command) -> StoreResult {
        if command.name == "SET" && command.routing_key().starts_with("locked:") {
            return Err(StoreError::Command(CommandError::WrongType));
        }
        self.inner.execute(command)
    }

    fn sweep_expired(&mut self, now: Instant) -> usize {
        self.inner.sweep_expired(now)
    }
}

fn guarded_factory() -> StoreFactory {
    Box::new(|_| Box::new(GuardedStore { inner: MemStore::new() }))
}

fn strs(items: &[&str]) -> Value {
    Value::Array(items.iter().map(|s| Value::str(*s)).collect())
}

fn command_error(result: shardkv::Result<Value>) -> CommandError {
    match result {
        Err(KvError::Command(e)) => e,
        other => panic!("expected command error, got {:?}", other),
    }
}

/// Keeps every logged command in memory
#[derive(Default)]
struct RecordingWal {
    logged: Mutex<Vec<Command>>,
}

impl Wal for RecordingWal {
    fn init(&self) -> shardkv::Result<()> {
        Ok(())
    }

    fn log_command(&self, command: &Command) -> shardkv::Result<()> {
        self.logged.lock().push(command.clone());
        Ok(())
    }

    fn close(&self) -> shardkv::Result<()> {
        Ok(())
    }

    fn replay_command(
        &self,
        callback: &mut dyn FnMut(Command) -> shardkv::Result<()>,
    ) -> shardkv::Result<ReplayStats> {
        let logged = self.logged.lock().clone();
        for command in logged {
            callback(command)?;
        }
        Ok(ReplayStats::default())
    }
}

/// A dispatcher wired by hand around a recording WAL
fn recording_dispatcher(token: &CancelToken, mode: DispatchMode) -> (Dispatcher, Arc<RecordingWal>, Arc<ShardManager>) {
    let (global_tx, _global_rx) = channel::unbounded();
    let shards = Arc::new(ShardManager::new(
        4,
        64,
        Duration::from_millis(100),
        global_tx.clone(),
        &guarded_factory(),
    ));
    shards.start(&Context::background(token.clone())).unwrap();
    let wal = Arc::new(RecordingWal::default());
    let shared = DispatchShared {
        shards: Arc::clone(&shards),
        wal: wal.clone(),
        watch: Arc::new(WatchManager::start(token.clone()).unwrap()),
        global_errors: global_tx,
        request_ids: Arc::new(AtomicU64::new(0)),
        request_timeout: Duration::from_secs(2),
        require_pass: None,
    };
    (Dispatcher::new(shared, 1, mode), wal, shards)
}

// =============================================================================
// Global Command Tests
// =============================================================================

#[test]
fn test_ping_echo_hello() {
    let mut f = Fixture::new();
    assert_eq!(f.ok("PING", []), Value::str("PONG"));
    assert_eq!(f.ok("PING", ["hi"]), Value::str("hi"));
    assert_eq!(f.ok("ECHO", ["hello world"]), Value::str("hello world"));
    assert_eq!(
        command_error(f.exec("ECHO", [])),
        CommandError::WrongArity("echo".into())
    );

    let Value::Array(hello) = f.ok("HELLO", []) else {
        panic!("HELLO should reply with an array");
    };
    assert_eq!(hello[0], Value::str("server"));
    assert_eq!(hello[1], Value::str("shardkv"));
    assert_eq!(hello[7], Value::Int(4));
}

#[test]
fn test_sleep_is_bounded_by_request_timeout() {
    let mut f = Fixture::new();
    let err = f.exec("SLEEP", ["5"]).unwrap_err();
    assert!(matches!(err, KvError::Timeout));
    assert_eq!(f.ok("PING", []), Value::str("PONG"));
}

#[test]
fn test_unknown_command_reaches_store() {
    let mut f = Fixture::new();
    assert_eq!(
        command_error(f.exec("FROB", ["k"])),
        CommandError::UnknownCommand("FROB".into())
    );
    // No arguments: routed by name
    assert_eq!(
        command_error(f.exec("FROB", [])),
        CommandError::UnknownCommand("FROB".into())
    );
}

#[test]
fn test_out_of_range_ttl_leaves_shard_serving() {
    let dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(dir.path())
        .num_shards(1)
        .wal_mode(WalMode::Null)
        .request_timeout(Duration::from_millis(500))
        .build();
    let mut f = Fixture::with_config(config, dir);

    for unit in ["EX", "PX"] {
        assert!(matches!(
            command_error(f.exec("SET", ["k", "v", unit, "9223372036854775807"])),
            CommandError::InvalidArgument(_)
        ));
    }

    // Same shard, still alive
    assert_eq!(f.ok("SET", ["other", "v"]), Value::Ok);
    assert_eq!(f.ok("GET", ["other"]), Value::str("v"));
    assert!(f.ok("GET", ["k"]).is_nil());
}

// =============================================================================
// Multi-Shard Tests
// =============================================================================

#[test]
fn test_mget_preserves_key_order() {
    let mut f = Fixture::new();
    f.ok("MSET", ["a", "1", "b", "2", "c", "3"]);
    f.ok("SADD", ["set", "x"]);

    assert_eq!(
        f.ok("MGET", ["c", "missing", "a", "set", "b"]),
        Value::Array(vec![
            Value::str("3"),
            Value::Nil,
            Value::str("1"),
            Value::Nil,
            Value::str("2"),
        ])
    );
}

#[test]
fn test_mset_rejects_odd_arguments() {
    let mut f = Fixture::new();
    assert_eq!(
        command_error(f.exec("MSET", ["a", "1", "b"])),
        CommandError::WrongArity("mset".into())
    );
    assert!(f.ok("GET", ["a"]).is_nil());
}

#[test]
fn test_mset_partial_failure_keeps_applied_keys() {
    let mut f = Fixture::new();

    let err = command_error(f.exec("MSET", ["k1", "a", "locked:k2", "b", "k3", "c"]));
    assert_eq!(err, CommandError::WrongType);

    // Not atomic across keys
    assert_eq!(f.ok("GET", ["k1"]), Value::str("a"));
    assert!(f.ok("GET", ["locked:k2"]).is_nil());
    assert_eq!(f.ok("GET", ["k3"]), Value::str("c"));
}

#[test]
fn test_per_key_sums() {
    let mut f = Fixture::new();
    f.ok("MSET", ["a", "1", "b", "2", "c", "3"]);

    assert_eq!(f.ok("EXISTS", ["a", "b", "nope", "a"]), Value::Int(3));
    assert_eq!(f.ok("TOUCH", ["a", "c"]), Value::Int(2));
    assert_eq!(f.ok("DEL", ["a", "b", "nope"]), Value::Int(2));
    assert_eq!(f.ok("EXISTS", ["a", "b", "c"]), Value::Int(1));
}

#[test]
fn test_set_algebra_across_shards() {
    let mut f = Fixture::new();
    f.ok("SADD", ["s1", "a", "b", "c"]);
    f.ok("SADD", ["s2", "b", "c", "d"]);
    f.ok("SADD", ["s3", "c", "e"]);

    assert_eq!(f.ok("SINTER", ["s1", "s2", "s3"]), strs(&["c"]));
    assert_eq!(f.ok("SINTER", ["s1", "missing"]), strs(&[]));
    assert_eq!(f.ok("SUNION", ["s1", "s3"]), strs(&["a", "b", "c", "e"]));
    assert_eq!(f.ok("SDIFF", ["s1", "s2", "s3"]), strs(&["a", "d", "e"]));

    f.ok("SET", ["str", "v"]);
    assert_eq!(command_error(f.exec("SUNION", ["s1", "str"])), CommandError::WrongType);
}

// =============================================================================
// Preprocessing Tests
// =============================================================================

#[test]
fn test_rename_moves_value() {
    let mut f = Fixture::new();
    f.ok("SET", ["src", "hello"]);

    assert_eq!(f.ok("RENAME", ["src", "dst"]), Value::Ok);
    assert!(f.ok("GET", ["src"]).is_nil());
    assert_eq!(f.ok("GET", ["dst"]), Value::str("hello"));

    assert_eq!(f.ok("RENAME", ["dst", "dst"]), Value::Ok);
    assert_eq!(f.ok("GET", ["dst"]), Value::str("hello"));
}

#[test]
fn test_rename_missing_source_fails() {
    let mut f = Fixture::new();
    assert_eq!(command_error(f.exec("RENAME", ["nope", "dst"])), CommandError::NoSuchKey);
    assert_eq!(
        command_error(f.exec("RENAME", ["only-one"])),
        CommandError::WrongArity("rename".into())
    );
}

#[test]
fn test_copy_and_its_fallbacks() {
    let mut f = Fixture::new();

    // Missing source: reply 0, not an error
    assert_eq!(f.ok("COPY", ["nope", "dst"]), Value::Int(0));

    f.ok("SET", ["src", "v1"]);
    assert_eq!(f.ok("COPY", ["src", "dst"]), Value::Int(1));
    assert_eq!(f.ok("GET", ["dst"]), Value::str("v1"));
    assert_eq!(f.ok("GET", ["src"]), Value::str("v1"));

    // Existing destination needs REPLACE
    f.ok("SET", ["src", "v2"]);
    assert_eq!(f.ok("COPY", ["src", "dst"]), Value::Int(0));
    assert_eq!(f.ok("GET", ["dst"]), Value::str("v1"));
    assert_eq!(f.ok("COPY", ["src", "dst", "replace"]), Value::Int(1));
    assert_eq!(f.ok("GET", ["dst"]), Value::str("v2"));

    assert_eq!(command_error(f.exec("COPY", ["src", "dst", "FORCE"])), CommandError::Syntax);
}

// =============================================================================
// All-Shard Tests
// =============================================================================

#[test]
fn test_dbsize_keys_flushdb() {
    let mut f = Fixture::new();
    for i in 0..20 {
        let key = format!("user:{}", i);
        f.dispatcher
            .execute(&f.ctx, Command::new("SET", [key.as_str(), "x"]))
            .unwrap();
    }
    f.ok("SET", ["other", "y"]);

    assert_eq!(f.ok("DBSIZE", []), Value::Int(21));
    let Value::Array(keys) = f.ok("KEYS", ["user:*"]) else {
        panic!("KEYS should reply with an array");
    };
    assert_eq!(keys.len(), 20);

    assert_eq!(f.ok("FLUSHDB", []), Value::Ok);
    assert_eq!(f.ok("DBSIZE", []), Value::Int(0));
}

// =============================================================================
// Probabilistic Counter Tests
// =============================================================================

#[test]
fn test_pfadd_pfcount() {
    let mut f = Fixture::new();
    assert_eq!(f.ok("PFADD", ["visitors", "a", "b", "c"]), Value::Int(1));
    assert_eq!(f.ok("PFADD", ["visitors", "a"]), Value::Int(0));
    assert_eq!(f.ok("PFCOUNT", ["visitors"]), Value::Int(3));
    assert_eq!(f.ok("PFCOUNT", ["nobody"]), Value::Int(0));
}

// =============================================================================
// Auth Tests
// =============================================================================

#[test]
fn test_commands_require_auth_when_configured() {
    let dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(dir.path())
        .num_shards(2)
        .wal_mode(WalMode::Null)
        .require_pass("default", "secret")
        .build();
    let mut f = Fixture::with_config(config, dir);

    assert!(matches!(f.exec("GET", ["k"]), Err(KvError::Auth(_))));
    assert!(matches!(f.exec("AUTH", ["wrong"]), Err(KvError::Auth(_))));
    assert!(matches!(f.exec("PING", []), Err(KvError::Auth(_))));

    assert_eq!(f.ok("AUTH", ["secret"]), Value::Ok);
    assert!(f.ok("GET", ["k"]).is_nil());

    // Each connection authenticates on its own
    let mut other = f.engine.dispatcher();
    assert!(matches!(
        other.execute(&f.ctx, Command::new("GET", ["k"])),
        Err(KvError::Auth(_))
    ));
    assert_eq!(
        other
            .execute(&f.ctx, Command::new("AUTH", ["default", "secret"]))
            .unwrap(),
        Value::Ok
    );
}

#[test]
fn test_auth_without_password_configured_fails() {
    let mut f = Fixture::new();
    assert!(matches!(f.exec("AUTH", ["x"]), Err(KvError::Auth(_))));
}

// =============================================================================
// Response Shaping Tests
// =============================================================================

#[test]
fn test_handle_shapes_replies_and_errors() {
    let mut f = Fixture::new();
    let ctx = f.ctx.clone();

    assert_eq!(
        f.dispatcher.handle(&ctx, Command::new("SET", ["k", "v"])),
        Response::ok()
    );
    assert_eq!(
        f.dispatcher.handle(&ctx, Command::new("INCR", ["k"])),
        Response::error("ERR value is not an integer or out of range")
    );
    assert_eq!(
        f.dispatcher.handle(&ctx, Command::new("UNWATCH", ["k"])),
        Response::error("ERR unknown command 'UNWATCH'")
    );
    assert!(matches!(
        f.dispatcher.handle(&ctx, Command::new("GET.UNWATCH", ["not-a-number"])),
        Response::Error(_)
    ));
}

// =============================================================================
// WAL Recording Tests
// =============================================================================

#[test]
fn test_only_applied_writes_are_logged_in_order() {
    let token = CancelToken::new();
    let ctx = Context::background(token.clone());
    let (mut dispatcher, wal, shards) = recording_dispatcher(&token, DispatchMode::Client);

    dispatcher.execute(&ctx, Command::new("SET", ["a", "1"])).unwrap();
    dispatcher.execute(&ctx, Command::new("GET", ["a"])).unwrap();
    dispatcher.execute(&ctx, Command::new("SADD", ["s", "x"])).unwrap();
    dispatcher
        .execute(&ctx, Command::new("MSET", ["k1", "v1", "locked:s", "v2", "k3", "v3"]))
        .unwrap_err();
    dispatcher.execute(&ctx, Command::new("MGET", ["a", "k1"])).unwrap();
    dispatcher.execute(&ctx, Command::new("RENAME", ["a", "b"])).unwrap();
    dispatcher.execute(&ctx, Command::bare("FLUSHDB")).unwrap();

    assert_eq!(
        *wal.logged.lock(),
        vec![
            Command::new("SET", ["a", "1"]),
            Command::new("SADD", ["s", "x"]),
            Command::new("SET", ["k1", "v1"]),
            Command::new("SET", ["k3", "v3"]),
            Command::new("DEL", ["a"]),
            Command::new("SET", ["b", "1"]),
            Command::bare("FLUSHDB"),
        ]
    );

    token.cancel();
    shards.join();
}

#[test]
fn test_replay_mode_logs_nothing() {
    let token = CancelToken::new();
    let ctx = Context::background(token.clone());
    let (mut dispatcher, wal, shards) = recording_dispatcher(&token, DispatchMode::Replay);

    dispatcher.execute(&ctx, Command::new("SET", ["a", "1"])).unwrap();
    dispatcher.execute(&ctx, Command::new("DEL", ["a"])).unwrap();
    assert!(wal.logged.lock().is_empty());

    token.cancel();
    shards.join();
}
