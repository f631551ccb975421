//! # ShardKV
//!
//! An in-memory, multi-shard key-value server with:
//! - Shard-per-thread execution, no locks on key data
//! - Multi-key commands decomposed across shards and recomposed
//! - Segmented, CRC-checked write-ahead log with replay on startup
//! - Reactive `.WATCH` queries pushed to subscribed connections
//! - Length-prefixed binary TCP protocol
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      TCP Server                             │
//! │              (one thread per connection)                    │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                     Dispatcher                              │
//! │   classify → decompose → scatter → gather → compose         │
//! └───────┬─────────────────────┬──────────────────────┬────────┘
//!         │                     │                      │
//!         ▼                     ▼                      ▼
//!  ┌─────────────┐      ┌──────────────┐       ┌──────────────┐
//!  │ShardManager │      │     WAL      │       │ WatchManager │
//!  │ shard-0..N  │      │  (Append)    │       │ (event loop) │
//!  └──────┬──────┘      └──────────────┘       └──────────────┘
//!         │
//!         ▼
//!  ┌─────────────┐
//!  │ Store (per  │
//!  │   shard)    │
//!  └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod context;
pub mod auth;

pub mod protocol;
pub mod store;
pub mod shard;
pub mod wal;
pub mod watch;
pub mod dispatch;
pub mod engine;
pub mod network;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{CommandError, KvError, Result};
pub use config::Config;
pub use engine::Engine;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of ShardKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
