//! Store Module
//!
//! The per-shard key-value partition. A store is owned by exactly one shard
//! worker thread and is never shared, so it takes `&mut self` everywhere
//! and holds no locks.
//!
//! ## Responsibilities
//! - Execute one command atomically against the shard's keys
//! - Drop expired keys lazily and on periodic sweeps
//! - Report fatal conditions separately from per-key errors

mod glob;
mod mem;

use std::time::Instant;

use crate::error::CommandError;
use crate::protocol::{Command, Value};

pub use glob::glob_match;
pub use mem::MemStore;

/// Failure of a store call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Ordinary per-key error, returned to the client
    Command(CommandError),

    /// The shard can no longer serve requests
    Fatal(String),
}

impl From<CommandError> for StoreError {
    fn from(e: CommandError) -> Self {
        StoreError::Command(e)
    }
}

pub type StoreResult = std::result::Result<Value, StoreError>;

/// A shard-local store
pub trait Store: Send {
    /// Execute one command against this partition
    fn execute(&mut self, command: &Command) -> StoreResult;

    /// Remove every key whose TTL elapsed before `now`, returning how many
    fn sweep_expired(&mut self, now: Instant) -> usize;

    /// Called once when the owning shard shuts down
    fn cleanup(&mut self) {}
}

/// Builds the store for a shard id
pub type StoreFactory = Box<dyn Fn(usize) -> Box<dyn Store> + Send + Sync>;

/// Factory producing an empty [`MemStore`] per shard
pub fn mem_store_factory() -> StoreFactory {
    Box::new(|_| Box::new(MemStore::new()))
}
