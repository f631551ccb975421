//! Null WAL
//!
//! Accepts every record and keeps none. Used when durability is disabled.

use super::{ReplayStats, Wal};
use crate::error::Result;
use crate::protocol::Command;

#[derive(Debug, Default, Clone, Copy)]
pub struct NullWal;

impl Wal for NullWal {
    fn init(&self) -> Result<()> {
        Ok(())
    }

    fn log_command(&self, _command: &Command) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn replay_command(&self, _callback: &mut dyn FnMut(Command) -> Result<()>) -> Result<ReplayStats> {
        Ok(ReplayStats::default())
    }
}
