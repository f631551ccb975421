//! WAL Entry definitions
//!
//! Defines the structure of individual WAL records and their framing.

use serde::{Deserialize, Serialize};

use crate::error::{KvError, Result};
use crate::protocol::Command;

/// Record header: CRC32 (4) + length (4), both big-endian
pub const HEADER_SIZE: usize = 8;

/// A single entry in the WAL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalEntry {
    /// Log Sequence Number - monotonically increasing
    pub lsn: u64,

    /// Timestamp (unix millis) when entry was created
    pub timestamp: u64,

    /// Serialized command
    pub payload: Vec<u8>,
}

impl WalEntry {
    pub fn new(lsn: u64, command: &Command) -> Result<Self> {
        Ok(Self {
            lsn,
            timestamp: super::now_millis(),
            payload: bincode::serialize(command)?,
        })
    }

    /// Decode the wrapped command
    pub fn command(&self) -> Result<Command> {
        bincode::deserialize(&self.payload).map_err(|e| {
            KvError::WalCorruption(format!("lsn {}: undecodable command: {}", self.lsn, e))
        })
    }

    /// Append the framed record (header + entry bytes) to `buf`
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        let start = buf.len();
        buf.extend_from_slice(&[0u8; HEADER_SIZE]);
        bincode::serialize_into(&mut *buf, self)?;

        let body_len = buf.len() - start - HEADER_SIZE;
        let crc = compute_crc(&buf[start + HEADER_SIZE..]);
        buf[start..start + 4].copy_from_slice(&crc.to_be_bytes());
        buf[start + 4..start + HEADER_SIZE].copy_from_slice(&(body_len as u32).to_be_bytes());
        Ok(())
    }

    /// The framed record as a fresh buffer
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Decode entry bytes after checking them against `crc`
    pub fn decode_body(crc: u32, body: &[u8]) -> Result<Self> {
        let actual = compute_crc(body);
        if actual != crc {
            return Err(KvError::WalCorruption(format!(
                "checksum mismatch: stored {:08x}, computed {:08x}",
                crc, actual
            )));
        }
        bincode::deserialize(body)
            .map_err(|e| KvError::WalCorruption(format!("undecodable entry: {}", e)))
    }
}

pub fn compute_crc(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}
