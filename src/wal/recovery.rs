//! WAL Recovery
//!
//! Replays segments oldest first, record by record.

use std::fs::OpenOptions;
use std::path::Path;

use super::reader::{ReadFault, SegmentReader};
use super::segment::list_segments;
use crate::config::ReplayPolicy;
use crate::error::{KvError, Result};
use crate::protocol::Command;

/// Result of a replay
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    /// Segments visited
    pub segments: usize,

    /// Commands handed to the callback
    pub entries_replayed: u64,

    /// Highest LSN seen
    pub last_lsn: u64,

    /// Whether a torn tail was cut off
    pub was_truncated: bool,
}

/// Replay every segment in `dir`.
///
/// A checksum or decode failure always aborts. A torn record is tolerated
/// only under [`ReplayPolicy::TruncateTorn`], and only when it is the last
/// data in the log: the file is cut back to the last whole record.
pub fn replay_segments(
    dir: &Path,
    policy: ReplayPolicy,
    callback: &mut dyn FnMut(u64, Command) -> Result<()>,
) -> Result<ReplayStats> {
    let segments = list_segments(dir)?;
    let mut stats = ReplayStats::default();

    for (position, (index, path)) in segments.iter().enumerate() {
        stats.segments += 1;
        let mut reader = SegmentReader::open(path)?;

        loop {
            match reader.next_entry() {
                Ok(Some(entry)) => {
                    if entry.lsn <= stats.last_lsn && stats.entries_replayed > 0 {
                        return Err(KvError::WalCorruption(format!(
                            "segment {}: lsn {} follows lsn {}",
                            index, entry.lsn, stats.last_lsn
                        )));
                    }
                    stats.last_lsn = entry.lsn;
                    let command = entry.command()?;
                    callback(entry.lsn, command)?;
                    stats.entries_replayed += 1;
                }
                Ok(None) => break,
                Err(ReadFault::Torn { offset }) => {
                    let later_data = segments[position + 1..]
                        .iter()
                        .any(|(_, p)| p.metadata().map(|m| m.len() > 0).unwrap_or(true));

                    if policy == ReplayPolicy::TruncateTorn && !later_data {
                        tracing::warn!(
                            "WAL segment {} has a torn record at offset {}, truncating",
                            index,
                            offset
                        );
                        OpenOptions::new().write(true).open(path)?.set_len(offset)?;
                        stats.was_truncated = true;
                        break;
                    }
                    return Err(KvError::WalCorruption(format!(
                        "segment {}: incomplete record at offset {}",
                        index, offset
                    )));
                }
                Err(ReadFault::Corrupt { offset, reason }) => {
                    return Err(KvError::WalCorruption(format!(
                        "segment {}: offset {}: {}",
                        index, offset, reason
                    )));
                }
                Err(ReadFault::Io(e)) => return Err(KvError::Io(e)),
            }
        }
    }

    Ok(stats)
}
