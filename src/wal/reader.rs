//! WAL Reader
//!
//! Reads framed records from one segment file.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use super::entry::{WalEntry, HEADER_SIZE};
use crate::error::{KvError, Result};

/// Why a segment could not be read past `offset`
#[derive(Debug)]
pub enum ReadFault {
    /// The file ends partway through a record
    Torn { offset: u64 },

    /// A complete record failed its checksum or could not be decoded
    Corrupt { offset: u64, reason: String },

    Io(io::Error),
}

impl fmt::Display for ReadFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadFault::Torn { offset } => write!(f, "incomplete record at offset {}", offset),
            ReadFault::Corrupt { offset, reason } => {
                write!(f, "corrupt record at offset {}: {}", offset, reason)
            }
            ReadFault::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

/// Sequential reader over one segment
pub struct SegmentReader {
    reader: BufReader<File>,
    /// Offset of the next record
    position: u64,
    file_len: u64,
}

impl SegmentReader {
    /// Open a segment file for reading
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        Ok(Self {
            reader: BufReader::new(file),
            position: 0,
            file_len,
        })
    }

    /// Offset of the next unread record
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Read the next entry. `Ok(None)` at a clean end of file.
    pub fn next_entry(&mut self) -> std::result::Result<Option<WalEntry>, ReadFault> {
        let offset = self.position;

        let mut header = [0u8; HEADER_SIZE];
        match read_full(&mut self.reader, &mut header).map_err(ReadFault::Io)? {
            0 => return Ok(None),
            n if n < HEADER_SIZE => return Err(ReadFault::Torn { offset }),
            _ => {}
        }

        let crc = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;

        // Never size a buffer past what the file can hold
        let available = self.file_len.saturating_sub(offset + HEADER_SIZE as u64);
        if len as u64 > available {
            return Err(ReadFault::Torn { offset });
        }

        let mut body = vec![0u8; len];
        if read_full(&mut self.reader, &mut body).map_err(ReadFault::Io)? < len {
            return Err(ReadFault::Torn { offset });
        }

        let entry = WalEntry::decode_body(crc, &body).map_err(|e| ReadFault::Corrupt {
            offset,
            reason: match e {
                KvError::WalCorruption(msg) => msg,
                other => other.to_string(),
            },
        })?;

        self.position += (HEADER_SIZE + len) as u64;
        Ok(Some(entry))
    }
}

/// Like `read_exact`, but reports how many bytes were available instead of
/// failing at end of file
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
