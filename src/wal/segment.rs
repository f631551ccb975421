//! WAL segment files
//!
//! Naming, discovery and the append handle for the active segment.
//! A segment is only ever written by the writer that created it; once the
//! writer rotates away it is read-only.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::error::Result;

const PREFIX: &str = "seg-";
const SUFFIX: &str = ".wal";

/// Path of segment `index` inside `dir`
pub fn segment_path(dir: &Path, index: u64) -> PathBuf {
    dir.join(format!("{}{}{}", PREFIX, index, SUFFIX))
}

/// "seg-42.wal" → Some(42)
fn parse_segment_index(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    name.strip_prefix(PREFIX)?.strip_suffix(SUFFIX)?.parse().ok()
}

/// All segments in `dir`, sorted by index ascending
pub fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            if let Some(index) = parse_segment_index(&path) {
                segments.push((index, path));
            }
        }
    }
    segments.sort_by_key(|(index, _)| *index);
    Ok(segments)
}

/// Append handle for the active segment
pub(crate) struct SegmentWriter {
    pub index: u64,
    pub size: u64,
    pub opened_at: Instant,
    writer: BufWriter<File>,
}

impl SegmentWriter {
    /// Create segment `index`. Fails if it already exists.
    pub fn create(dir: &Path, index: u64, buffer_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(segment_path(dir, index))?;
        Ok(Self {
            index,
            size: 0,
            opened_at: Instant::now(),
            writer: BufWriter::with_capacity(buffer_size, file),
        })
    }

    pub fn append(&mut self, record: &[u8]) -> Result<()> {
        self.writer.write_all(record)?;
        self.size += record.len() as u64;
        Ok(())
    }

    /// Flush the buffer and fsync the file
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }
}
