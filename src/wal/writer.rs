//! WAL Writer
//!
//! Segmented, file-backed WAL. One mutex guards the active segment, its size
//! counter and the LSN, and is shared by the append path and both background
//! timers so their writes never interleave.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel;
use parking_lot::Mutex;

use super::entry::WalEntry;
use super::recovery::{replay_segments, ReplayStats};
use super::segment::{list_segments, SegmentWriter};
use super::Wal;
use crate::config::WalConfig;
use crate::context::CancelToken;
use crate::error::{KvError, Result};
use crate::protocol::Command;

/// State guarded by the append mutex
struct WriterState {
    /// `None` before `init` and after `close`
    segment: Option<SegmentWriter>,

    /// LSN of the last appended or replayed record
    last_lsn: u64,

    /// Reused encode buffer
    scratch: Vec<u8>,
}

struct Inner {
    dir: PathBuf,
    config: WalConfig,
    state: Mutex<WriterState>,
}

impl Inner {
    /// Close the active segment and open the next one.
    /// Called with the state lock held.
    fn rotate(&self, state: &mut WriterState) -> Result<()> {
        let Some(mut current) = state.segment.take() else {
            return Err(KvError::WalWrite("WAL is not open".into()));
        };
        current.sync()?;
        let next = current.index + 1;
        tracing::info!(
            "Rotating WAL segment {} ({} bytes) -> {}",
            current.index,
            current.size,
            next
        );
        drop(current);
        state.segment = Some(SegmentWriter::create(&self.dir, next, self.config.buffer_size)?);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(segment) = state.segment.as_mut() {
            segment.sync()?;
        }
        Ok(())
    }

    /// Rotate if the active segment is non-empty and older than `interval`
    fn rotate_if_aged(&self, interval: Duration) -> Result<()> {
        let mut state = self.state.lock();
        let due = state
            .segment
            .as_ref()
            .is_some_and(|s| s.size > 0 && s.opened_at.elapsed() >= interval);
        if due {
            self.rotate(&mut state)?;
        }
        Ok(())
    }
}

/// Append-only segmented WAL
pub struct SegmentedWal {
    inner: Arc<Inner>,
    stop: Mutex<Option<CancelToken>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SegmentedWal {
    pub fn new(dir: PathBuf, config: WalConfig) -> Self {
        let scratch = Vec::with_capacity(4096);
        Self {
            inner: Arc::new(Inner {
                dir,
                config,
                state: Mutex::new(WriterState {
                    segment: None,
                    last_lsn: 0,
                    scratch,
                }),
            }),
            stop: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Index of the segment currently being appended to
    pub fn current_segment(&self) -> Option<u64> {
        self.inner.state.lock().segment.as_ref().map(|s| s.index)
    }

    /// LSN of the most recent record
    pub fn last_lsn(&self) -> u64 {
        self.inner.state.lock().last_lsn
    }

    /// Flush and fsync without rotating
    pub fn sync(&self) -> Result<()> {
        self.inner.sync()
    }

    /// Force a rotation to a fresh segment
    pub fn rotate(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        self.inner.rotate(&mut state)
    }

    fn spawn_timer<F>(&self, name: &str, interval: Duration, stop: &CancelToken, mut tick: F) -> Result<JoinHandle<()>>
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        let done = stop.done().clone();
        let ticker = channel::tick(interval);
        let label = name.to_string();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                crossbeam::select! {
                    recv(done) -> _ => break,
                    recv(ticker) -> _ => {
                        if let Err(e) = tick() {
                            tracing::error!("{} failed: {}", label, e);
                        }
                    }
                }
            })?;
        Ok(handle)
    }
}

impl Wal for SegmentedWal {
    fn init(&self) -> Result<()> {
        std::fs::create_dir_all(&self.inner.dir)?;

        {
            let mut state = self.inner.state.lock();
            if state.segment.is_some() {
                return Ok(());
            }
            // Never reopen an old segment: start after the newest one
            let next = list_segments(&self.inner.dir)?
                .last()
                .map(|(index, _)| index + 1)
                .unwrap_or(1);
            state.segment = Some(SegmentWriter::create(
                &self.inner.dir,
                next,
                self.inner.config.buffer_size,
            )?);
            tracing::debug!("WAL opened segment {} in {}", next, self.inner.dir.display());
        }

        let stop = CancelToken::new();
        let mut workers = self.workers.lock();

        let inner = Arc::clone(&self.inner);
        workers.push(self.spawn_timer(
            "wal-sync",
            self.inner.config.buffer_sync_interval,
            &stop,
            move || inner.sync(),
        )?);

        if let Some(interval) = self.inner.config.rotation_interval {
            let inner = Arc::clone(&self.inner);
            workers.push(self.spawn_timer("wal-rotate", interval, &stop, move || {
                inner.rotate_if_aged(interval)
            })?);
        }

        *self.stop.lock() = Some(stop);
        Ok(())
    }

    fn log_command(&self, command: &Command) -> Result<()> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;

        let lsn = state.last_lsn + 1;
        let entry = WalEntry::new(lsn, command)?;
        state.scratch.clear();
        entry.encode_into(&mut state.scratch)?;
        let entry_size = state.scratch.len() as u64;

        let needs_rotation = match state.segment.as_ref() {
            None => return Err(KvError::WalWrite("WAL is not open".into())),
            Some(s) => s.size > 0 && s.size + entry_size > self.inner.config.max_segment_size,
        };
        if needs_rotation {
            self.inner.rotate(state)?;
        }

        if let Some(segment) = state.segment.as_mut() {
            segment.append(&state.scratch)?;
        }
        state.last_lsn = lsn;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if let Some(stop) = self.stop.lock().take() {
            stop.cancel();
        }
        for handle in self.workers.lock().drain(..) {
            if handle.join().is_err() {
                tracing::error!("WAL timer thread panicked");
            }
        }

        let mut state = self.inner.state.lock();
        if let Some(mut segment) = state.segment.take() {
            segment.sync()?;
            tracing::debug!("WAL closed at segment {}, lsn {}", segment.index, state.last_lsn);
        }
        Ok(())
    }

    fn replay_command(&self, callback: &mut dyn FnMut(Command) -> Result<()>) -> Result<ReplayStats> {
        // Held for the whole replay so nothing is appended underneath it
        let mut state = self.inner.state.lock();
        if let Some(segment) = state.segment.as_mut() {
            segment.sync()?;
        }

        let stats = replay_segments(
            &self.inner.dir,
            self.inner.config.replay_policy,
            &mut |_, command| callback(command),
        )?;
        state.last_lsn = state.last_lsn.max(stats.last_lsn);

        tracing::info!(
            "WAL replay: {} commands from {} segments, last_lsn={}",
            stats.entries_replayed,
            stats.segments,
            stats.last_lsn
        );
        Ok(stats)
    }
}

impl Drop for SegmentedWal {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!("Failed to close WAL: {}", e);
        }
    }
}
