//! Cancellation and deadlines
//!
//! A [`CancelToken`] is a channel whose only sender is dropped on cancel.
//! Every clone of the receiver then becomes ready at once, which lets a
//! blocked `crossbeam::select!` wake up on cancellation alongside its other
//! channels.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

/// Cloneable cancellation source shared by every task of one scope
#[derive(Clone)]
pub struct CancelToken {
    sender: Arc<Mutex<Option<Sender<()>>>>,
    done: Receiver<()>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = channel::bounded(0);
        Self {
            sender: Arc::new(Mutex::new(Some(tx))),
            done: rx,
        }
    }

    /// Cancel the token. Calling this more than once is a no-op.
    pub fn cancel(&self) {
        self.sender.lock().take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Receiver that disconnects once the token is cancelled
    pub fn done(&self) -> &Receiver<()> {
        &self.done
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// A cancellation token plus an optional deadline
#[derive(Clone)]
pub struct Context {
    token: CancelToken,
    deadline: Option<Instant>,
}

impl Context {
    /// Context without a deadline, cancelled only through `token`
    pub fn background(token: CancelToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Child context that expires after `timeout` or at the parent's
    /// deadline, whichever comes first
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) if parent < candidate => parent,
            _ => candidate,
        };
        Self {
            token: self.token.clone(),
            deadline: Some(deadline),
        }
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    pub fn done(&self) -> &Receiver<()> {
        self.token.done()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` means no deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }
}
