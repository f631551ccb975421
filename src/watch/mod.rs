//! Watch Module
//!
//! Reactive queries. A `.WATCH` command subscribes a connection to a read
//! query; when a qualifying write touches the query's key, the connection is
//! told to re-run the query and push the fresh result.
//!
//! ## State
//! Two maps, owned by a single event-loop thread:
//! - key → fingerprints watching it
//! - fingerprint → subscription (watched command + subscribed connections)
//!
//! A fingerprint whose last connection leaves is removed from both maps.
//! Every public method only enqueues an event, so callers never wait on
//! watch bookkeeping.

mod affected;

use std::collections::{HashMap, HashSet};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

use crate::context::CancelToken;
use crate::error::{KvError, Result};
use crate::protocol::Command;

pub use affected::affects;

/// Sent to a connection when one of its watch queries must be re-run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchNotification {
    pub fingerprint: u32,
    /// Canonical (non-`.WATCH`) command to execute
    pub command: Command,
    /// Client-supplied label, if the watch carried one
    pub label: Option<String>,
}

/// A write that reached a shard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationEvent {
    /// Key written; `None` for keyspace-wide writes such as FLUSHDB
    pub key: Option<String>,
    pub command: String,
}

/// Counts of live registry entries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchStats {
    pub keys: usize,
    pub fingerprints: usize,
    pub subscriptions: usize,
}

enum WatchEvent {
    Subscribe {
        fingerprint: u32,
        key: String,
        command: Command,
        client_id: u64,
        label: Option<String>,
        notify: Sender<WatchNotification>,
    },
    Unsubscribe {
        fingerprint: u32,
        client_id: u64,
    },
    DropClient {
        client_id: u64,
    },
    Mutation(MutationEvent),
    Stats(Sender<WatchStats>),
}

struct ClientWatch {
    label: Option<String>,
    notify: Sender<WatchNotification>,
}

struct Subscription {
    key: String,
    command: Command,
    clients: HashMap<u64, ClientWatch>,
}

#[derive(Default)]
struct WatchRegistry {
    by_key: HashMap<String, HashSet<u32>>,
    by_fingerprint: HashMap<u32, Subscription>,
}

impl WatchRegistry {
    fn apply(&mut self, event: WatchEvent) {
        match event {
            WatchEvent::Subscribe {
                fingerprint,
                key,
                command,
                client_id,
                label,
                notify,
            } => {
                self.by_key.entry(key.clone()).or_default().insert(fingerprint);
                self.by_fingerprint
                    .entry(fingerprint)
                    .or_insert_with(|| Subscription {
                        key,
                        command,
                        clients: HashMap::new(),
                    })
                    .clients
                    .insert(client_id, ClientWatch { label, notify });
                tracing::debug!("Client {} watching fingerprint {}", client_id, fingerprint);
            }
            WatchEvent::Unsubscribe {
                fingerprint,
                client_id,
            } => self.remove(fingerprint, client_id),
            WatchEvent::DropClient { client_id } => {
                let fingerprints: Vec<u32> = self
                    .by_fingerprint
                    .iter()
                    .filter(|(_, sub)| sub.clients.contains_key(&client_id))
                    .map(|(fp, _)| *fp)
                    .collect();
                for fingerprint in fingerprints {
                    self.remove(fingerprint, client_id);
                }
            }
            WatchEvent::Mutation(event) => self.notify(&event),
            WatchEvent::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
        }
    }

    /// Remove one connection from one fingerprint. Missing entries are fine.
    fn remove(&mut self, fingerprint: u32, client_id: u64) {
        let Some(sub) = self.by_fingerprint.get_mut(&fingerprint) else {
            return;
        };
        if sub.clients.remove(&client_id).is_some() {
            tracing::debug!("Client {} stopped watching fingerprint {}", client_id, fingerprint);
        }
        if !sub.clients.is_empty() {
            return;
        }

        let key = sub.key.clone();
        self.by_fingerprint.remove(&fingerprint);
        if let Some(fingerprints) = self.by_key.get_mut(&key) {
            fingerprints.remove(&fingerprint);
            if fingerprints.is_empty() {
                self.by_key.remove(&key);
            }
        }
    }

    fn notify(&mut self, event: &MutationEvent) {
        let candidates: Vec<u32> = match &event.key {
            Some(key) => self
                .by_key
                .get(key)
                .map(|fps| fps.iter().copied().collect())
                .unwrap_or_default(),
            None => self.by_fingerprint.keys().copied().collect(),
        };

        let mut gone = Vec::new();
        for fingerprint in candidates {
            let Some(sub) = self.by_fingerprint.get(&fingerprint) else {
                continue;
            };
            if !affects(&event.command, &sub.command.name) {
                continue;
            }
            for (client_id, client) in &sub.clients {
                let notification = WatchNotification {
                    fingerprint,
                    command: sub.command.clone(),
                    label: client.label.clone(),
                };
                if client.notify.send(notification).is_err() {
                    gone.push((fingerprint, *client_id));
                }
            }
        }

        // Connections that went away without unsubscribing
        for (fingerprint, client_id) in gone {
            self.remove(fingerprint, client_id);
        }
    }

    fn stats(&self) -> WatchStats {
        WatchStats {
            keys: self.by_key.len(),
            fingerprints: self.by_fingerprint.len(),
            subscriptions: self.by_fingerprint.values().map(|s| s.clients.len()).sum(),
        }
    }
}

/// Handle to the watch event loop
pub struct WatchManager {
    events: Sender<WatchEvent>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WatchManager {
    /// Spawn the event loop. It exits when `token` is cancelled.
    pub fn start(token: CancelToken) -> Result<Self> {
        let (tx, rx) = channel::unbounded();
        let handle = thread::Builder::new()
            .name("watch-manager".into())
            .spawn(move || run_loop(rx, token))?;
        Ok(Self {
            events: tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Register `client_id` for re-runs of `command`
    pub fn handle_subscribe(
        &self,
        fingerprint: u32,
        key: impl Into<String>,
        command: Command,
        client_id: u64,
        label: Option<String>,
        notify: Sender<WatchNotification>,
    ) {
        self.send(WatchEvent::Subscribe {
            fingerprint,
            key: key.into(),
            command,
            client_id,
            label,
            notify,
        });
    }

    /// Remove `client_id` from `fingerprint`. A no-op if not subscribed.
    pub fn handle_unsubscribe(&self, fingerprint: u32, client_id: u64) {
        self.send(WatchEvent::Unsubscribe {
            fingerprint,
            client_id,
        });
    }

    /// Remove every subscription held by `client_id`
    pub fn drop_client(&self, client_id: u64) {
        self.send(WatchEvent::DropClient { client_id });
    }

    /// Report a write; affected subscribers get a notification
    pub fn on_mutation(&self, event: MutationEvent) {
        self.send(WatchEvent::Mutation(event));
    }

    /// Registry sizes, taken after every previously sent event is applied
    pub fn stats(&self) -> Result<WatchStats> {
        let (tx, rx) = channel::bounded(1);
        self.send(WatchEvent::Stats(tx));
        rx.recv_timeout(Duration::from_secs(5))
            .map_err(|_| KvError::Internal("watch manager is not running".into()))
    }

    /// Wait for the event loop to exit
    pub fn join(&self) {
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                tracing::error!("Watch manager thread panicked");
            }
        }
    }

    fn send(&self, event: WatchEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("Watch manager stopped, event dropped");
        }
    }
}

fn run_loop(events: Receiver<WatchEvent>, token: CancelToken) {
    let mut registry = WatchRegistry::default();
    let done = token.done().clone();

    loop {
        crossbeam::select! {
            recv(events) -> event => match event {
                Ok(event) => registry.apply(event),
                Err(_) => break,
            },
            recv(done) -> _ => break,
        }
    }
    tracing::debug!("Watch manager stopped with {} live fingerprints", registry.by_fingerprint.len());
}
