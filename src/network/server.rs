//! TCP Server
//!
//! Accepts connections and runs each one on its own thread.

use std::io::{BufWriter, ErrorKind};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use super::Connection;
use crate::config::Config;
use crate::context::CancelToken;
use crate::engine::Engine;
use crate::error::Result;
use crate::protocol::{write_response, Response};

/// How long the accept loop idles when no connection is pending
const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// TCP server for ShardKV
pub struct Server {
    config: Config,
    engine: Arc<Engine>,

    /// Stops the accept loop and every connection
    stop: CancelToken,

    /// Connections currently being served
    active: Arc<AtomicUsize>,

    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    /// Create a new server with the given config and engine
    pub fn new(config: Config, engine: Arc<Engine>) -> Self {
        Self {
            config,
            engine,
            stop: CancelToken::new(),
            active: Arc::new(AtomicUsize::new(0)),
            local_addr: Mutex::new(None),
        }
    }

    /// Bind the configured address and serve until shutdown (blocking)
    pub fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr)?;
        self.serve(listener)
    }

    /// Serve on an already bound listener (blocking)
    pub fn serve(&self, listener: TcpListener) -> Result<()> {
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(addr);
        tracing::info!("Listening on {}", addr);

        let stop_done = self.stop.done().clone();
        let engine_done = self.engine.token().done().clone();
        let mut workers: Vec<JoinHandle<()>> = Vec::new();

        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if let Some(handle) = self.accept(stream, peer)? {
                        workers.push(handle);
                    }
                    workers.retain(|h| !h.is_finished());
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    crossbeam::select! {
                        recv(stop_done) -> _ => break,
                        recv(engine_done) -> _ => break,
                        default(ACCEPT_POLL) => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                }
            }
        }

        tracing::info!("Server stopping, waiting for {} connections", workers.len());
        self.stop.cancel();
        for handle in workers {
            if handle.join().is_err() {
                tracing::error!("Connection thread panicked");
            }
        }
        Ok(())
    }

    /// Start serving `stream`, or turn it away when at capacity
    fn accept(&self, stream: TcpStream, peer: SocketAddr) -> Result<Option<JoinHandle<()>>> {
        stream.set_nonblocking(false)?;

        if self.active.load(Ordering::SeqCst) >= self.config.max_connections {
            tracing::warn!("Rejecting {}: max connections ({}) reached", peer, self.config.max_connections);
            let mut writer = BufWriter::new(stream);
            let _ = write_response(&mut writer, &Response::error("ERR max number of clients reached"));
            return Ok(None);
        }

        let mut connection = match Connection::new(stream, Arc::clone(&self.engine), self.stop.clone()) {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!("Failed to set up connection from {}: {}", peer, e);
                return Ok(None);
            }
        };

        let active = Arc::clone(&self.active);
        active.fetch_add(1, Ordering::SeqCst);
        let handle = thread::Builder::new()
            .name(format!("client-{}", connection.client_id()))
            .spawn(move || {
                if let Err(e) = connection.handle() {
                    tracing::warn!("Connection {} ended with error: {}", connection.peer_addr(), e);
                }
                active.fetch_sub(1, Ordering::SeqCst);
            })?;
        Ok(Some(handle))
    }

    /// Address actually bound, once serving
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Connections currently open
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Signal the server to shutdown gracefully
    pub fn shutdown(&self) {
        self.stop.cancel();
    }
}
