//! Connection Handler
//!
//! Handles individual client connections.
//!
//! A reader thread decodes request frames and forwards them over a channel,
//! so the connection loop can wait on client requests, watch notifications
//! and shutdown at the same time.

use std::io::{BufReader, BufWriter, ErrorKind};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};

use crate::context::{CancelToken, Context};
use crate::dispatch::Dispatcher;
use crate::engine::Engine;
use crate::error::{KvError, Result};
use crate::protocol::{parse_request, read_frame, write_response, Command, Response};

/// What the reader thread saw on the socket
enum Incoming {
    Request(Vec<Command>),

    /// Frame arrived but its payload did not decode; the stream is still in sync
    Malformed(String),

    /// Framing broke; the stream cannot be trusted any more
    Broken(String),

    Closed,
}

/// Handles a single client connection
pub struct Connection {
    /// TCP stream writer (buffered for efficiency)
    writer: BufWriter<TcpStream>,

    /// Taken by the reader thread when the connection starts
    reader: Option<BufReader<TcpStream>>,

    engine: Arc<Engine>,
    dispatcher: Dispatcher,

    /// Server-level stop signal
    stop: CancelToken,

    /// Peer address for logging
    peer_addr: String,
}

impl Connection {
    /// Create a new connection handler
    ///
    /// Sets up buffered I/O and configures timeouts
    pub fn new(stream: TcpStream, engine: Arc<Engine>, stop: CancelToken) -> Result<Self> {
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        // Disable Nagle's algorithm for low latency
        stream.set_nodelay(true)?;

        let read_ms = engine.config().read_timeout_ms;
        let write_ms = engine.config().write_timeout_ms;
        if read_ms > 0 {
            stream.set_read_timeout(Some(Duration::from_millis(read_ms)))?;
        }
        if write_ms > 0 {
            stream.set_write_timeout(Some(Duration::from_millis(write_ms)))?;
        }

        let read_stream = stream.try_clone()?;
        let dispatcher = engine.dispatcher();

        Ok(Self {
            writer: BufWriter::new(stream),
            reader: Some(BufReader::new(read_stream)),
            engine,
            dispatcher,
            stop,
            peer_addr,
        })
    }

    pub fn client_id(&self) -> u64 {
        self.dispatcher.client_id()
    }

    /// Get the peer address string
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    /// Serve the connection until the client leaves or the server stops.
    /// Every watch held by the connection is dropped on the way out.
    pub fn handle(&mut self) -> Result<()> {
        tracing::debug!(
            "Connection established from {} (client {})",
            self.peer_addr,
            self.client_id()
        );

        let (tx, incoming) = channel::bounded(16);
        let reader = match self.reader.take() {
            Some(reader) => self.spawn_reader(reader, tx)?,
            None => return Err(KvError::Internal("connection already handled".into())),
        };

        let result = self.serve(&incoming);

        self.engine.watch().drop_client(self.client_id());
        let _ = self.writer.get_ref().shutdown(Shutdown::Both);
        drop(incoming);
        if reader.join().is_err() {
            tracing::error!("Reader thread for {} panicked", self.peer_addr);
        }
        tracing::debug!("Client {} ({}) disconnected", self.client_id(), self.peer_addr);
        result
    }

    fn serve(&mut self, incoming: &Receiver<Incoming>) -> Result<()> {
        let ctx = self.engine.context();
        let notifications = self.dispatcher.notifications().clone();
        let engine_done = ctx.done().clone();
        let stop_done = self.stop.done().clone();

        loop {
            crossbeam::select! {
                recv(incoming) -> msg => match msg {
                    Ok(Incoming::Request(commands)) => {
                        let response = self.execute(&ctx, commands);
                        if !self.send(&response)? {
                            return Ok(());
                        }
                    }
                    Ok(Incoming::Malformed(message)) => {
                        tracing::warn!("Malformed request from {}: {}", self.peer_addr, message);
                        if !self.send(&Response::error(message))? {
                            return Ok(());
                        }
                    }
                    Ok(Incoming::Broken(message)) => {
                        tracing::warn!("Dropping {}: {}", self.peer_addr, message);
                        let _ = self.send(&Response::error(message));
                        return Ok(());
                    }
                    Ok(Incoming::Closed) | Err(_) => return Ok(()),
                },
                recv(notifications) -> msg => {
                    if let Ok(notification) = msg {
                        let response = self.dispatcher.handle_notification(&ctx, notification);
                        if !self.send(&response)? {
                            return Ok(());
                        }
                    }
                }
                recv(engine_done) -> _ => return Ok(()),
                recv(stop_done) -> _ => return Ok(()),
            }
        }
    }

    /// Run one request. Anything other than exactly one command is a
    /// protocol error and never reaches a shard.
    fn execute(&mut self, ctx: &Context, mut commands: Vec<Command>) -> Response {
        if commands.len() != 1 {
            let err = KvError::Protocol(format!(
                "expected exactly one command per request, got {}",
                commands.len()
            ));
            return Response::error(err.to_string());
        }
        let command = commands.remove(0);
        tracing::trace!("Received command from {}: {}", self.peer_addr, command);
        self.dispatcher.handle(ctx, command)
    }

    /// Write a response. `Ok(false)` means the client is gone.
    fn send(&mut self, response: &Response) -> Result<bool> {
        match write_response(&mut self.writer, response) {
            Ok(()) => Ok(true),
            Err(e) if e.is_connection_fatal() => {
                tracing::debug!(
                    "Client {} disconnected before response could be sent: {}",
                    self.peer_addr,
                    e
                );
                Ok(false)
            }
            Err(e) => {
                tracing::warn!("Error writing to {}: {}", self.peer_addr, e);
                Err(e)
            }
        }
    }

    fn spawn_reader(&self, mut reader: BufReader<TcpStream>, tx: Sender<Incoming>) -> Result<JoinHandle<()>> {
        let peer = self.peer_addr.clone();
        let handle = thread::Builder::new()
            .name(format!("conn-{}", self.client_id()))
            .spawn(move || loop {
                let event = match read_frame(&mut reader) {
                    Ok(payload) => match parse_request(&payload) {
                        Ok(commands) => Incoming::Request(commands),
                        Err(e) => Incoming::Malformed(e.to_string()),
                    },
                    Err(KvError::Io(e)) => {
                        match e.kind() {
                            ErrorKind::WouldBlock | ErrorKind::TimedOut => {
                                tracing::debug!("Read timeout for client {}", peer);
                            }
                            ErrorKind::UnexpectedEof => {}
                            _ => tracing::debug!("Read from {} failed: {}", peer, e),
                        }
                        Incoming::Closed
                    }
                    Err(e) => Incoming::Broken(e.to_string()),
                };

                let last = matches!(event, Incoming::Broken(_) | Incoming::Closed);
                if tx.send(event).is_err() || last {
                    break;
                }
            })?;
        Ok(handle)
    }
}
