//! Network Module
//!
//! TCP server, per-connection handling and a blocking client.
//!
//! ## Architecture
//! - Single non-blocking acceptor loop
//! - One thread per connection, plus a reader thread feeding it requests
//! - Commands routed through a per-connection dispatcher

mod client;
mod connection;
mod server;

pub use client::Client;
pub use connection::Connection;
pub use server::Server;
