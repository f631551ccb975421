//! Blocking client
//!
//! One request in flight at a time. Watch pushes that arrive while waiting
//! for a reply are queued and handed out by [`Client::next_push`].

use std::collections::VecDeque;
use std::io::{BufReader, BufWriter, ErrorKind};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::dispatch::split_watch;
use crate::error::{KvError, Result};
use crate::protocol::{read_response, write_request, Command, Request, Response};

pub struct Client {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    pushes: VecDeque<Response>,
}

impl Client {
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let read_stream = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(read_stream),
            writer: BufWriter::new(stream),
            pushes: VecDeque::new(),
        })
    }

    /// Send one command and wait for its reply.
    ///
    /// For `.WATCH` commands the reply is the push carrying the new
    /// subscription's fingerprint.
    pub fn execute(&mut self, command: Command) -> Result<Response> {
        let watched = command
            .name
            .ends_with(".WATCH")
            .then(|| split_watch(&command).0.fingerprint());
        self.execute_request(&Request::single(command), watched)
    }

    /// Send a raw request. `watched` names the fingerprint whose push
    /// answers it, if any.
    pub fn execute_request(&mut self, request: &Request, watched: Option<u32>) -> Result<Response> {
        write_request(&mut self.writer, request)?;
        loop {
            let response = read_response(&mut self.reader)?;
            match (&response, watched) {
                (Response::Push { fingerprint, .. }, Some(expected)) if *fingerprint == expected => {
                    return Ok(response);
                }
                (Response::Push { .. }, _) => self.pushes.push_back(response),
                _ => return Ok(response),
            }
        }
    }

    /// Next watch push, waiting up to `timeout`. `None` on timeout.
    pub fn next_push(&mut self, timeout: Duration) -> Result<Option<Response>> {
        if let Some(push) = self.pushes.pop_front() {
            return Ok(Some(push));
        }

        self.reader.get_ref().set_read_timeout(Some(timeout))?;
        let result = read_response(&mut self.reader);
        self.reader.get_ref().set_read_timeout(None)?;

        match result {
            Ok(response @ Response::Push { .. }) => Ok(Some(response)),
            Ok(other) => Err(KvError::Protocol(format!("unexpected reply while idle: {:?}", other))),
            Err(KvError::Io(e)) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
