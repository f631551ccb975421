//! Command definitions
//!
//! Represents commands from clients.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A parsed command: a name plus ordered string arguments.
///
/// The name is matched case-sensitively against the command table, so
/// clients send it upper-cased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    pub args: Vec<String>,
}

impl Command {
    pub fn new<I, S>(name: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Command with no arguments
    pub fn bare(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Key used to pick the owning shard: the first argument, or the command
    /// name for argument-less commands
    pub fn routing_key(&self) -> &str {
        self.args.first().map(String::as_str).unwrap_or(&self.name)
    }

    /// Stable identity of a watch query.
    ///
    /// CRC32 over the name and arguments, each followed by a NUL so that
    /// `GET ab` and `GETA b` differ.
    pub fn fingerprint(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(self.name.as_bytes());
        hasher.update(&[0]);
        for arg in &self.args {
            hasher.update(arg.as_bytes());
            hasher.update(&[0]);
        }
        hasher.finalize()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// One client request as it travels over the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub commands: Vec<Command>,
}

impl Request {
    pub fn single(command: Command) -> Self {
        Self {
            commands: vec![command],
        }
    }
}
