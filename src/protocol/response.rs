//! Response definitions
//!
//! Represents values and responses sent to clients.

use serde::{Deserialize, Serialize};

/// A command result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Nil,
    Ok,
    Int(i64),
    Str(String),
    Array(Vec<Value>),
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// A response frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// Normal reply to a request
    Reply(Value),

    /// Request-level error
    Error(String),

    /// Unsolicited watch update. `label` is the client-supplied watch label
    /// or the watched command's name.
    Push {
        label: String,
        fingerprint: u32,
        result: std::result::Result<Value, String>,
    },
}

impl Response {
    pub fn ok() -> Self {
        Response::Reply(Value::Ok)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Response::Error(message.into())
    }
}
