//! Local command handlers
//!
//! Global and Custom commands run on the connection's own thread and never
//! reach a shard.

use std::time::Duration;

use crossbeam::channel::{self, Sender};

use crate::auth::AuthSession;
use crate::context::Context;
use crate::error::{CommandError, KvError, Result};
use crate::protocol::{Command, Value};
use crate::shard::FatalSignal;

/// Connection state visible to local handlers
pub(super) struct LocalEnv<'a> {
    pub session: &'a mut AuthSession,
    pub global_errors: &'a Sender<FatalSignal>,
    pub client_id: u64,
    pub shard_count: usize,
}

pub(super) fn execute(ctx: &Context, command: &Command, env: LocalEnv<'_>) -> Result<Value> {
    let args = &command.args;
    match command.name.as_str() {
        "PING" => match args.as_slice() {
            [] => Ok(Value::str("PONG")),
            [msg] => Ok(Value::str(msg.as_str())),
            _ => Err(wrong_arity(command)),
        },
        "ECHO" => match args.as_slice() {
            [msg] => Ok(Value::str(msg.as_str())),
            _ => Err(wrong_arity(command)),
        },
        "HELLO" => Ok(hello(&env)),
        "SLEEP" => match args.as_slice() {
            [secs] => sleep(ctx, secs),
            _ => Err(wrong_arity(command)),
        },
        "AUTH" => {
            let (user, pass) = match args.as_slice() {
                [pass] => ("default", pass.as_str()),
                [user, pass] => (user.as_str(), pass.as_str()),
                _ => return Err(wrong_arity(command)),
            };
            env.session.validate(user, pass)?;
            Ok(Value::Ok)
        }
        "ABORT" => {
            tracing::warn!("ABORT received from client {}", env.client_id);
            env.global_errors
                .send(FatalSignal::Abort)
                .map_err(|_| KvError::Internal("supervisor is not running".into()))?;
            Ok(Value::Ok)
        }
        other => Err(KvError::Internal(format!("{} has no local handler", other))),
    }
}

fn hello(env: &LocalEnv<'_>) -> Value {
    Value::Array(vec![
        Value::str("server"),
        Value::str("shardkv"),
        Value::str("version"),
        Value::str(crate::VERSION),
        Value::str("id"),
        Value::Int(env.client_id as i64),
        Value::str("shards"),
        Value::Int(env.shard_count as i64),
    ])
}

/// Block for `secs` seconds unless the request is cancelled or times out first
fn sleep(ctx: &Context, secs: &str) -> Result<Value> {
    let secs: u64 = secs.parse().map_err(|_| CommandError::NotAnInteger)?;
    let wake = channel::after(Duration::from_secs(secs));
    let deadline = match ctx.remaining() {
        Some(left) => channel::after(left),
        None => channel::never(),
    };

    crossbeam::select! {
        recv(wake) -> _ => Ok(Value::Ok),
        recv(deadline) -> _ => Err(KvError::Timeout),
        recv(ctx.done()) -> _ => Err(KvError::Cancelled),
    }
}

fn wrong_arity(command: &Command) -> KvError {
    KvError::Command(CommandError::WrongArity(command.name.to_ascii_lowercase()))
}
