//! Shard plans
//!
//! Decompose/compose pairs for commands that span more than one shard.
//! Decomposition is a pure rewrite of the client command (plus any values
//! fetched during preprocessing); composition folds the gathered
//! per-shard responses back into one reply.

use std::collections::{BTreeSet, HashMap};

use crate::error::{CommandError, KvError, Result};
use crate::protocol::{Command, Value};
use crate::shard::StoreResponse;

/// Decompose/compose pair attached to a MultiShard or AllShard command
pub trait ShardPlan: Send + Sync {
    /// Whether [`preprocess`](Self::preprocess) issues reads
    fn requires_preprocessing(&self) -> bool {
        false
    }

    /// Non-mutating reads whose results feed [`decompose`](Self::decompose)
    fn preprocess(&self, _command: &Command) -> Result<Vec<Command>> {
        Ok(Vec::new())
    }

    /// Split `command` into single-shard sub-commands. `fetched` holds the
    /// preprocessing responses ordered by `seq_id`.
    ///
    /// For AllShard commands the single returned command is broadcast.
    fn decompose(&self, command: &Command, _fetched: &[StoreResponse]) -> Result<Vec<Command>> {
        Ok(vec![command.clone()])
    }

    /// Fold every gathered response into the client reply
    fn compose(&self, command: &Command, responses: Vec<StoreResponse>) -> Result<Value>;
}

// =============================================================================
// Helpers
// =============================================================================

fn by_seq(mut responses: Vec<StoreResponse>) -> Vec<StoreResponse> {
    responses.sort_by_key(|r| r.seq_id);
    responses
}

/// First error in `seq_id` order, as a command error
fn first_error(responses: &[StoreResponse]) -> Result<()> {
    match responses.iter().find_map(|r| r.result.as_ref().err()) {
        Some(e) => Err(KvError::Command(e.clone())),
        None => Ok(()),
    }
}

fn wrong_arity(command: &Command) -> KvError {
    KvError::Command(CommandError::WrongArity(command.name.to_ascii_lowercase()))
}

fn sum(responses: &[StoreResponse]) -> Result<Value> {
    first_error(responses)?;
    let total = responses
        .iter()
        .map(|r| match &r.result {
            Ok(Value::Int(n)) => Ok(*n),
            other => Err(KvError::Internal(format!("expected integer from shard, got {:?}", other))),
        })
        .sum::<Result<i64>>()?;
    Ok(Value::Int(total))
}

fn per_key(name: &str, keys: &[String]) -> Vec<Command> {
    keys.iter().map(|k| Command::new(name, [k.as_str()])).collect()
}

/// Result of the preprocessing read at `index`
fn fetched_value(fetched: &[StoreResponse], index: usize) -> Result<&Value> {
    let response = fetched
        .get(index)
        .ok_or_else(|| KvError::Internal(format!("missing preprocessing response {}", index)))?;
    response.result.as_ref().map_err(|e| KvError::Command(e.clone()))
}

// =============================================================================
// Multi-key plans
// =============================================================================

/// `MGET k1 k2 ...`: one GET per key, values in key order, errors read as nil
pub struct MgetPlan;

impl ShardPlan for MgetPlan {
    fn decompose(&self, command: &Command, _fetched: &[StoreResponse]) -> Result<Vec<Command>> {
        if command.args.is_empty() {
            return Err(wrong_arity(command));
        }
        Ok(per_key("GET", &command.args))
    }

    fn compose(&self, _command: &Command, responses: Vec<StoreResponse>) -> Result<Value> {
        Ok(Value::Array(
            by_seq(responses)
                .into_iter()
                .map(|r| r.result.unwrap_or(Value::Nil))
                .collect(),
        ))
    }
}

/// `MSET k1 v1 k2 v2 ...`: one SET per pair, OK only if every SET succeeded.
/// Not atomic across keys.
pub struct MsetPlan;

impl ShardPlan for MsetPlan {
    fn decompose(&self, command: &Command, _fetched: &[StoreResponse]) -> Result<Vec<Command>> {
        if command.args.is_empty() || command.args.len() % 2 != 0 {
            return Err(wrong_arity(command));
        }
        Ok(command
            .args
            .chunks(2)
            .map(|pair| Command::new("SET", [pair[0].as_str(), pair[1].as_str()]))
            .collect())
    }

    fn compose(&self, _command: &Command, responses: Vec<StoreResponse>) -> Result<Value> {
        first_error(&by_seq(responses))?;
        Ok(Value::Ok)
    }
}

/// DEL / EXISTS / TOUCH: the same command per key, integer replies summed
pub struct PerKeySum {
    pub name: &'static str,
}

impl ShardPlan for PerKeySum {
    fn decompose(&self, command: &Command, _fetched: &[StoreResponse]) -> Result<Vec<Command>> {
        if command.args.is_empty() {
            return Err(wrong_arity(command));
        }
        Ok(per_key(self.name, &command.args))
    }

    fn compose(&self, _command: &Command, responses: Vec<StoreResponse>) -> Result<Value> {
        sum(&by_seq(responses))
    }
}

/// `RENAME src dst`: read src, then DEL src and SET dst.
/// String values only; the TTL is not carried.
pub struct RenamePlan;

impl ShardPlan for RenamePlan {
    fn requires_preprocessing(&self) -> bool {
        true
    }

    fn preprocess(&self, command: &Command) -> Result<Vec<Command>> {
        if command.args.len() != 2 {
            return Err(wrong_arity(command));
        }
        Ok(vec![Command::new("GET", [command.args[0].as_str()])])
    }

    fn decompose(&self, command: &Command, fetched: &[StoreResponse]) -> Result<Vec<Command>> {
        let (src, dst) = (command.args[0].as_str(), command.args[1].as_str());
        let value = match fetched_value(fetched, 0)? {
            Value::Str(v) => v.clone(),
            _ => return Err(KvError::Command(CommandError::NoSuchKey)),
        };
        if src == dst {
            return Ok(vec![Command::new("EXISTS", [src])]);
        }
        Ok(vec![
            Command::new("DEL", [src]),
            Command::new("SET", [dst, value.as_str()]),
        ])
    }

    fn compose(&self, _command: &Command, responses: Vec<StoreResponse>) -> Result<Value> {
        first_error(&by_seq(responses))?;
        Ok(Value::Ok)
    }
}

/// `COPY src dst [REPLACE]`: read src and check dst, then SET dst.
/// Replies 1 when copied; 0 (as a fallback) when src is missing or dst
/// exists without REPLACE.
pub struct CopyPlan;

impl CopyPlan {
    fn replace(command: &Command) -> Result<bool> {
        match command.args.get(2) {
            None => Ok(false),
            Some(opt) if opt.eq_ignore_ascii_case("REPLACE") => Ok(true),
            Some(_) => Err(KvError::Command(CommandError::Syntax)),
        }
    }
}

impl ShardPlan for CopyPlan {
    fn requires_preprocessing(&self) -> bool {
        true
    }

    fn preprocess(&self, command: &Command) -> Result<Vec<Command>> {
        if !(2..=3).contains(&command.args.len()) {
            return Err(wrong_arity(command));
        }
        Self::replace(command)?;
        Ok(vec![
            Command::new("GET", [command.args[0].as_str()]),
            Command::new("EXISTS", [command.args[1].as_str()]),
        ])
    }

    fn decompose(&self, command: &Command, fetched: &[StoreResponse]) -> Result<Vec<Command>> {
        let value = match fetched_value(fetched, 0)? {
            Value::Str(v) => v.clone(),
            _ => return Err(KvError::PreProcess { fallback: Value::Int(0) }),
        };
        let dst_exists = fetched_value(fetched, 1)?.as_int().unwrap_or(0) > 0;
        if dst_exists && !Self::replace(command)? {
            return Err(KvError::PreProcess { fallback: Value::Int(0) });
        }
        Ok(vec![Command::new("SET", [command.args[1].as_str(), value.as_str()])])
    }

    fn compose(&self, _command: &Command, responses: Vec<StoreResponse>) -> Result<Value> {
        first_error(&by_seq(responses))?;
        Ok(Value::Int(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOp {
    Inter,
    Union,
    /// Members present in exactly one of the sets
    Diff,
}

/// SINTER / SUNION / SDIFF over SMEMBERS of each key
pub struct SetAlgebra(pub SetOp);

impl SetAlgebra {
    fn members(response: &StoreResponse) -> Result<BTreeSet<String>> {
        match &response.result {
            Ok(Value::Array(items)) => items
                .iter()
                .map(|v| match v {
                    Value::Str(s) => Ok(s.clone()),
                    other => Err(KvError::Internal(format!("unexpected set member {:?}", other))),
                })
                .collect(),
            Ok(other) => Err(KvError::Internal(format!("unexpected SMEMBERS reply {:?}", other))),
            Err(e) => Err(KvError::Command(e.clone())),
        }
    }

    /// Walk the smallest set, keep members every other set contains
    fn intersect(mut sets: Vec<BTreeSet<String>>) -> BTreeSet<String> {
        sets.sort_by_key(BTreeSet::len);
        let Some((smallest, rest)) = sets.split_first() else {
            return BTreeSet::new();
        };
        smallest
            .iter()
            .filter(|m| rest.iter().all(|s| s.contains(*m)))
            .cloned()
            .collect()
    }

    fn count_once(sets: Vec<BTreeSet<String>>) -> BTreeSet<String> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for member in sets.into_iter().flatten() {
            *counts.entry(member).or_default() += 1;
        }
        counts
            .into_iter()
            .filter(|(_, n)| *n == 1)
            .map(|(m, _)| m)
            .collect()
    }
}

impl ShardPlan for SetAlgebra {
    fn decompose(&self, command: &Command, _fetched: &[StoreResponse]) -> Result<Vec<Command>> {
        if command.args.is_empty() {
            return Err(wrong_arity(command));
        }
        Ok(per_key("SMEMBERS", &command.args))
    }

    fn compose(&self, _command: &Command, responses: Vec<StoreResponse>) -> Result<Value> {
        let responses = by_seq(responses);
        first_error(&responses)?;
        let sets = responses.iter().map(Self::members).collect::<Result<Vec<_>>>()?;

        let result = match self.0 {
            SetOp::Inter => Self::intersect(sets),
            SetOp::Union => sets.into_iter().flatten().collect(),
            SetOp::Diff => Self::count_once(sets),
        };
        Ok(Value::Array(result.into_iter().map(Value::Str).collect()))
    }
}

// =============================================================================
// All-shard plans
// =============================================================================

/// DBSIZE: per-shard counts summed
pub struct SumAll;

impl ShardPlan for SumAll {
    fn compose(&self, _command: &Command, responses: Vec<StoreResponse>) -> Result<Value> {
        sum(&by_seq(responses))
    }
}

/// KEYS: per-shard matches concatenated in shard order
pub struct KeysPlan;

impl ShardPlan for KeysPlan {
    fn compose(&self, _command: &Command, responses: Vec<StoreResponse>) -> Result<Value> {
        let responses = by_seq(responses);
        first_error(&responses)?;
        let mut keys = Vec::new();
        for response in responses {
            match response.result {
                Ok(Value::Array(items)) => keys.extend(items),
                other => {
                    return Err(KvError::Internal(format!("unexpected KEYS reply {:?}", other)));
                }
            }
        }
        Ok(Value::Array(keys))
    }
}

/// FLUSHDB: OK once every shard is flushed
pub struct AllOk;

impl ShardPlan for AllOk {
    fn compose(&self, _command: &Command, responses: Vec<StoreResponse>) -> Result<Value> {
        first_error(&by_seq(responses))?;
        Ok(Value::Ok)
    }
}
