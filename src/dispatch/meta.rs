//! Command metadata
//!
//! The process-wide, read-only table mapping a command name to how it is
//! executed. Built once on first use and never mutated, so concurrent
//! lookups need no synchronization.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use super::plans::{
    AllOk, CopyPlan, KeysPlan, MgetPlan, MsetPlan, PerKeySum, RenamePlan, SetAlgebra, SetOp, ShardPlan,
    SumAll,
};
use crate::error::{KvError, Result};

/// How a command maps onto shards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdType {
    /// Runs locally, no shard involvement
    Global,

    /// One routing key, one sub-command
    SingleShard,

    /// Decomposed into independently routed sub-commands
    MultiShard,

    /// One identical sub-command sent to every shard
    AllShard,

    /// Local handler with access to session or server state
    Custom,

    /// `<CMD>.WATCH`
    Watch,

    /// `<CMD>.UNWATCH`
    Unwatch,
}

/// Static description of one command
pub struct CmdMeta {
    pub name: &'static str,
    pub cmd_type: CmdType,
    pub read_only: bool,
    /// Decompose/compose pair for MultiShard and AllShard commands
    pub plan: Option<Box<dyn ShardPlan>>,
}

impl CmdMeta {
    fn new(name: &'static str, cmd_type: CmdType, read_only: bool) -> Self {
        Self {
            name,
            cmd_type,
            read_only,
            plan: None,
        }
    }

    fn with_plan(mut self, plan: impl ShardPlan + 'static) -> Self {
        self.plan = Some(Box::new(plan));
        self
    }

    /// Whether reads must run before decomposition
    pub fn requires_preprocessing(&self) -> bool {
        self.plan.as_ref().is_some_and(|p| p.requires_preprocessing())
    }
}

/// Name → metadata
pub struct CommandTable {
    entries: HashMap<&'static str, CmdMeta>,
}

/// Commands that accept `.WATCH` / `.UNWATCH`
pub const WATCHABLE: &[&str] = &["GET", "ZRANGE", "SMEMBERS", "PFCOUNT"];

impl CommandTable {
    fn builtin() -> Self {
        use CmdType::*;

        let mut metas = vec![
            // Local
            CmdMeta::new("PING", Global, true),
            CmdMeta::new("ECHO", Global, true),
            CmdMeta::new("HELLO", Global, true),
            CmdMeta::new("SLEEP", Global, true),
            CmdMeta::new("AUTH", Custom, true),
            CmdMeta::new("ABORT", Custom, true),
            // Strings
            CmdMeta::new("GET", SingleShard, true),
            CmdMeta::new("SET", SingleShard, false),
            CmdMeta::new("GETDEL", SingleShard, false),
            CmdMeta::new("GETSET", SingleShard, false),
            CmdMeta::new("APPEND", SingleShard, false),
            CmdMeta::new("STRLEN", SingleShard, true),
            CmdMeta::new("INCR", SingleShard, false),
            CmdMeta::new("DECR", SingleShard, false),
            CmdMeta::new("INCRBY", SingleShard, false),
            CmdMeta::new("DECRBY", SingleShard, false),
            // Keyspace
            CmdMeta::new("TYPE", SingleShard, true),
            CmdMeta::new("EXPIRE", SingleShard, false),
            CmdMeta::new("PEXPIRE", SingleShard, false),
            CmdMeta::new("TTL", SingleShard, true),
            CmdMeta::new("PTTL", SingleShard, true),
            CmdMeta::new("PERSIST", SingleShard, false),
            // Sets
            CmdMeta::new("SADD", SingleShard, false),
            CmdMeta::new("SREM", SingleShard, false),
            CmdMeta::new("SMEMBERS", SingleShard, true),
            CmdMeta::new("SCARD", SingleShard, true),
            CmdMeta::new("SISMEMBER", SingleShard, true),
            // Sorted sets
            CmdMeta::new("ZADD", SingleShard, false),
            CmdMeta::new("ZREM", SingleShard, false),
            CmdMeta::new("ZCARD", SingleShard, true),
            CmdMeta::new("ZSCORE", SingleShard, true),
            CmdMeta::new("ZRANGE", SingleShard, true),
            // Cardinality
            CmdMeta::new("PFADD", SingleShard, false),
            CmdMeta::new("PFCOUNT", SingleShard, true),
            // Multi-key
            CmdMeta::new("MGET", MultiShard, true).with_plan(MgetPlan),
            CmdMeta::new("MSET", MultiShard, false).with_plan(MsetPlan),
            CmdMeta::new("DEL", MultiShard, false).with_plan(PerKeySum { name: "DEL" }),
            CmdMeta::new("EXISTS", MultiShard, true).with_plan(PerKeySum { name: "EXISTS" }),
            CmdMeta::new("TOUCH", MultiShard, true).with_plan(PerKeySum { name: "TOUCH" }),
            CmdMeta::new("RENAME", MultiShard, false).with_plan(RenamePlan),
            CmdMeta::new("COPY", MultiShard, false).with_plan(CopyPlan),
            CmdMeta::new("SINTER", MultiShard, true).with_plan(SetAlgebra(SetOp::Inter)),
            CmdMeta::new("SUNION", MultiShard, true).with_plan(SetAlgebra(SetOp::Union)),
            CmdMeta::new("SDIFF", MultiShard, true).with_plan(SetAlgebra(SetOp::Diff)),
            // Every shard
            CmdMeta::new("DBSIZE", AllShard, true).with_plan(SumAll),
            CmdMeta::new("KEYS", AllShard, true).with_plan(KeysPlan),
            CmdMeta::new("FLUSHDB", AllShard, false).with_plan(AllOk),
        ];

        for name in WATCHABLE {
            metas.push(CmdMeta::new(watch_name(name), Watch, true));
            metas.push(CmdMeta::new(unwatch_name(name), Unwatch, true));
        }

        Self {
            entries: metas.into_iter().map(|m| (m.name, m)).collect(),
        }
    }

    /// Exact, case-sensitive lookup
    pub fn get(&self, name: &str) -> Option<&CmdMeta> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a command changes data. Unknown commands count as writes.
    pub fn is_mutating(&self, name: &str) -> bool {
        self.get(name).map(|m| !m.read_only).unwrap_or(true)
    }

    /// Fail unless every MultiShard/AllShard command has a plan
    pub fn validate(&self) -> Result<()> {
        for meta in self.entries.values() {
            let needs_plan = matches!(meta.cmd_type, CmdType::MultiShard | CmdType::AllShard);
            if needs_plan && meta.plan.is_none() {
                return Err(KvError::Config(format!(
                    "command {} is {:?} but has no decompose/compose plan",
                    meta.name, meta.cmd_type
                )));
            }
            if !needs_plan && meta.plan.is_some() {
                return Err(KvError::Config(format!(
                    "command {} is {:?} but carries a shard plan",
                    meta.name, meta.cmd_type
                )));
            }
        }
        Ok(())
    }
}

static COMMAND_TABLE: Lazy<CommandTable> = Lazy::new(CommandTable::builtin);

/// The process-wide command table
pub fn command_table() -> &'static CommandTable {
    &COMMAND_TABLE
}

/// "GET" → "GET.WATCH", leaked once per watchable command at table build
fn watch_name(name: &str) -> &'static str {
    Box::leak(format!("{}.WATCH", name).into_boxed_str())
}

fn unwatch_name(name: &str) -> &'static str {
    Box::leak(format!("{}.UNWATCH", name).into_boxed_str())
}
