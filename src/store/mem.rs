//! In-memory store
//!
//! HashMap-backed partition with strings, sets and sorted sets, plus TTLs.
//! Enough of each data type to run the server end to end; full data-type
//! semantics live outside this crate.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

use crate::error::CommandError;
use crate::protocol::{Command, Value};

use super::{glob_match, Store, StoreResult};

type CmdResult = std::result::Result<Value, CommandError>;

#[derive(Debug, Clone)]
enum Data {
    Str(String),
    Set(BTreeSet<String>),
    ZSet(BTreeMap<String, f64>),
    /// Distinct-element register behind PFADD/PFCOUNT. Counts are exact.
    Hll(BTreeSet<String>),
}

impl Data {
    fn type_name(&self) -> &'static str {
        match self {
            Data::Str(_) => "string",
            Data::Set(_) => "set",
            Data::ZSet(_) => "zset",
            Data::Hll(_) => "string",
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    data: Data,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(data: Data) -> Self {
        Self {
            data,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// In-memory partition owned by one shard
#[derive(Debug, Default)]
pub struct MemStore {
    entries: HashMap<String, Entry>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.values().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // =========================================================================
    // Key access helpers
    // =========================================================================

    /// Drop `key` if its TTL has elapsed
    fn expire_if_needed(&mut self, key: &str) {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.entries.remove(key);
        }
    }

    fn get_live(&mut self, key: &str) -> Option<&mut Entry> {
        self.expire_if_needed(key);
        self.entries.get_mut(key)
    }

    fn get_str(&mut self, key: &str) -> Result<Option<&mut String>, CommandError> {
        match self.get_live(key) {
            None => Ok(None),
            Some(Entry { data: Data::Str(s), .. }) => Ok(Some(s)),
            Some(_) => Err(CommandError::WrongType),
        }
    }

    fn get_set(&mut self, key: &str, create: bool) -> Result<Option<&mut BTreeSet<String>>, CommandError> {
        self.expire_if_needed(key);
        if create && !self.entries.contains_key(key) {
            self.entries
                .insert(key.to_string(), Entry::new(Data::Set(BTreeSet::new())));
        }
        match self.entries.get_mut(key) {
            None => Ok(None),
            Some(Entry { data: Data::Set(s), .. }) => Ok(Some(s)),
            Some(_) => Err(CommandError::WrongType),
        }
    }

    fn get_zset(&mut self, key: &str, create: bool) -> Result<Option<&mut BTreeMap<String, f64>>, CommandError> {
        self.expire_if_needed(key);
        if create && !self.entries.contains_key(key) {
            self.entries
                .insert(key.to_string(), Entry::new(Data::ZSet(BTreeMap::new())));
        }
        match self.entries.get_mut(key) {
            None => Ok(None),
            Some(Entry { data: Data::ZSet(z), .. }) => Ok(Some(z)),
            Some(_) => Err(CommandError::WrongType),
        }
    }

    /// Remove collection keys that became empty
    fn drop_if_empty(&mut self, key: &str) {
        let empty = match self.entries.get(key).map(|e| &e.data) {
            Some(Data::Set(s)) => s.is_empty(),
            Some(Data::ZSet(z)) => z.is_empty(),
            _ => false,
        };
        if empty {
            self.entries.remove(key);
        }
    }

    // =========================================================================
    // Strings
    // =========================================================================

    fn get(&mut self, args: &[String]) -> CmdResult {
        Ok(self
            .get_str(&args[0])?
            .map(|s| Value::Str(s.clone()))
            .unwrap_or(Value::Nil))
    }

    fn set(&mut self, args: &[String]) -> CmdResult {
        let key = &args[0];
        let mut expires_at = None;
        let mut nx = false;
        let mut xx = false;

        let mut i = 2;
        while i < args.len() {
            match args[i].to_ascii_uppercase().as_str() {
                "NX" => nx = true,
                "XX" => xx = true,
                opt @ ("EX" | "PX") => {
                    let amount = args.get(i + 1).ok_or(CommandError::Syntax)?;
                    let unit = if opt == "EX" {
                        Duration::from_secs(1)
                    } else {
                        Duration::from_millis(1)
                    };
                    let deadline = Some(parse_int(amount)?)
                        .filter(|&n| n > 0)
                        .and_then(|n| expiry_after(n, unit))
                        .ok_or_else(|| {
                            CommandError::InvalidArgument("invalid expire time in 'set' command".into())
                        })?;
                    expires_at = Some(deadline);
                    i += 1;
                }
                _ => return Err(CommandError::Syntax),
            }
            i += 1;
        }
        if nx && xx {
            return Err(CommandError::Syntax);
        }

        self.expire_if_needed(key);
        let exists = self.entries.contains_key(key);
        if (nx && exists) || (xx && !exists) {
            return Ok(Value::Nil);
        }

        let mut entry = Entry::new(Data::Str(args[1].clone()));
        entry.expires_at = expires_at;
        self.entries.insert(key.clone(), entry);
        Ok(Value::Ok)
    }

    fn getdel(&mut self, args: &[String]) -> CmdResult {
        let value = self.get(args)?;
        if !value.is_nil() {
            self.entries.remove(&args[0]);
        }
        Ok(value)
    }

    fn getset(&mut self, args: &[String]) -> CmdResult {
        let old = self.get(&args[..1])?;
        self.entries
            .insert(args[0].clone(), Entry::new(Data::Str(args[1].clone())));
        Ok(old)
    }

    fn append(&mut self, args: &[String]) -> CmdResult {
        match self.get_str(&args[0])? {
            Some(s) => {
                s.push_str(&args[1]);
                Ok(Value::Int(s.len() as i64))
            }
            None => {
                self.entries
                    .insert(args[0].clone(), Entry::new(Data::Str(args[1].clone())));
                Ok(Value::Int(args[1].len() as i64))
            }
        }
    }

    fn strlen(&mut self, args: &[String]) -> CmdResult {
        Ok(Value::Int(
            self.get_str(&args[0])?.map(|s| s.len() as i64).unwrap_or(0),
        ))
    }

    fn incr_by(&mut self, key: &str, delta: i64) -> CmdResult {
        match self.get_str(key)? {
            Some(s) => {
                let current = parse_int(s)?;
                let next = current.checked_add(delta).ok_or(CommandError::NotAnInteger)?;
                *s = next.to_string();
                Ok(Value::Int(next))
            }
            None => {
                self.entries
                    .insert(key.to_string(), Entry::new(Data::Str(delta.to_string())));
                Ok(Value::Int(delta))
            }
        }
    }

    // =========================================================================
    // Generic keyspace
    // =========================================================================

    fn del(&mut self, args: &[String]) -> CmdResult {
        let mut removed = 0;
        for key in args {
            self.expire_if_needed(key);
            if self.entries.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(Value::Int(removed))
    }

    fn exists(&mut self, args: &[String]) -> CmdResult {
        let mut count = 0;
        for key in args {
            if self.get_live(key).is_some() {
                count += 1;
            }
        }
        Ok(Value::Int(count))
    }

    fn key_type(&mut self, args: &[String]) -> CmdResult {
        Ok(Value::str(
            self.get_live(&args[0])
                .map(|e| e.data.type_name())
                .unwrap_or("none"),
        ))
    }

    fn expire(&mut self, args: &[String], unit: Duration) -> CmdResult {
        let amount = parse_int(&args[1])?;
        let key = args[0].clone();
        if self.get_live(&key).is_none() {
            return Ok(Value::Int(0));
        }
        if amount <= 0 {
            self.entries.remove(&key);
            return Ok(Value::Int(1));
        }
        let deadline = expiry_after(amount, unit).ok_or(CommandError::NotAnInteger)?;
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.expires_at = Some(deadline);
        }
        Ok(Value::Int(1))
    }

    fn ttl(&mut self, args: &[String], millis: bool) -> CmdResult {
        let now = Instant::now();
        Ok(Value::Int(match self.get_live(&args[0]) {
            None => -2,
            Some(Entry { expires_at: None, .. }) => -1,
            Some(Entry { expires_at: Some(at), .. }) => {
                let left = at.saturating_duration_since(now);
                if millis {
                    left.as_millis() as i64
                } else {
                    // Round up so a fresh EX 10 reports 10
                    ((left.as_millis() + 999) / 1000) as i64
                }
            }
        }))
    }

    fn persist(&mut self, args: &[String]) -> CmdResult {
        Ok(Value::Int(match self.get_live(&args[0]) {
            Some(entry) if entry.expires_at.is_some() => {
                entry.expires_at = None;
                1
            }
            _ => 0,
        }))
    }

    fn keys(&mut self, args: &[String]) -> CmdResult {
        let now = Instant::now();
        let mut keys: Vec<&String> = self
            .entries
            .iter()
            .filter(|(k, e)| !e.is_expired(now) && glob_match(&args[0], k))
            .map(|(k, _)| k)
            .collect();
        keys.sort();
        Ok(Value::Array(keys.into_iter().map(|k| Value::Str(k.clone())).collect()))
    }

    // =========================================================================
    // Sets
    // =========================================================================

    fn sadd(&mut self, args: &[String]) -> CmdResult {
        let set = self.get_set(&args[0], true)?.ok_or(CommandError::NoSuchKey)?;
        let added = args[1..].iter().filter(|m| set.insert((*m).clone())).count();
        Ok(Value::Int(added as i64))
    }

    fn srem(&mut self, args: &[String]) -> CmdResult {
        let removed = match self.get_set(&args[0], false)? {
            Some(set) => args[1..].iter().filter(|m| set.remove(m.as_str())).count(),
            None => 0,
        };
        self.drop_if_empty(&args[0]);
        Ok(Value::Int(removed as i64))
    }

    fn smembers(&mut self, args: &[String]) -> CmdResult {
        Ok(Value::Array(
            self.get_set(&args[0], false)?
                .map(|s| s.iter().map(|m| Value::Str(m.clone())).collect())
                .unwrap_or_default(),
        ))
    }

    fn scard(&mut self, args: &[String]) -> CmdResult {
        Ok(Value::Int(
            self.get_set(&args[0], false)?.map(|s| s.len() as i64).unwrap_or(0),
        ))
    }

    fn sismember(&mut self, args: &[String]) -> CmdResult {
        let found = self
            .get_set(&args[0], false)?
            .is_some_and(|s| s.contains(&args[1]));
        Ok(Value::Int(found as i64))
    }

    // =========================================================================
    // Cardinality
    // =========================================================================

    fn pfadd(&mut self, args: &[String]) -> CmdResult {
        let key = &args[0];
        self.expire_if_needed(key);
        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| Entry::new(Data::Hll(BTreeSet::new())));
        let Data::Hll(register) = &mut entry.data else {
            return Err(CommandError::WrongType);
        };
        let before = register.len();
        register.extend(args[1..].iter().cloned());
        Ok(Value::Int((register.len() != before) as i64))
    }

    fn pfcount(&mut self, args: &[String]) -> CmdResult {
        match self.get_live(&args[0]) {
            None => Ok(Value::Int(0)),
            Some(Entry { data: Data::Hll(r), .. }) => Ok(Value::Int(r.len() as i64)),
            Some(_) => Err(CommandError::WrongType),
        }
    }

    // =========================================================================
    // Sorted sets
    // =========================================================================

    fn zadd(&mut self, args: &[String]) -> CmdResult {
        if args.len() % 2 == 0 {
            return Err(CommandError::Syntax);
        }
        let mut pairs = Vec::with_capacity(args.len() / 2);
        for pair in args[1..].chunks(2) {
            let score: f64 = pair[0]
                .parse()
                .map_err(|_| CommandError::InvalidArgument("value is not a valid float".into()))?;
            if score.is_nan() {
                return Err(CommandError::InvalidArgument("value is not a valid float".into()));
            }
            pairs.push((pair[1].clone(), score));
        }
        let zset = self.get_zset(&args[0], true)?.ok_or(CommandError::NoSuchKey)?;
        let mut added = 0;
        for (member, score) in pairs {
            if zset.insert(member, score).is_none() {
                added += 1;
            }
        }
        Ok(Value::Int(added))
    }

    fn zrem(&mut self, args: &[String]) -> CmdResult {
        let removed = match self.get_zset(&args[0], false)? {
            Some(z) => args[1..].iter().filter(|m| z.remove(m.as_str()).is_some()).count(),
            None => 0,
        };
        self.drop_if_empty(&args[0]);
        Ok(Value::Int(removed as i64))
    }

    fn zcard(&mut self, args: &[String]) -> CmdResult {
        Ok(Value::Int(
            self.get_zset(&args[0], false)?.map(|z| z.len() as i64).unwrap_or(0),
        ))
    }

    fn zscore(&mut self, args: &[String]) -> CmdResult {
        Ok(self
            .get_zset(&args[0], false)?
            .and_then(|z| z.get(&args[1]).copied())
            .map(|s| Value::Str(format_score(s)))
            .unwrap_or(Value::Nil))
    }

    fn zrange(&mut self, args: &[String]) -> CmdResult {
        let start = parse_int(&args[1])?;
        let stop = parse_int(&args[2])?;
        let with_scores = match args.get(3) {
            None => false,
            Some(opt) if opt.eq_ignore_ascii_case("WITHSCORES") && args.len() == 4 => true,
            Some(_) => return Err(CommandError::Syntax),
        };

        let Some(zset) = self.get_zset(&args[0], false)? else {
            return Ok(Value::Array(Vec::new()));
        };
        let mut ordered: Vec<(&String, f64)> = zset.iter().map(|(m, s)| (m, *s)).collect();
        ordered.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));

        let len = ordered.len() as i64;
        let start = if start < 0 { (len + start).max(0) } else { start };
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if start > stop || start >= len {
            return Ok(Value::Array(Vec::new()));
        }

        let mut out = Vec::new();
        for (member, score) in &ordered[start as usize..=stop as usize] {
            out.push(Value::Str((*member).clone()));
            if with_scores {
                out.push(Value::Str(format_score(*score)));
            }
        }
        Ok(Value::Array(out))
    }

    fn dispatch(&mut self, command: &Command) -> CmdResult {
        let args = &command.args;
        let name = command.name.as_str();
        match name {
            "GET" => arity(name, args, 1, Some(1)).and_then(|_| self.get(args)),
            "SET" => arity(name, args, 2, None).and_then(|_| self.set(args)),
            "GETDEL" => arity(name, args, 1, Some(1)).and_then(|_| self.getdel(args)),
            "GETSET" => arity(name, args, 2, Some(2)).and_then(|_| self.getset(args)),
            "APPEND" => arity(name, args, 2, Some(2)).and_then(|_| self.append(args)),
            "STRLEN" => arity(name, args, 1, Some(1)).and_then(|_| self.strlen(args)),
            "INCR" => arity(name, args, 1, Some(1)).and_then(|_| self.incr_by(&args[0], 1)),
            "DECR" => arity(name, args, 1, Some(1)).and_then(|_| self.incr_by(&args[0], -1)),
            "INCRBY" => {
                arity(name, args, 2, Some(2))?;
                let delta = parse_int(&args[1])?;
                self.incr_by(&args[0], delta)
            }
            "DECRBY" => {
                arity(name, args, 2, Some(2))?;
                let delta = parse_int(&args[1])?
                    .checked_neg()
                    .ok_or(CommandError::NotAnInteger)?;
                self.incr_by(&args[0], delta)
            }
            "DEL" => arity(name, args, 1, None).and_then(|_| self.del(args)),
            "EXISTS" | "TOUCH" => arity(name, args, 1, None).and_then(|_| self.exists(args)),
            "TYPE" => arity(name, args, 1, Some(1)).and_then(|_| self.key_type(args)),
            "EXPIRE" => arity(name, args, 2, Some(2))
                .and_then(|_| self.expire(args, Duration::from_secs(1))),
            "PEXPIRE" => arity(name, args, 2, Some(2))
                .and_then(|_| self.expire(args, Duration::from_millis(1))),
            "TTL" => arity(name, args, 1, Some(1)).and_then(|_| self.ttl(args, false)),
            "PTTL" => arity(name, args, 1, Some(1)).and_then(|_| self.ttl(args, true)),
            "PERSIST" => arity(name, args, 1, Some(1)).and_then(|_| self.persist(args)),
            "KEYS" => arity(name, args, 1, Some(1)).and_then(|_| self.keys(args)),
            "DBSIZE" => arity(name, args, 0, Some(0)).map(|_| Value::Int(self.len() as i64)),
            "FLUSHDB" => {
                arity(name, args, 0, Some(0))?;
                self.entries.clear();
                Ok(Value::Ok)
            }
            "SADD" => arity(name, args, 2, None).and_then(|_| self.sadd(args)),
            "SREM" => arity(name, args, 2, None).and_then(|_| self.srem(args)),
            "SMEMBERS" => arity(name, args, 1, Some(1)).and_then(|_| self.smembers(args)),
            "SCARD" => arity(name, args, 1, Some(1)).and_then(|_| self.scard(args)),
            "SISMEMBER" => arity(name, args, 2, Some(2)).and_then(|_| self.sismember(args)),
            "ZADD" => arity(name, args, 3, None).and_then(|_| self.zadd(args)),
            "ZREM" => arity(name, args, 2, None).and_then(|_| self.zrem(args)),
            "ZCARD" => arity(name, args, 1, Some(1)).and_then(|_| self.zcard(args)),
            "ZSCORE" => arity(name, args, 2, Some(2)).and_then(|_| self.zscore(args)),
            "ZRANGE" => arity(name, args, 3, Some(4)).and_then(|_| self.zrange(args)),
            "PFADD" => arity(name, args, 1, None).and_then(|_| self.pfadd(args)),
            "PFCOUNT" => arity(name, args, 1, Some(1)).and_then(|_| self.pfcount(args)),
            _ => Err(CommandError::UnknownCommand(command.name.clone())),
        }
    }
}

impl Store for MemStore {
    fn execute(&mut self, command: &Command) -> StoreResult {
        self.dispatch(command).map_err(Into::into)
    }

    fn sweep_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before - self.entries.len()
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn arity(name: &str, args: &[String], min: usize, max: Option<usize>) -> Result<(), CommandError> {
    if args.len() < min || max.is_some_and(|m| args.len() > m) {
        return Err(CommandError::WrongArity(name.to_ascii_lowercase()));
    }
    Ok(())
}

fn parse_int(s: &str) -> Result<i64, CommandError> {
    s.parse().map_err(|_| CommandError::NotAnInteger)
}

/// Deadline `amount` units from now, or `None` if it does not fit
fn expiry_after(amount: i64, unit: Duration) -> Option<Instant> {
    let ttl = u32::try_from(amount).ok().and_then(|n| unit.checked_mul(n))?;
    Instant::now().checked_add(ttl)
}

fn format_score(score: f64) -> String {
    format!("{}", score)
}
