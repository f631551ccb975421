//! Which writes invalidate which watch queries
//!
//! Maps a mutating command name to the watchable commands whose results it
//! can change. A write that touches a watched key but is not listed here
//! (SADD against a GET watch, say) does not trigger a re-run.

use std::collections::HashMap;

use once_cell::sync::Lazy;

static AFFECTED_BY: Lazy<HashMap<&'static str, &'static [&'static str]>> = Lazy::new(|| {
    const STRING: &[&str] = &["GET"];
    const SET: &[&str] = &["SMEMBERS"];
    const ZSET: &[&str] = &["ZRANGE"];
    const HLL: &[&str] = &["PFCOUNT"];
    const ANY: &[&str] = &["GET", "SMEMBERS", "ZRANGE", "PFCOUNT"];

    let mut table: HashMap<&'static str, &'static [&'static str]> = HashMap::new();
    for name in [
        "SET", "GETSET", "GETDEL", "APPEND", "INCR", "DECR", "INCRBY", "DECRBY",
    ] {
        table.insert(name, STRING);
    }
    for name in ["SADD", "SREM"] {
        table.insert(name, SET);
    }
    for name in ["ZADD", "ZREM"] {
        table.insert(name, ZSET);
    }
    for name in ["PFADD", "PFMERGE"] {
        table.insert(name, HLL);
    }
    // Key-level operations change any watched value
    for name in [
        "DEL", "RENAME", "COPY", "EXPIRE", "PEXPIRE", "PERSIST", "FLUSHDB",
    ] {
        table.insert(name, ANY);
    }
    table
});

/// Whether `mutating` can change the result of a watch on `watched`
pub fn affects(mutating: &str, watched: &str) -> bool {
    AFFECTED_BY
        .get(mutating)
        .is_some_and(|names| names.contains(&watched))
}
