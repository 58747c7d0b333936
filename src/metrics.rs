use std::time::Duration;

use rusqlite::Connection;
use serde::Serialize;
use time::OffsetDateTime;

use crate::cache::TtlCache;
use crate::error::ChatResult;

/// Counters and timings live in the TTL cache for a day, so they survive
/// nothing and cost nothing; the durable totals come from the ledger.
const METRIC_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const TIMING_WINDOW: usize = 1000;

pub fn increment(cache: &TtlCache, key: &str, amount: i64) {
    let value = counter(cache, key) + amount;
    cache.set_ex(key, value.to_string(), METRIC_TTL);
    tracing::debug!(key, value, "metric incremented");
}

pub fn counter(cache: &TtlCache, key: &str) -> i64 {
    cache
        .get(key)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0)
}

pub fn timing(cache: &TtlCache, key: &str, milliseconds: f64) {
    let timings_key = format!("{}_timings", key);
    let mut timings: Vec<f64> = cache
        .get(&timings_key)
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();
    timings.push(milliseconds);
    if timings.len() > TIMING_WINDOW {
        timings.drain(..timings.len() - TIMING_WINDOW);
    }
    if let Ok(raw) = serde_json::to_string(&timings) {
        cache.set_ex(timings_key, raw, METRIC_TTL);
    }
    tracing::debug!(key, duration_ms = milliseconds, "metric timing");
}

pub fn avg_timing(cache: &TtlCache, key: &str) -> f64 {
    let timings: Vec<f64> = cache
        .get(&format!("{}_timings", key))
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();
    if timings.is_empty() {
        return 0.0;
    }
    let avg = timings.iter().sum::<f64>() / timings.len() as f64;
    (avg * 100.0).round() / 100.0
}

#[derive(Debug, Serialize)]
pub struct Snapshot {
    pub users: UserStats,
    pub chats: ChatStats,
    pub messages: MessageStats,
    pub timestamp: i64,
}

#[derive(Debug, Serialize)]
pub struct UserStats {
    pub total: i64,
    pub online: i64,
}

#[derive(Debug, Serialize)]
pub struct ChatStats {
    pub total: i64,
}

#[derive(Debug, Serialize)]
pub struct MessageStats {
    pub total: i64,
    pub today: i64,
    pub sent: i64,
    pub avg_send_duration_ms: f64,
}

pub fn snapshot(conn: &Connection, cache: &TtlCache) -> ChatResult<Snapshot> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let day_start = now - now.rem_euclid(86_400);
    let users_total: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?;
    let users_online: i64 = conn.query_row(
        "SELECT COUNT(*) FROM users WHERE is_online = 1",
        [],
        |r| r.get(0),
    )?;
    let chats_total: i64 = conn.query_row("SELECT COUNT(*) FROM chats", [], |r| r.get(0))?;
    let messages_total: i64 =
        conn.query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))?;
    let messages_today: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE created_at >= ?1",
        [day_start],
        |r| r.get(0),
    )?;
    Ok(Snapshot {
        users: UserStats {
            total: users_total,
            online: users_online,
        },
        chats: ChatStats { total: chats_total },
        messages: MessageStats {
            total: messages_total,
            today: messages_today,
            sent: counter(cache, "messages.sent"),
            avg_send_duration_ms: avg_timing(cache, "messages.send_duration"),
        },
        timestamp: now,
    })
}
