use std::sync::Arc;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::cache::TtlCache;
use crate::error::{ChatError, ChatResult};
use crate::model::UserSummary;

pub const PRESENCE_TTL: Duration = Duration::from_secs(300);
pub const TYPING_TTL: Duration = Duration::from_secs(5);

/// Ephemeral online record, JSON-encoded under `user:online:{id}`.
#[derive(Serialize, Deserialize)]
struct OnlineRecord {
    status: String,
    last_seen: i64,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct Presence {
    pub is_online: bool,
    pub last_seen_at: Option<i64>,
}

/// Online/typing state over an injected TTL store, with a durable fallback
/// for `last_seen_at`.
///
/// The ephemeral record is authoritative while it lives: its absence means
/// offline even when the durable flag still says online, because the durable
/// flag is only touched on explicit transitions, never by a timeout sweep.
#[derive(Clone)]
pub struct PresenceStore {
    cache: Arc<TtlCache>,
    presence_ttl: Duration,
    typing_ttl: Duration,
}

impl PresenceStore {
    pub fn new(cache: Arc<TtlCache>) -> Self {
        Self::with_ttls(cache, PRESENCE_TTL, TYPING_TTL)
    }

    /// TTL windows are injectable so tests can run in milliseconds.
    pub fn with_ttls(cache: Arc<TtlCache>, presence_ttl: Duration, typing_ttl: Duration) -> Self {
        Self {
            cache,
            presence_ttl,
            typing_ttl,
        }
    }

    fn online_key(user_id: i64) -> String {
        format!("user:online:{}", user_id)
    }

    fn typing_key(chat_id: &Uuid, user_id: i64) -> String {
        format!("chat:{}:typing:{}", chat_id, user_id)
    }

    /// Dual-write: refresh or delete the ephemeral record, then persist the
    /// transition on the user row.
    pub fn set_online(
        &self,
        conn: &Connection,
        user_id: i64,
        online: bool,
    ) -> ChatResult<Presence> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        if online {
            let record = OnlineRecord {
                status: "online".into(),
                last_seen: now,
            };
            let payload = serde_json::to_string(&record)
                .map_err(|e| ChatError::Internal(e.into()))?;
            self.cache
                .set_ex(Self::online_key(user_id), payload, self.presence_ttl);
        } else {
            self.cache.del(&Self::online_key(user_id));
        }
        let changed = conn.execute(
            "UPDATE users SET is_online = ?2, last_seen_at = ?3 WHERE id = ?1",
            params![user_id, online as i64, now],
        )?;
        if changed == 0 {
            return Err(ChatError::NotFound);
        }
        Ok(Presence {
            is_online: online,
            last_seen_at: Some(now),
        })
    }

    /// Live record wins; once it has expired the user reads as offline with
    /// the durable `last_seen_at`.
    pub fn presence(&self, conn: &Connection, user_id: i64) -> ChatResult<Presence> {
        if let Some(rec) = self.online_record(user_id) {
            return Ok(Presence {
                is_online: true,
                last_seen_at: Some(rec.last_seen),
            });
        }
        let last_seen: Option<i64> = conn
            .query_row(
                "SELECT last_seen_at FROM users WHERE id = ?1",
                [user_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(ChatError::NotFound)?;
        Ok(Presence {
            is_online: false,
            last_seen_at: last_seen,
        })
    }

    /// Rewrite the durable presence columns of a summary with the live view.
    pub fn overlay(&self, user: &mut UserSummary) {
        match self.online_record(user.id) {
            Some(rec) => {
                user.is_online = true;
                user.last_seen_at = Some(rec.last_seen);
            }
            None => user.is_online = false,
        }
    }

    fn online_record(&self, user_id: i64) -> Option<OnlineRecord> {
        let raw = self.cache.get(&Self::online_key(user_id))?;
        serde_json::from_str(&raw).ok()
    }

    pub fn set_typing(&self, chat_id: &Uuid, user_id: i64, typing: bool) {
        let key = Self::typing_key(chat_id, user_id);
        if typing {
            self.cache.set_ex(key, "1", self.typing_ttl);
        } else {
            self.cache.del(&key);
        }
    }

    /// Reads as false once the window elapses without a keep-alive, with no
    /// explicit stop-typing call required.
    pub fn is_typing(&self, chat_id: &Uuid, user_id: i64) -> bool {
        self.cache
            .get(&Self::typing_key(chat_id, user_id))
            .is_some()
    }
}
