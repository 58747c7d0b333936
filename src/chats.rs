use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::cache::TtlCache;
use crate::error::{ChatError, ChatResult};
use crate::messages;
use crate::model::{Chat, ChatKind, ChatSummary, UserSummary};
use crate::presence::PresenceStore;
use crate::reads;

/// Chat listings are cached per user for this long; creation invalidates.
pub const LISTING_TTL: Duration = Duration::from_secs(120);

/// Normalized member-pair key for a direct chat. Unordered: both members
/// map to the same key, and the UNIQUE column on it is what makes
/// concurrent first-contact requests collapse into one chat.
pub fn pair_key(a: i64, b: i64) -> String {
    format!("{}:{}", a.min(b), a.max(b))
}

fn listing_key(user_id: i64) -> String {
    format!("user:{}:chats", user_id)
}

fn contacts_key(user_id: i64) -> String {
    format!("user:{}:contacts", user_id)
}

pub fn invalidate_listings(cache: &TtlCache, user_id: i64) {
    cache.del(&listing_key(user_id));
    cache.del(&contacts_key(user_id));
}

/// Drop the cached listings of every member of a chat. Used whenever a
/// mutation changes what the listing would show (new message, read flip).
pub fn invalidate_member_listings(
    conn: &Connection,
    cache: &TtlCache,
    chat_id: &Uuid,
) -> ChatResult<()> {
    for user_id in member_ids(conn, chat_id)? {
        invalidate_listings(cache, user_id);
    }
    Ok(())
}

pub fn member_ids(conn: &Connection, chat_id: &Uuid) -> ChatResult<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT user_id FROM chat_members WHERE chat_id = ?1")?;
    let ids = stmt
        .query_map([chat_id.to_string()], |row| row.get(0))?
        .collect::<Result<Vec<i64>, _>>()?;
    Ok(ids)
}

pub(crate) fn row_to_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chat> {
    Ok(Chat {
        id: Uuid::parse_str(row.get::<_, String>(0)?.as_str()).unwrap(),
        kind: ChatKind::parse(row.get::<_, String>(1)?.as_str()),
        name: row.get(2)?,
        last_message_id: row
            .get::<_, Option<String>>(3)?
            .and_then(|s| Uuid::parse_str(&s).ok()),
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

const CHAT_COLUMNS: &str = "id, kind, name, last_message_id, created_at, updated_at";

fn find_by_pair_key(conn: &Connection, key: &str) -> ChatResult<Option<Chat>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CHAT_COLUMNS} FROM chats WHERE pair_key = ?1"
    ))?;
    Ok(stmt.query_row([key], row_to_chat).optional()?)
}

/// Return the canonical direct chat between two users, creating it on first
/// contact. The boolean reports whether a chat was created.
pub fn get_or_create_direct(
    conn: &mut Connection,
    cache: &TtlCache,
    user_id: i64,
    peer_id: i64,
) -> ChatResult<(Chat, bool)> {
    if user_id == peer_id {
        return Err(ChatError::InvalidOperation("cannot create a chat with yourself"));
    }
    let peer: Option<i64> = conn
        .query_row("SELECT 1 FROM users WHERE id = ?1", [peer_id], |row| {
            row.get(0)
        })
        .optional()?;
    if peer.is_none() {
        return Err(ChatError::validation("user_id", "unknown user"));
    }

    let key = pair_key(user_id, peer_id);
    if let Some(chat) = find_by_pair_key(conn, &key)? {
        return Ok((chat, false));
    }

    let id = Uuid::new_v4();
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let tx = conn.transaction()?;
    let inserted = tx.execute(
        "INSERT INTO chats (id, kind, pair_key, created_at, updated_at) VALUES (?1, 'direct', ?2, ?3, ?3)",
        params![id.to_string(), key, now],
    );
    match inserted {
        Ok(_) => {
            for member in [user_id, peer_id] {
                tx.execute(
                    "INSERT INTO chat_members (chat_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
                    params![id.to_string(), member, now],
                )?;
            }
            tx.commit()?;
        }
        Err(e)
            if matches!(
                e.sqlite_error_code(),
                Some(rusqlite::ErrorCode::ConstraintViolation)
            ) =>
        {
            // lost the race; the winner's chat is the canonical one
            drop(tx);
            let chat = find_by_pair_key(conn, &key)?.ok_or(ChatError::NotFound)?;
            return Ok((chat, false));
        }
        Err(e) => return Err(e.into()),
    }

    invalidate_listings(cache, user_id);
    invalidate_listings(cache, peer_id);
    Ok((
        Chat {
            id,
            kind: ChatKind::Direct,
            name: None,
            last_message_id: None,
            created_at: now,
            updated_at: now,
        },
        true,
    ))
}

/// Fetch a chat on behalf of a member. The membership predicate is part of
/// the lookup itself: a non-member gets the same `NotFound` as a missing
/// chat, so existence is never leaked.
pub fn get_for_member(conn: &Connection, chat_id: &Uuid, user_id: i64) -> ChatResult<Chat> {
    let mut stmt = conn.prepare(&format!(
        "SELECT c.{} FROM chats c \
         JOIN chat_members m ON m.chat_id = c.id AND m.user_id = ?2 \
         WHERE c.id = ?1",
        CHAT_COLUMNS.replace(", ", ", c.")
    ))?;
    stmt.query_row(params![chat_id.to_string(), user_id], row_to_chat)
        .optional()?
        .ok_or(ChatError::NotFound)
}

/// Remove the user's membership. When the last member leaves, the chat and
/// its messages go with it. Returns whether the chat was deleted.
pub fn leave(
    conn: &mut Connection,
    cache: &TtlCache,
    chat_id: &Uuid,
    user_id: i64,
) -> ChatResult<bool> {
    let tx = conn.transaction()?;
    let removed = tx.execute(
        "DELETE FROM chat_members WHERE chat_id = ?1 AND user_id = ?2",
        params![chat_id.to_string(), user_id],
    )?;
    if removed == 0 {
        return Err(ChatError::NotFound);
    }
    let remaining: Vec<i64> = {
        let mut stmt = tx.prepare("SELECT user_id FROM chat_members WHERE chat_id = ?1")?;
        let rows = stmt
            .query_map([chat_id.to_string()], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        rows
    };
    let deleted = remaining.is_empty();
    if deleted {
        tx.execute(
            "DELETE FROM messages WHERE chat_id = ?1",
            [chat_id.to_string()],
        )?;
        tx.execute("DELETE FROM chats WHERE id = ?1", [chat_id.to_string()])?;
    }
    tx.commit()?;

    invalidate_listings(cache, user_id);
    for member in remaining {
        invalidate_listings(cache, member);
    }
    Ok(deleted)
}

/// Listing summaries for a user, newest activity first, served from the
/// per-user cache entry. Presence is overlaid after the cache read so a
/// cached listing never pins a stale online flag.
pub fn list_for_user(
    conn: &Connection,
    cache: &TtlCache,
    presence: &PresenceStore,
    user_id: i64,
) -> ChatResult<Vec<ChatSummary>> {
    let key = listing_key(user_id);
    let cached: Option<Vec<ChatSummary>> = cache
        .get(&key)
        .and_then(|raw| serde_json::from_str(&raw).ok());
    let mut summaries = match cached {
        Some(s) => s,
        None => {
            let built = build_listing(conn, user_id)?;
            if let Ok(raw) = serde_json::to_string(&built) {
                cache.set_ex(key, raw, LISTING_TTL);
            }
            built
        }
    };
    for summary in &mut summaries {
        for user in &mut summary.users {
            presence.overlay(user);
        }
    }
    Ok(summaries)
}

fn build_listing(conn: &Connection, user_id: i64) -> ChatResult<Vec<ChatSummary>> {
    let chats: Vec<Chat> = {
        let mut stmt = conn.prepare(&format!(
            "SELECT c.{} FROM chats c \
             JOIN chat_members m ON m.chat_id = c.id AND m.user_id = ?1 \
             ORDER BY c.updated_at DESC, c.created_at DESC",
            CHAT_COLUMNS.replace(", ", ", c.")
        ))?;
        let rows = stmt
            .query_map([user_id], row_to_chat)?
            .collect::<Result<_, _>>()?;
        rows
    };
    chats
        .into_iter()
        .map(|chat| summary_for(conn, &chat, user_id))
        .collect()
}

/// A single chat expanded for presentation: the other members, the last
/// message and the viewer's unread count.
pub fn summary_for(conn: &Connection, chat: &Chat, viewer_id: i64) -> ChatResult<ChatSummary> {
    let users: Vec<UserSummary> = {
        let mut stmt = conn.prepare(
            "SELECT u.id, u.name, u.email, u.avatar, u.bio, u.is_online, u.last_seen_at \
             FROM users u JOIN chat_members m ON m.user_id = u.id \
             WHERE m.chat_id = ?1 AND u.id <> ?2 ORDER BY u.name",
        )?;
        let rows = stmt
            .query_map(params![chat.id.to_string(), viewer_id], |row| {
                Ok(UserSummary {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    email: row.get(2)?,
                    avatar: row.get(3)?,
                    bio: row.get(4)?,
                    is_online: row.get::<_, i64>(5)? != 0,
                    last_seen_at: row.get(6)?,
                })
            })?
            .collect::<Result<_, _>>()?;
        rows
    };
    let last_message = match &chat.last_message_id {
        Some(id) => match messages::view(conn, id) {
            Ok(view) => Some(view),
            Err(ChatError::NotFound) => None,
            Err(e) => return Err(e),
        },
        None => None,
    };
    let unread_count = reads::unread_count(conn, &chat.id, viewer_id)?;
    Ok(ChatSummary {
        chat: chat.clone(),
        users,
        last_message,
        unread_count,
    })
}
