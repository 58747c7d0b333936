use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;
use time::OffsetDateTime;

use crate::auth;
use crate::cache::TtlCache;
use crate::chats;
use crate::error::{ChatError, ChatResult};
use crate::model::{User, UserSummary};
use crate::presence::PresenceStore;

const USER_COLUMNS: &str = "id, name, email, avatar, bio, is_online, last_seen_at, created_at";

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        avatar: row.get(3)?,
        bio: row.get(4)?,
        is_online: row.get::<_, i64>(5)? != 0,
        last_seen_at: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn row_to_summary(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserSummary> {
    Ok(UserSummary {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        avatar: row.get(3)?,
        bio: row.get(4)?,
        is_online: row.get::<_, i64>(5)? != 0,
        last_seen_at: row.get(6)?,
    })
}

fn validate_email(email: &str) -> ChatResult<()> {
    if email.is_empty() || email.len() > 255 || !email.contains('@') {
        return Err(ChatError::validation("email", "must be a valid email address"));
    }
    Ok(())
}

fn validate_password(password: &str) -> ChatResult<()> {
    if password.len() < 8 {
        return Err(ChatError::validation("password", "must be at least 8 characters"));
    }
    Ok(())
}

/// Create an account. The unique email constraint is the final arbiter;
/// a violation surfaces as a field-level validation error.
pub fn create(conn: &Connection, name: &str, email: &str, password: &str) -> ChatResult<User> {
    if name.trim().is_empty() || name.len() > 255 {
        return Err(ChatError::validation("name", "must be between 1 and 255 characters"));
    }
    validate_email(email)?;
    validate_password(password)?;
    let hash = auth::hash_password(password)?;
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let inserted = conn.execute(
        "INSERT INTO users (name, email, password_hash, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![name, email, hash, now],
    );
    match inserted {
        Ok(_) => get(conn, conn.last_insert_rowid()),
        Err(e)
            if matches!(
                e.sqlite_error_code(),
                Some(rusqlite::ErrorCode::ConstraintViolation)
            ) =>
        {
            Err(ChatError::validation("email", "already taken"))
        }
        Err(e) => Err(e.into()),
    }
}

pub fn get(conn: &Connection, user_id: i64) -> ChatResult<User> {
    let mut stmt = conn.prepare(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"))?;
    stmt.query_row([user_id], row_to_user)
        .optional()?
        .ok_or(ChatError::NotFound)
}

/// Lookup for the login path; returns the stored password hash alongside.
pub fn find_by_email(conn: &Connection, email: &str) -> ChatResult<Option<(User, String)>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {USER_COLUMNS}, password_hash FROM users WHERE email = ?1"
    ))?;
    let row = stmt
        .query_row([email], |row| Ok((row_to_user(row)?, row.get::<_, String>(8)?)))
        .optional()?;
    Ok(row)
}

/// Partial profile update; absent fields are untouched.
#[derive(Debug, Default, Deserialize)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
    pub bio: Option<String>,
    pub avatar: Option<String>,
    pub password: Option<String>,
}

pub fn update(conn: &Connection, user_id: i64, update: &ProfileUpdate) -> ChatResult<User> {
    let mut sets: Vec<&str> = Vec::new();
    let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(name) = &update.name {
        if name.trim().is_empty() || name.len() > 255 {
            return Err(ChatError::validation("name", "must be between 1 and 255 characters"));
        }
        sets.push("name = ?");
        values.push(Box::new(name.clone()));
    }
    if let Some(email) = &update.email {
        validate_email(email)?;
        let taken: Option<i64> = conn
            .query_row(
                "SELECT id FROM users WHERE email = ?1 AND id <> ?2",
                params![email, user_id],
                |row| row.get(0),
            )
            .optional()?;
        if taken.is_some() {
            return Err(ChatError::validation("email", "already taken"));
        }
        sets.push("email = ?");
        values.push(Box::new(email.clone()));
    }
    if let Some(bio) = &update.bio {
        if bio.len() > 500 {
            return Err(ChatError::validation("bio", "must not exceed 500 characters"));
        }
        sets.push("bio = ?");
        values.push(Box::new(bio.clone()));
    }
    if let Some(avatar) = &update.avatar {
        sets.push("avatar = ?");
        values.push(Box::new(avatar.clone()));
    }
    if let Some(password) = &update.password {
        validate_password(password)?;
        sets.push("password_hash = ?");
        values.push(Box::new(auth::hash_password(password)?));
    }

    if !sets.is_empty() {
        let sql = format!("UPDATE users SET {} WHERE id = ?", sets.join(", "));
        values.push(Box::new(user_id));
        let param_refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let changed = conn.execute(&sql, rusqlite::params_from_iter(param_refs))?;
        if changed == 0 {
            return Err(ChatError::NotFound);
        }
    }
    get(conn, user_id)
}

/// Hard account deletion. Memberships are detached first; chats left with
/// no members are deleted with their messages, and the user's remaining
/// messages elsewhere go too, all in one transaction.
pub fn delete_account(conn: &mut Connection, cache: &TtlCache, user_id: i64) -> ChatResult<()> {
    let tx = conn.transaction()?;
    let chat_ids: Vec<String> = {
        let mut stmt = tx.prepare("SELECT chat_id FROM chat_members WHERE user_id = ?1")?;
        let rows = stmt
            .query_map([user_id], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        rows
    };
    tx.execute("DELETE FROM chat_members WHERE user_id = ?1", [user_id])?;
    for chat_id in &chat_ids {
        let remaining: i64 = tx.query_row(
            "SELECT COUNT(*) FROM chat_members WHERE chat_id = ?1",
            [chat_id.as_str()],
            |row| row.get(0),
        )?;
        if remaining == 0 {
            tx.execute("DELETE FROM messages WHERE chat_id = ?1", [chat_id.as_str()])?;
            tx.execute("DELETE FROM chats WHERE id = ?1", [chat_id.as_str()])?;
        }
    }
    tx.execute("DELETE FROM messages WHERE author_id = ?1", [user_id])?;
    // messages by this author may have been someone's last message
    tx.execute(
        "UPDATE chats SET last_message_id = (SELECT id FROM messages \
         WHERE chat_id = chats.id ORDER BY created_at DESC, rowid DESC LIMIT 1) \
         WHERE last_message_id IS NOT NULL \
         AND last_message_id NOT IN (SELECT id FROM messages)",
        [],
    )?;
    let removed = tx.execute("DELETE FROM users WHERE id = ?1", [user_id])?;
    if removed == 0 {
        return Err(ChatError::NotFound);
    }
    tx.commit()?;
    invalidate_all(cache, user_id, &chat_ids, conn)?;
    Ok(())
}

fn invalidate_all(
    cache: &TtlCache,
    user_id: i64,
    chat_ids: &[String],
    conn: &Connection,
) -> ChatResult<()> {
    chats::invalidate_listings(cache, user_id);
    for chat_id in chat_ids {
        if let Ok(id) = uuid::Uuid::parse_str(chat_id) {
            // surviving chats still list the departed user's messages
            let _ = chats::invalidate_member_listings(conn, cache, &id);
        }
    }
    Ok(())
}

/// Substring search over name and email, excluding the caller. Presence is
/// overlaid live.
pub fn search(
    conn: &Connection,
    presence: &PresenceStore,
    viewer_id: i64,
    term: &str,
    limit: usize,
) -> ChatResult<Vec<UserSummary>> {
    let limit = limit.clamp(1, 100);
    let pattern = format!("%{}%", term);
    let mut stmt = conn.prepare(
        "SELECT id, name, email, avatar, bio, is_online, last_seen_at FROM users \
         WHERE id <> ?1 AND (name LIKE ?2 OR email LIKE ?2) ORDER BY name LIMIT ?3",
    )?;
    let mut found = stmt
        .query_map(params![viewer_id, pattern, limit as i64], row_to_summary)?
        .collect::<Result<Vec<_>, _>>()?;
    for user in &mut found {
        presence.overlay(user);
    }
    Ok(found)
}

/// Everyone the viewer shares a chat with, name order, presence overlaid.
pub fn contacts(
    conn: &Connection,
    presence: &PresenceStore,
    viewer_id: i64,
) -> ChatResult<Vec<UserSummary>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT u.id, u.name, u.email, u.avatar, u.bio, u.is_online, u.last_seen_at \
         FROM users u JOIN chat_members m ON m.user_id = u.id \
         WHERE m.chat_id IN (SELECT chat_id FROM chat_members WHERE user_id = ?1) \
         AND u.id <> ?1 ORDER BY u.name",
    )?;
    let mut found = stmt
        .query_map([viewer_id], row_to_summary)?
        .collect::<Result<Vec<_>, _>>()?;
    for user in &mut found {
        presence.overlay(user);
    }
    Ok(found)
}
