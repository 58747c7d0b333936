use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{ChatError, ChatResult};

/// Result of a read-marking call: which chat the message lives in, and the
/// timestamp when this call actually flipped the flag. `newly_read` is
/// `None` on idempotent repeats so callers can skip re-broadcasting.
#[derive(Debug, PartialEq, Eq)]
pub struct ReadOutcome {
    pub chat_id: Uuid,
    pub newly_read: Option<i64>,
}

/// Mark a single message read on behalf of `reader_id`.
///
/// One lookup carries every predicate: the message must exist, the reader
/// must be a member of its chat, and the reader must not be the author. Any
/// miss is the same `NotFound`.
pub fn mark_message_read(
    conn: &Connection,
    message_id: &Uuid,
    reader_id: i64,
) -> ChatResult<ReadOutcome> {
    let row: Option<(String, bool)> = conn
        .query_row(
            "SELECT m.chat_id, m.is_read FROM messages m \
             JOIN chat_members cm ON cm.chat_id = m.chat_id AND cm.user_id = ?2 \
             WHERE m.id = ?1 AND m.author_id <> ?2",
            params![message_id.to_string(), reader_id],
            |r| Ok((r.get(0)?, r.get::<_, i64>(1)? != 0)),
        )
        .optional()?;
    let Some((chat_id, is_read)) = row else {
        return Err(ChatError::NotFound);
    };
    let chat_id = Uuid::parse_str(&chat_id).unwrap();
    if is_read {
        return Ok(ReadOutcome {
            chat_id,
            newly_read: None,
        });
    }
    let now = OffsetDateTime::now_utc().unix_timestamp();
    conn.execute(
        "UPDATE messages SET is_read = 1, read_at = ?2 WHERE id = ?1",
        params![message_id.to_string(), now],
    )?;
    Ok(ReadOutcome {
        chat_id,
        newly_read: Some(now),
    })
}

/// Advance the reader's watermark and flip every unread foreign-authored
/// message in the chat, all under one timestamp and one transaction.
pub fn mark_chat_read(conn: &mut Connection, chat_id: &Uuid, reader_id: i64) -> ChatResult<i64> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let tx = conn.transaction()?;
    let touched = tx.execute(
        "UPDATE chat_members SET last_read_at = ?3 WHERE chat_id = ?1 AND user_id = ?2",
        params![chat_id.to_string(), reader_id, now],
    )?;
    if touched == 0 {
        // not a member, or no such chat; same answer either way
        return Err(ChatError::NotFound);
    }
    tx.execute(
        "UPDATE messages SET is_read = 1, read_at = ?3 \
         WHERE chat_id = ?1 AND author_id <> ?2 AND is_read = 0",
        params![chat_id.to_string(), reader_id, now],
    )?;
    tx.commit()?;
    Ok(now)
}

/// Unread messages for a viewer: foreign-authored and still unread. Always
/// recomputed from the ledger, never trusted from a denormalization.
pub fn unread_count(conn: &Connection, chat_id: &Uuid, viewer_id: i64) -> ChatResult<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE chat_id = ?1 AND author_id <> ?2 AND is_read = 0",
        params![chat_id.to_string(), viewer_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// The member's read watermark, if any.
pub fn last_read_at(conn: &Connection, chat_id: &Uuid, user_id: i64) -> ChatResult<Option<i64>> {
    let ts: Option<Option<i64>> = conn
        .query_row(
            "SELECT last_read_at FROM chat_members WHERE chat_id = ?1 AND user_id = ?2",
            params![chat_id.to_string(), user_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(ts.flatten())
}
