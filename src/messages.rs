use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{ChatError, ChatResult};
use crate::model::{Message, MessageView, UserBrief};

pub const MAX_CONTENT_CHARS: usize = 5000;

const VIEW_COLUMNS: &str = "m.id, m.chat_id, m.author_id, m.content, m.is_read, m.read_at, \
     m.created_at, u.name, u.avatar";

fn validate_content(content: &str) -> ChatResult<()> {
    if content.trim().is_empty() {
        return Err(ChatError::validation("content", "must not be empty"));
    }
    if content.chars().count() > MAX_CONTENT_CHARS {
        return Err(ChatError::validation("content", "must not exceed 5000 characters"));
    }
    Ok(())
}

fn row_to_view(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageView> {
    let author_id: i64 = row.get(2)?;
    Ok(MessageView {
        message: Message {
            id: Uuid::parse_str(row.get::<_, String>(0)?.as_str()).unwrap(),
            chat_id: Uuid::parse_str(row.get::<_, String>(1)?.as_str()).unwrap(),
            author_id,
            content: row.get(3)?,
            is_read: row.get::<_, i64>(4)? != 0,
            read_at: row.get(5)?,
            created_at: row.get(6)?,
        },
        author: UserBrief {
            id: author_id,
            name: row.get(7)?,
            avatar: row.get(8)?,
        },
    })
}

/// Append a message to a chat. The insert and the chat's last-message
/// pointer move in one transaction: a reader never observes a pointer to a
/// row that is not there.
pub fn append(
    conn: &mut Connection,
    chat_id: &Uuid,
    author_id: i64,
    content: &str,
) -> ChatResult<Message> {
    validate_content(content)?;
    let id = Uuid::new_v4();
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO messages (id, chat_id, author_id, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            id.to_string(),
            chat_id.to_string(),
            author_id,
            content,
            now
        ],
    )?;
    let updated = tx.execute(
        "UPDATE chats SET last_message_id = ?2, updated_at = ?3 WHERE id = ?1",
        params![chat_id.to_string(), id.to_string(), now],
    )?;
    if updated == 0 {
        return Err(ChatError::NotFound);
    }
    tx.commit()?;
    Ok(Message {
        id,
        chat_id: *chat_id,
        author_id,
        content: content.into(),
        is_read: false,
        read_at: None,
        created_at: now,
    })
}

/// Fetch a single message with its author stub.
pub fn view(conn: &Connection, message_id: &Uuid) -> ChatResult<MessageView> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {VIEW_COLUMNS} FROM messages m JOIN users u ON u.id = m.author_id WHERE m.id = ?1"
    ))?;
    stmt.query_row([message_id.to_string()], row_to_view)
        .optional()?
        .ok_or(ChatError::NotFound)
}

/// List messages newest first. `before` is an exclusive cursor; ties on
/// `created_at` are broken by insertion order. Callers wanting conversation
/// order reverse the page themselves.
pub fn list(
    conn: &Connection,
    chat_id: &Uuid,
    before: Option<&Uuid>,
    limit: usize,
    filter: Option<&str>,
) -> ChatResult<Vec<MessageView>> {
    let limit = limit.clamp(1, 200);
    let (ts, rowid) = match before {
        Some(id) => {
            let mut stmt =
                conn.prepare("SELECT created_at, rowid FROM messages WHERE id = ?1")?;
            stmt.query_row([id.to_string()], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })
            .optional()?
            .unwrap_or((i64::MAX, i64::MAX))
        }
        None => (i64::MAX, i64::MAX),
    };
    let pattern = filter.map(|f| format!("%{}%", escape_like(f)));
    let mut sql = format!(
        "SELECT {VIEW_COLUMNS} FROM messages m JOIN users u ON u.id = m.author_id \
         WHERE m.chat_id = ?1 AND (m.created_at < ?2 OR (m.created_at = ?2 AND m.rowid < ?3))"
    );
    if pattern.is_some() {
        sql.push_str(" AND m.content LIKE ?5 ESCAPE '\\'");
    }
    sql.push_str(" ORDER BY m.created_at DESC, m.rowid DESC LIMIT ?4");
    let mut stmt = conn.prepare(&sql)?;
    let rows = match &pattern {
        Some(p) => stmt.query_map(
            params![chat_id.to_string(), ts, rowid, limit as i64, p],
            row_to_view,
        )?,
        None => stmt.query_map(
            params![chat_id.to_string(), ts, rowid, limit as i64],
            row_to_view,
        )?,
    };
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Edit a message's content. The author predicate is part of the UPDATE:
/// anyone else gets `NotFound`, never a hint that the message exists.
pub fn edit(
    conn: &Connection,
    message_id: &Uuid,
    editor_id: i64,
    content: &str,
) -> ChatResult<MessageView> {
    validate_content(content)?;
    let changed = conn.execute(
        "UPDATE messages SET content = ?2 WHERE id = ?1 AND author_id = ?3",
        params![message_id.to_string(), content, editor_id],
    )?;
    if changed == 0 {
        return Err(ChatError::NotFound);
    }
    view(conn, message_id)
}

/// Delete a message (author only, same masking as `edit`). When the chat's
/// last-message pointer referenced it, the pointer is recomputed to the
/// newest survivor inside the same transaction.
pub fn remove(conn: &mut Connection, message_id: &Uuid, requester_id: i64) -> ChatResult<Uuid> {
    let tx = conn.transaction()?;
    let chat_id: Option<String> = tx
        .query_row(
            "SELECT chat_id FROM messages WHERE id = ?1 AND author_id = ?2",
            params![message_id.to_string(), requester_id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(chat_id) = chat_id else {
        return Err(ChatError::NotFound);
    };
    tx.execute(
        "DELETE FROM messages WHERE id = ?1",
        [message_id.to_string()],
    )?;
    let last: Option<String> = tx
        .query_row(
            "SELECT last_message_id FROM chats WHERE id = ?1",
            [chat_id.as_str()],
            |row| row.get(0),
        )
        .optional()?
        .flatten();
    if last.as_deref() == Some(message_id.to_string().as_str()) {
        let newest: Option<String> = tx
            .query_row(
                "SELECT id FROM messages WHERE chat_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                [chat_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        tx.execute(
            "UPDATE chats SET last_message_id = ?2 WHERE id = ?1",
            params![chat_id, newest],
        )?;
    }
    tx.commit()?;
    Ok(Uuid::parse_str(&chat_id).unwrap())
}

/// Case-insensitive substring search across every chat the viewer belongs
/// to. The membership join is the scope: messages from other chats cannot
/// appear no matter the term.
pub fn search(
    conn: &Connection,
    viewer_id: i64,
    term: &str,
    limit: usize,
) -> ChatResult<Vec<MessageView>> {
    let limit = limit.clamp(1, 100);
    let pattern = format!("%{}%", escape_like(term));
    let mut stmt = conn.prepare(&format!(
        "SELECT {VIEW_COLUMNS} FROM messages m \
         JOIN users u ON u.id = m.author_id \
         JOIN chat_members cm ON cm.chat_id = m.chat_id AND cm.user_id = ?1 \
         WHERE m.content LIKE ?2 ESCAPE '\\' \
         ORDER BY m.created_at DESC, m.rowid DESC LIMIT ?3"
    ))?;
    let rows = stmt.query_map(params![viewer_id, pattern, limit as i64], row_to_view)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn escape_like(term: &str) -> String {
    term.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}
