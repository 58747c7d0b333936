use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use time::OffsetDateTime;
use tokio::time::{interval, Duration};

use crate::error::ChatResult;

/// Periodically purge messages past the retention window.
pub fn spawn_retention(pool: Pool<SqliteConnectionManager>, retention_days: i64) {
    tokio::spawn(async move {
        let mut tick = interval(Duration::from_secs(3600));
        loop {
            tick.tick().await;
            match sweep(&pool, retention_days) {
                Ok(0) => {}
                Ok(removed) => tracing::info!(removed, "cleaned old messages"),
                Err(e) => tracing::warn!(error = %e, "retention sweep failed"),
            }
        }
    });
}

/// Delete messages older than the cutoff and repair any last-message
/// pointer the deletion orphaned, in one transaction.
pub fn sweep(pool: &Pool<SqliteConnectionManager>, retention_days: i64) -> ChatResult<usize> {
    let mut conn = pool.get()?;
    let cutoff = OffsetDateTime::now_utc().unix_timestamp() - retention_days * 86_400;
    let tx = conn.transaction()?;
    let removed = tx.execute("DELETE FROM messages WHERE created_at < ?1", [cutoff])?;
    if removed > 0 {
        tx.execute(
            "UPDATE chats SET last_message_id = (SELECT id FROM messages \
             WHERE chat_id = chats.id ORDER BY created_at DESC, rowid DESC LIMIT 1) \
             WHERE last_message_id IS NOT NULL \
             AND last_message_id NOT IN (SELECT id FROM messages)",
            [],
        )?;
    }
    tx.commit()?;
    Ok(removed)
}
