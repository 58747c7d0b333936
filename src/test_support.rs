use rusqlite::{params, Connection};

/// Insert a bare user row and return its id.
pub fn seed_user(conn: &Connection, name: &str, email: &str) -> i64 {
    conn.execute(
        "INSERT INTO users (name, email, password_hash, created_at) VALUES (?1, ?2, 'x', 0)",
        params![name, email],
    )
    .unwrap();
    conn.last_insert_rowid()
}
