use rusqlite::{Connection, Result};

use crate::types::User;

/// Initialise the users table. UNIQUE constraints carry the username and
/// email invariants; inserts surface violations as constraint errors.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            id            TEXT PRIMARY KEY NOT NULL,
            username      TEXT NOT NULL UNIQUE,
            email         TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            is_active     INTEGER NOT NULL DEFAULT 1,
            preferences   TEXT NOT NULL DEFAULT '{}',
            last_login    TEXT,
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_users_email ON users(email);",
    )
}

/// Map a SELECT row (canonical column order) to a User.
pub(crate) fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let preferences: serde_json::Value =
        serde_json::from_str(&row.get::<_, String>(5)?).unwrap_or_default();
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        is_active: row.get::<_, i32>(4)? != 0,
        preferences,
        last_login: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

pub(crate) const USER_SELECT_SQL: &str =
    "SELECT id, username, email, password_hash, is_active, preferences,
            last_login, created_at, updated_at
     FROM users";
