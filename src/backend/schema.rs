//! SQLite schema and migrations for the relational backend.

use crate::error::{Result, StoreError};
use rusqlite::Connection;

pub const CURRENT_SCHEMA_VERSION: i32 = 1;

pub struct Migration {
    pub version: i32,
    pub description: &'static str,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "Initial schema with games, users, and sessions tables",
    sql: r#"
            -- Game rooms. Roster and rounds are serialized JSON documents;
            -- membership queries filter on the player_ids document in code.
            CREATE TABLE games (
                room_code TEXT PRIMARY KEY,
                host_id TEXT NOT NULL,
                players TEXT NOT NULL,
                player_ids TEXT NOT NULL,
                step TEXT NOT NULL CHECK(step IN ('lobby', 'categories', 'spicy', 'game', 'summary')),
                spicy_level INTEGER NOT NULL,
                chaos_mode INTEGER NOT NULL,
                rounds TEXT NOT NULL,
                current_question_index INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE TABLE users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE sessions (
                token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );

            -- Schema migrations tracking table
            CREATE TABLE schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL,
                description TEXT NOT NULL
            );

            -- expires_at indexes serve both the read predicates and the
            -- out-of-band reaper job's DELETE.
            CREATE INDEX idx_games_expires ON games(expires_at);
            CREATE INDEX idx_games_step ON games(step);
            CREATE INDEX idx_sessions_expires ON sessions(expires_at);
            CREATE INDEX idx_sessions_user ON sessions(user_id);
        "#,
}];

/// Initialize the schema and run any pending migrations.
pub fn initialize_schema(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "foreign_keys", true)
        .map_err(|e| StoreError::BackendUnavailable(format!("enabling foreign keys: {e}")))?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|e| StoreError::BackendUnavailable(format!("enabling WAL mode: {e}")))?;

    let migrations_exist = conn
        .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name='schema_migrations'")
        .and_then(|mut stmt| stmt.exists([]))
        .unwrap_or(false);

    let applied: i32 = if migrations_exist {
        conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )?
    } else {
        0
    };

    for migration in MIGRATIONS.iter().filter(|m| m.version > applied) {
        tracing::info!(
            version = migration.version,
            description = migration.description,
            "applying schema migration"
        );
        conn.execute_batch(migration.sql)?;
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at, description) VALUES (?1, ?2, ?3)",
            rusqlite::params![
                migration.version,
                chrono::Utc::now().timestamp(),
                migration.description
            ],
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        initialize_schema(&conn).unwrap();

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_email_uniqueness_enforced() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();

        conn.execute(
            "INSERT INTO users (id, email, password_hash, created_at) VALUES ('a', 'x@y.z', 'h', 0)",
            [],
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO users (id, email, password_hash, created_at) VALUES ('b', 'x@y.z', 'h', 0)",
            [],
        );
        assert!(dup.is_err());
    }
}
