//! SQLite-backed persistent backend.
//!
//! Every read carries an `expires_at > now` predicate, so expired rows are
//! unobservable whether or not the out-of-band reaper job has deleted them
//! yet. Updates are a single `UPDATE ... WHERE room_code = ?` naming only
//! the supplied columns, which keeps merges field-granular under
//! concurrent writers. `game_subscribe` hands out an inert guard;
//! consumers poll `game_get` instead.

use super::{generate_token, Backend, GameListener, Subscription, SESSION_TTL_DAYS};
use crate::backend::schema;
use crate::error::{Result, StoreError};
use crate::types::{GameRoom, GameStep, Player, RoomPatch, Round, SessionToken, User, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{named_params, Connection, ErrorCode, Row, ToSql};
use std::path::Path;
use std::sync::{Arc, Mutex};

pub struct RelationalBackend {
    conn: Arc<Mutex<Connection>>,
}

impl RelationalBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        schema::initialize_schema(&conn)?;
        tracing::info!(path = %path.as_ref().display(), "opened relational backend");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Private in-memory database; used by tests and throwaway processes.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StoreError::BackendUnavailable("connection lock poisoned".into()))?;
        f(&conn)
    }
}

fn timestamp_from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::BackendUnavailable(format!("corrupt timestamp {ms}")))
}

/// Raw row image; JSON columns are decoded after the rusqlite closure so
/// decode failures map to our error type, not a bogus sqlite error.
struct RawRoom {
    room_code: String,
    host_id: String,
    players: String,
    player_ids: String,
    step: String,
    spicy_level: i64,
    chaos_mode: bool,
    rounds: String,
    current_question_index: i64,
    created_at: i64,
    expires_at: i64,
}

impl RawRoom {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            room_code: row.get(0)?,
            host_id: row.get(1)?,
            players: row.get(2)?,
            player_ids: row.get(3)?,
            step: row.get(4)?,
            spicy_level: row.get(5)?,
            chaos_mode: row.get(6)?,
            rounds: row.get(7)?,
            current_question_index: row.get(8)?,
            created_at: row.get(9)?,
            expires_at: row.get(10)?,
        })
    }

    fn into_room(self) -> Result<GameRoom> {
        let players: Vec<Player> = serde_json::from_str(&self.players)?;
        let player_ids: Vec<String> = serde_json::from_str(&self.player_ids)?;
        let rounds: Vec<Round> = serde_json::from_str(&self.rounds)?;
        let step = GameStep::from_str(&self.step)
            .ok_or_else(|| StoreError::BackendUnavailable(format!("corrupt step {}", self.step)))?;
        Ok(GameRoom {
            room_code: self.room_code,
            host_id: self.host_id,
            players,
            player_ids,
            step,
            spicy_level: self.spicy_level as u8,
            chaos_mode: self.chaos_mode,
            rounds,
            current_question_index: self.current_question_index as usize,
            created_at: timestamp_from_millis(self.created_at)?,
            expires_at: timestamp_from_millis(self.expires_at)?,
        })
    }
}

const ROOM_COLUMNS: &str = "room_code, host_id, players, player_ids, step, spicy_level, \
                            chaos_mode, rounds, current_question_index, created_at, expires_at";

fn select_room(conn: &Connection, room_code: &str, now_ms: i64) -> Result<Option<GameRoom>> {
    let raw = conn
        .query_row(
            &format!("SELECT {ROOM_COLUMNS} FROM games WHERE room_code = ?1 AND expires_at > ?2"),
            rusqlite::params![room_code, now_ms],
            RawRoom::from_row,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(StoreError::from(other)),
        })?;
    raw.map(RawRoom::into_room).transpose()
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation
    )
}

#[async_trait]
impl Backend for RelationalBackend {
    async fn game_create(&self, room: GameRoom) -> Result<GameRoom> {
        let now_ms = Utc::now().timestamp_millis();
        let players = serde_json::to_string(&room.players)?;
        let player_ids = serde_json::to_string(&room.player_ids)?;
        let rounds = serde_json::to_string(&room.rounds)?;

        self.with_conn(|conn| {
            if select_room(conn, &room.room_code, now_ms)?.is_some() {
                return Err(StoreError::Conflict(format!("room {}", room.room_code)));
            }
            // An expired row under the same code may still be on disk if
            // the reaper hasn't run; replace it.
            conn.execute("DELETE FROM games WHERE room_code = :code AND expires_at <= :now",
                named_params! { ":code": room.room_code, ":now": now_ms })?;
            conn.execute(
                r#"
                INSERT INTO games (
                    room_code, host_id, players, player_ids, step, spicy_level,
                    chaos_mode, rounds, current_question_index, created_at, expires_at
                ) VALUES (
                    :room_code, :host_id, :players, :player_ids, :step, :spicy_level,
                    :chaos_mode, :rounds, :current_question_index, :created_at, :expires_at
                )
                "#,
                named_params! {
                    ":room_code": room.room_code,
                    ":host_id": room.host_id,
                    ":players": players,
                    ":player_ids": player_ids,
                    ":step": room.step.as_str(),
                    ":spicy_level": room.spicy_level as i64,
                    ":chaos_mode": room.chaos_mode,
                    ":rounds": rounds,
                    ":current_question_index": room.current_question_index as i64,
                    ":created_at": room.created_at.timestamp_millis(),
                    ":expires_at": room.expires_at.timestamp_millis(),
                },
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::Conflict(format!("room {}", room.room_code))
                } else {
                    StoreError::from(e)
                }
            })?;
            Ok(room.clone())
        })
    }

    async fn game_get(&self, room_code: &str) -> Result<Option<GameRoom>> {
        let now_ms = Utc::now().timestamp_millis();
        self.with_conn(|conn| select_room(conn, room_code, now_ms))
    }

    async fn game_update(&self, room_code: &str, patch: RoomPatch) -> Result<Option<GameRoom>> {
        let now_ms = Utc::now().timestamp_millis();

        // Owned column values; the SET list references only supplied ones.
        let players = patch
            .players
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let player_ids = patch
            .player_ids
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let rounds = patch
            .rounds
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.with_conn(|conn| {
            let mut sets: Vec<&'static str> = Vec::new();
            let mut params: Vec<Box<dyn ToSql>> = Vec::new();
            if let Some(v) = &players {
                sets.push("players = ?");
                params.push(Box::new(v.clone()));
            }
            if let Some(v) = &player_ids {
                sets.push("player_ids = ?");
                params.push(Box::new(v.clone()));
            }
            if let Some(step) = patch.step {
                sets.push("step = ?");
                params.push(Box::new(step.as_str()));
            }
            if let Some(level) = patch.spicy_level {
                sets.push("spicy_level = ?");
                params.push(Box::new(level as i64));
            }
            if let Some(chaos) = patch.chaos_mode {
                sets.push("chaos_mode = ?");
                params.push(Box::new(chaos));
            }
            if let Some(v) = &rounds {
                sets.push("rounds = ?");
                params.push(Box::new(v.clone()));
            }
            if let Some(index) = patch.current_question_index {
                sets.push("current_question_index = ?");
                params.push(Box::new(index as i64));
            }

            if sets.is_empty() {
                // Nothing to merge; behave like a read.
                return select_room(conn, room_code, now_ms);
            }

            params.push(Box::new(room_code.to_string()));
            params.push(Box::new(now_ms));
            let sql = format!(
                "UPDATE games SET {} WHERE room_code = ? AND expires_at > ?",
                sets.join(", ")
            );
            let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
            let changed = conn.execute(&sql, param_refs.as_slice())?;
            if changed == 0 {
                return Ok(None);
            }
            select_room(conn, room_code, now_ms)
        })
    }

    async fn game_delete(&self, room_code: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM games WHERE room_code = ?1", [room_code])?;
            Ok(())
        })
    }

    async fn game_list(&self, user_id: &str, step: Option<GameStep>) -> Result<Vec<GameRoom>> {
        let now_ms = Utc::now().timestamp_millis();
        let rooms = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ROOM_COLUMNS} FROM games \
                 WHERE expires_at > :now AND (:step IS NULL OR step = :step) \
                 ORDER BY room_code",
            ))?;
            let raw: Vec<RawRoom> = stmt
                .query_map(
                    named_params! { ":now": now_ms, ":step": step.map(|s| s.as_str()) },
                    RawRoom::from_row,
                )?
                .collect::<rusqlite::Result<_>>()?;
            raw.into_iter()
                .map(RawRoom::into_room)
                .collect::<Result<Vec<_>>>()
        })?;
        // Membership lives inside the player_ids document.
        Ok(rooms
            .into_iter()
            .filter(|room| room.player_ids.iter().any(|id| id == user_id))
            .collect())
    }

    async fn game_subscribe(&self, _room_code: &str, _listener: GameListener) -> Subscription {
        Subscription::inert()
    }

    async fn user_create(&self, email: &str, password_hash: &str) -> Result<User> {
        let user = User {
            id: ulid::Ulid::new().to_string(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            created_at: Utc::now(),
        };
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, email, password_hash, created_at) \
                 VALUES (:id, :email, :password_hash, :created_at)",
                named_params! {
                    ":id": user.id,
                    ":email": user.email,
                    ":password_hash": user.password_hash,
                    ":created_at": user.created_at.timestamp_millis(),
                },
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::Conflict(format!("user {email}"))
                } else {
                    StoreError::from(e)
                }
            })?;
            Ok(user.clone())
        })
    }

    async fn user_find_by_email(&self, email: &str) -> Result<Option<User>> {
        self.with_conn(|conn| find_user(conn, "email", email))
    }

    async fn user_find_by_id(&self, id: &str) -> Result<Option<User>> {
        self.with_conn(|conn| find_user(conn, "id", id))
    }

    async fn session_create(&self, user_id: &str) -> Result<SessionToken> {
        let now = Utc::now();
        let token = generate_token();
        let expires_at = now + ChronoDuration::days(SESSION_TTL_DAYS);
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (token, user_id, created_at, expires_at) \
                 VALUES (:token, :user_id, :created_at, :expires_at)",
                named_params! {
                    ":token": token,
                    ":user_id": user_id,
                    ":created_at": now.timestamp_millis(),
                    ":expires_at": expires_at.timestamp_millis(),
                },
            )?;
            Ok(token.clone())
        })
    }

    async fn session_validate(&self, token: &str) -> Result<Option<UserId>> {
        let now_ms = Utc::now().timestamp_millis();
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT user_id FROM sessions WHERE token = ?1 AND expires_at > ?2",
                rusqlite::params![token, now_ms],
                |row| row.get::<_, String>(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(StoreError::from(other)),
            })
        })
    }

    async fn session_delete(&self, token: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM sessions WHERE token = ?1", [token])?;
            Ok(())
        })
    }

    async fn ping(&self) -> Result<()> {
        self.with_conn(|conn| {
            let ok = conn
                .prepare("SELECT 1")
                .and_then(|mut stmt| stmt.exists([]))
                .unwrap_or(false);
            if ok {
                Ok(())
            } else {
                Err(StoreError::BackendUnavailable("health probe failed".into()))
            }
        })
    }
}

fn find_user(conn: &Connection, column: &str, value: &str) -> Result<Option<User>> {
    // `column` is always a literal from this file, never caller input.
    let raw = conn
        .query_row(
            &format!("SELECT id, email, password_hash, created_at FROM users WHERE {column} = ?1"),
            [value],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(StoreError::from(other)),
        })?;
    raw.map(|(id, email, password_hash, created_at_ms)| {
        Ok(User {
            id,
            email,
            password_hash,
            created_at: timestamp_from_millis(created_at_ms)?,
        })
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(code: &str, host: &str) -> GameRoom {
        GameRoom::new(
            code.to_string(),
            Player::new(host, host),
            ChronoDuration::hours(24),
        )
    }

    #[tokio::test]
    async fn test_expired_row_reads_as_absent_before_reaper_runs() {
        let backend = RelationalBackend::open_in_memory().unwrap();
        let mut expired = room("GONE", "u1");
        expired.expires_at = Utc::now() - ChronoDuration::seconds(1);
        backend.game_create(expired).await.unwrap();

        assert!(backend.game_get("GONE").await.unwrap().is_none());

        // The row is still physically present; only the reaper deletes it.
        let count: i64 = backend
            .with_conn(|conn| {
                Ok(conn
                    .query_row("SELECT COUNT(*) FROM games", [], |row| row.get(0))
                    .unwrap())
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_update_names_only_supplied_columns() {
        let backend = RelationalBackend::open_in_memory().unwrap();
        let mut created = room("COLS", "u1");
        created.spicy_level = 3;
        backend.game_create(created).await.unwrap();

        let updated = backend
            .game_update(
                "COLS",
                RoomPatch {
                    chaos_mode: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert!(updated.chaos_mode);
        assert_eq!(updated.spicy_level, 3);
        assert_eq!(updated.host_id, "u1");
    }

    #[tokio::test]
    async fn test_empty_patch_behaves_like_a_read() {
        let backend = RelationalBackend::open_in_memory().unwrap();
        backend.game_create(room("NOOP", "u1")).await.unwrap();

        let unchanged = backend
            .game_update("NOOP", RoomPatch::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(unchanged.host_id, "u1");
        assert!(backend
            .game_update("MISSING", RoomPatch::default())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_duplicate_email_is_conflict() {
        let backend = RelationalBackend::open_in_memory().unwrap();
        backend.user_create("a@b.c", "hash").await.unwrap();
        let err = backend.user_create("a@b.c", "hash2").await.unwrap_err();
        assert_eq!(err.code(), "conflict");
    }

    #[tokio::test]
    async fn test_ping_ok() {
        let backend = RelationalBackend::open_in_memory().unwrap();
        backend.ping().await.unwrap();
    }
}
