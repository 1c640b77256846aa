//! In-process volatile backend.
//!
//! Single-process only: all maps live behind tokio `RwLock`s, so every
//! mutation to a given key happens inside one write-guard critical section
//! and no two updates interleave. Expiry uses a hybrid strategy: a
//! deterministic sweep once the sweep interval has elapsed (at most once
//! per call, bounded O(n)), plus lazy eviction of the specific key being
//! accessed, which keeps expired entries unobservable between sweeps.

use super::{generate_token, Backend, GameListener, Subscription, SESSION_TTL_DAYS};
use crate::error::{Result, StoreError};
use crate::types::{AuthSession, GameRoom, GameStep, RoomPatch, SessionToken, User, UserId};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// How long between deterministic expiry sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

type ListenerRegistry = Arc<StdRwLock<HashMap<String, HashMap<u64, GameListener>>>>;

pub struct MemoryBackend {
    games: RwLock<HashMap<String, GameRoom>>,
    users: RwLock<HashMap<String, User>>,
    sessions: RwLock<HashMap<String, AuthSession>>,
    /// Per-room listener sets. Sync lock: registration and fan-out snapshot
    /// are short and never held across an await.
    listeners: ListenerRegistry,
    next_listener_id: AtomicU64,
    last_sweep: Mutex<Instant>,
    sweep_interval: Duration,
}

impl MemoryBackend {
    pub fn new(sweep_interval: Duration) -> Self {
        Self {
            games: RwLock::new(HashMap::new()),
            users: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            listeners: Arc::new(StdRwLock::new(HashMap::new())),
            next_listener_id: AtomicU64::new(0),
            last_sweep: Mutex::new(Instant::now()),
            sweep_interval,
        }
    }

    /// Run the periodic sweep if the interval has elapsed, at most once per
    /// call. Correctness never depends on this running; lazy eviction
    /// covers the gap between sweeps.
    async fn maybe_sweep(&self) {
        {
            let mut last = match self.last_sweep.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if last.elapsed() < self.sweep_interval {
                return;
            }
            *last = Instant::now();
        }

        let now = Utc::now();
        let mut swept = 0usize;
        {
            let mut games = self.games.write().await;
            let before = games.len();
            games.retain(|_, room| !room.is_expired(now));
            swept += before - games.len();
        }
        {
            let mut sessions = self.sessions.write().await;
            let before = sessions.len();
            sessions.retain(|_, session| !session.is_expired(now));
            swept += before - sessions.len();
        }
        if swept > 0 {
            tracing::debug!(swept, "expiry sweep evicted entries");
        }
    }

    /// Fan out an updated room to its listeners on a spawned task, never
    /// inside the mutating call, so a listener triggering another mutation
    /// cannot re-enter a held lock.
    fn notify(&self, room: &GameRoom) {
        let snapshot: Vec<GameListener> = match self.listeners.read() {
            Ok(map) => map
                .get(&room.room_code)
                .map(|set| set.values().cloned().collect())
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        if snapshot.is_empty() {
            return;
        }
        let room = room.clone();
        tokio::spawn(async move {
            for listener in snapshot {
                listener(room.clone());
            }
        });
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(DEFAULT_SWEEP_INTERVAL)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn game_create(&self, room: GameRoom) -> Result<GameRoom> {
        self.maybe_sweep().await;
        let now = Utc::now();
        let mut games = self.games.write().await;
        if let Some(existing) = games.get(&room.room_code) {
            if !existing.is_expired(now) {
                return Err(StoreError::Conflict(format!(
                    "room {}",
                    room.room_code
                )));
            }
            // Expired entry under the same code is as good as gone.
        }
        games.insert(room.room_code.clone(), room.clone());
        Ok(room)
    }

    async fn game_get(&self, room_code: &str) -> Result<Option<GameRoom>> {
        self.maybe_sweep().await;
        let now = Utc::now();
        let mut games = self.games.write().await;
        match games.get(room_code) {
            Some(room) if room.is_expired(now) => {
                games.remove(room_code);
                Ok(None)
            }
            Some(room) => Ok(Some(room.clone())),
            None => Ok(None),
        }
    }

    async fn game_update(&self, room_code: &str, patch: RoomPatch) -> Result<Option<GameRoom>> {
        self.maybe_sweep().await;
        let now = Utc::now();
        let updated = {
            let mut games = self.games.write().await;
            match games.get_mut(room_code) {
                Some(room) if room.is_expired(now) => {
                    games.remove(room_code);
                    None
                }
                Some(room) => {
                    // The whole merge happens under the write guard, so a
                    // concurrent reader sees either none or all of it.
                    patch.apply_to(room);
                    Some(room.clone())
                }
                None => None,
            }
        };
        if let Some(room) = &updated {
            self.notify(room);
        }
        Ok(updated)
    }

    async fn game_delete(&self, room_code: &str) -> Result<()> {
        self.games.write().await.remove(room_code);
        // The code is gone; no future update can fire these, so drop the
        // whole listener set rather than waiting on each unsubscribe.
        if let Ok(mut map) = self.listeners.write() {
            map.remove(room_code);
        }
        Ok(())
    }

    async fn game_list(&self, user_id: &str, step: Option<GameStep>) -> Result<Vec<GameRoom>> {
        self.maybe_sweep().await;
        let now = Utc::now();
        let games = self.games.read().await;
        let mut rooms: Vec<GameRoom> = games
            .values()
            .filter(|room| !room.is_expired(now))
            .filter(|room| room.player_ids.iter().any(|id| id == user_id))
            .filter(|room| step.map_or(true, |s| room.step == s))
            .cloned()
            .collect();
        rooms.sort_by(|a, b| a.room_code.cmp(&b.room_code));
        Ok(rooms)
    }

    async fn game_subscribe(&self, room_code: &str, listener: GameListener) -> Subscription {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut map) = self.listeners.write() {
            map.entry(room_code.to_string())
                .or_default()
                .insert(id, listener);
        }
        let registry = Arc::clone(&self.listeners);
        let code = room_code.to_string();
        Subscription::new(move || {
            if let Ok(mut map) = registry.write() {
                if let Some(set) = map.get_mut(&code) {
                    set.remove(&id);
                    if set.is_empty() {
                        map.remove(&code);
                    }
                }
            }
        })
    }

    async fn user_create(&self, email: &str, password_hash: &str) -> Result<User> {
        let mut users = self.users.write().await;
        if users.values().any(|u| u.email == email) {
            return Err(StoreError::Conflict(format!("user {email}")));
        }
        let user = User {
            id: ulid::Ulid::new().to_string(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            created_at: Utc::now(),
        };
        users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    async fn user_find_by_email(&self, email: &str) -> Result<Option<User>> {
        Ok(self
            .users
            .read()
            .await
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn user_find_by_id(&self, id: &str) -> Result<Option<User>> {
        Ok(self.users.read().await.get(id).cloned())
    }

    async fn session_create(&self, user_id: &str) -> Result<SessionToken> {
        self.maybe_sweep().await;
        let now = Utc::now();
        let session = AuthSession {
            token: generate_token(),
            user_id: user_id.to_string(),
            created_at: now,
            expires_at: now + ChronoDuration::days(SESSION_TTL_DAYS),
        };
        let token = session.token.clone();
        self.sessions.write().await.insert(token.clone(), session);
        Ok(token)
    }

    async fn session_validate(&self, token: &str) -> Result<Option<UserId>> {
        self.maybe_sweep().await;
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        match sessions.get(token) {
            Some(session) if session.is_expired(now) => {
                sessions.remove(token);
                Ok(None)
            }
            Some(session) => Ok(Some(session.user_id.clone())),
            None => Ok(None),
        }
    }

    async fn session_delete(&self, token: &str) -> Result<()> {
        self.sessions.write().await.remove(token);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
