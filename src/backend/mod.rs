//! The polymorphic storage backend: one behavioral contract, two
//! implementations. `MemoryBackend` keeps everything in process-local maps
//! with a hybrid expiry sweep; `RelationalBackend` persists to SQLite and
//! treats `expires_at < now` rows as absent on every read. Which one a
//! process uses is decided once at startup by configuration; behavioral
//! parity is enforced by the contract suite in `tests/contract.rs`.

mod memory;
mod relational;
mod schema;

pub use memory::MemoryBackend;
pub use relational::RelationalBackend;

use crate::error::Result;
use crate::types::{GameRoom, GameStep, RoomPatch, SessionToken, User, UserId};
use async_trait::async_trait;
use rand::RngCore;
use std::sync::Arc;

/// Auth sessions live for a week.
pub const SESSION_TTL_DAYS: i64 = 7;

/// Callback fired after a successful room update.
pub type GameListener = Arc<dyn Fn(GameRoom) + Send + Sync>;

/// Handle returned by [`Backend::game_subscribe`]. Dropping it without
/// calling `unsubscribe` leaves the listener registered until its room is
/// deleted; `unsubscribe` is infallible.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription that was never wired up. Backends without in-process
    /// fan-out (the relational one) hand these out; consumers fall back to
    /// polling `game_get`.
    pub(crate) fn inert() -> Self {
        Self { cancel: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Shared persistence contract consumed by GameStore and SessionService.
///
/// Absence (never created, deleted, or expired) is `Ok(None)` / silent
/// success; `Err` is reserved for input conflicts and storage failures.
/// Reading an expired entity must be indistinguishable from reading a
/// missing one, whether or not any cleanup has run yet.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Store a room verbatim. Fails with `Conflict` if the code is already
    /// taken by a non-expired room.
    async fn game_create(&self, room: GameRoom) -> Result<GameRoom>;

    async fn game_get(&self, room_code: &str) -> Result<Option<GameRoom>>;

    /// Merge only the supplied fields into the stored room. Returns `None`
    /// if the room is absent or expired. Field-granular: two concurrent
    /// updates to disjoint fields must both be observable afterwards.
    async fn game_update(&self, room_code: &str, patch: RoomPatch) -> Result<Option<GameRoom>>;

    /// Idempotent; deleting a non-existent room is not an error.
    async fn game_delete(&self, room_code: &str) -> Result<()>;

    /// All non-expired rooms the user is a member of, optionally filtered
    /// by step. Ordered by room code so results are deterministic.
    async fn game_list(&self, user_id: &str, step: Option<GameStep>) -> Result<Vec<GameRoom>>;

    /// Register a listener fired asynchronously after each successful
    /// update to the room. Backends may return an inert subscription.
    async fn game_subscribe(&self, room_code: &str, listener: GameListener) -> Subscription;

    /// Fails with `Conflict` if the email is already registered.
    async fn user_create(&self, email: &str, password_hash: &str) -> Result<User>;

    async fn user_find_by_email(&self, email: &str) -> Result<Option<User>>;

    async fn user_find_by_id(&self, id: &str) -> Result<Option<User>>;

    /// Mint a new auth session, returning its unguessable token.
    async fn session_create(&self, user_id: &str) -> Result<SessionToken>;

    /// `None` if the token is unknown, deleted, or expired.
    async fn session_validate(&self, token: &str) -> Result<Option<UserId>>;

    /// Idempotent.
    async fn session_delete(&self, token: &str) -> Result<()>;

    /// Health probe; failures surface as `BackendUnavailable`.
    async fn ping(&self) -> Result<()>;
}

/// 256-bit random token, hex encoded. Used for auth session tokens.
pub(crate) fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
