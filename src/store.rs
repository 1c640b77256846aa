//! GameStore: business rules over the backend's games namespace.
//!
//! This is the single owner of the players/player_ids invariant: every
//! mutation that touches the roster goes through here and writes both
//! fields together. Backends trust what they are handed.

use crate::backend::{Backend, GameListener, Subscription};
use crate::error::{Result, StoreError};
use crate::types::{
    GameRoom, GameStep, Player, RoomPatch, CATEGORIES, MAX_PLAYER_NAME_CHARS,
};
use chrono::Duration as ChronoDuration;
use std::sync::Arc;

/// Rooms live for a day by default.
pub const DEFAULT_ROOM_TTL_HOURS: i64 = 24;

const ROOM_CODE_MIN: usize = 4;
const ROOM_CODE_MAX: usize = 64;

/// Normalize a room code to its canonical uppercase form, rejecting
/// anything outside `[A-Z0-9-]` or the 4..=64 length bounds. Invalid codes
/// never reach the backend.
pub fn normalize_room_code(input: &str) -> Result<String> {
    let code = input.trim().to_ascii_uppercase();
    if code.len() < ROOM_CODE_MIN || code.len() > ROOM_CODE_MAX {
        return Err(StoreError::InvalidInput(format!(
            "room code must be {ROOM_CODE_MIN}-{ROOM_CODE_MAX} characters"
        )));
    }
    if !code
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(StoreError::InvalidInput(
            "room code may only contain A-Z, 0-9, and -".into(),
        ));
    }
    Ok(code)
}

/// Strip control characters, trim, and cap the display name length.
fn sanitize_name(name: &str) -> String {
    let cleaned: String = name.chars().filter(|c| !c.is_control()).collect();
    cleaned.trim().chars().take(MAX_PLAYER_NAME_CHARS).collect()
}

/// Keep only canonical categories, deduplicated, in selection order.
fn dedup_categories(selected: &[String]) -> Vec<String> {
    let mut seen = Vec::new();
    for category in selected {
        if CATEGORIES.contains(&category.as_str()) && !seen.contains(category) {
            seen.push(category.clone());
        }
    }
    seen
}

fn sanitize_player(mut player: Player) -> Player {
    player.name = sanitize_name(&player.name);
    player.selected_categories = dedup_categories(&player.selected_categories);
    player
}

pub struct GameStore {
    backend: Arc<dyn Backend>,
    room_ttl: ChronoDuration,
}

impl GameStore {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self::with_ttl(backend, ChronoDuration::hours(DEFAULT_ROOM_TTL_HOURS))
    }

    pub fn with_ttl(backend: Arc<dyn Backend>, room_ttl: ChronoDuration) -> Self {
        Self { backend, room_ttl }
    }

    pub async fn create_room(&self, code: &str, host: Player) -> Result<GameRoom> {
        let code = normalize_room_code(code)?;
        let host = sanitize_player(host);
        if host.id.is_empty() {
            return Err(StoreError::InvalidInput("host id must not be empty".into()));
        }
        let room = GameRoom::new(code, host, self.room_ttl);
        let created = self.backend.game_create(room).await?;
        tracing::info!(room_code = %created.room_code, host = %created.host_id, "room created");
        Ok(created)
    }

    pub async fn get_room(&self, code: &str) -> Result<GameRoom> {
        let code = normalize_room_code(code)?;
        self.require_room(&code).await
    }

    /// Add a player to the room. Joining twice with the same id is
    /// idempotent and returns the room unchanged.
    pub async fn join_room(&self, code: &str, player: Player) -> Result<GameRoom> {
        let code = normalize_room_code(code)?;
        let player = sanitize_player(player);
        if player.id.is_empty() {
            return Err(StoreError::InvalidInput(
                "player id must not be empty".into(),
            ));
        }

        let room = self.require_room(&code).await?;
        if room.player_ids.iter().any(|id| *id == player.id) {
            return Ok(room);
        }

        let mut players = room.players.clone();
        let mut player_ids = room.player_ids.clone();
        player_ids.push(player.id.clone());
        players.push(player);

        let patch = RoomPatch {
            players: Some(players),
            player_ids: Some(player_ids),
            ..Default::default()
        };
        self.backend
            .game_update(&code, patch)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("room {code}")))
    }

    /// Merge a partial update. Step changes must move forward; the
    /// backward direction is rejected before the backend sees the patch.
    pub async fn update_room(&self, code: &str, patch: RoomPatch) -> Result<GameRoom> {
        let code = normalize_room_code(code)?;
        if let Some(next) = patch.step {
            let room = self.require_room(&code).await?;
            if !room.step.allows_transition_to(next) {
                return Err(StoreError::InvalidInput(format!(
                    "cannot move from {} back to {}",
                    room.step.as_str(),
                    next.as_str()
                )));
            }
        }
        self.backend
            .game_update(&code, patch)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("room {code}")))
    }

    pub async fn delete_room(&self, code: &str) -> Result<()> {
        let code = normalize_room_code(code)?;
        self.backend.game_delete(&code).await
    }

    pub async fn list_rooms_for(
        &self,
        user_id: &str,
        step: Option<GameStep>,
    ) -> Result<Vec<GameRoom>> {
        self.backend.game_list(user_id, step).await
    }

    pub async fn subscribe(&self, code: &str, listener: GameListener) -> Result<Subscription> {
        let code = normalize_room_code(code)?;
        Ok(self.backend.game_subscribe(&code, listener).await)
    }

    /// Flip a player's ready flag.
    pub async fn set_ready(&self, code: &str, player_id: &str, ready: bool) -> Result<GameRoom> {
        let code = normalize_room_code(code)?;
        let room = self.require_room(&code).await?;

        let mut players = room.players.clone();
        let player = players
            .iter_mut()
            .find(|p| p.id == player_id)
            .ok_or_else(|| StoreError::NotFound(format!("player {player_id}")))?;
        player.is_ready = ready;

        let patch = RoomPatch {
            players: Some(players),
            player_ids: Some(room.player_ids.clone()),
            ..Default::default()
        };
        self.backend
            .game_update(&code, patch)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("room {code}")))
    }

    /// Replace a player's category selection, deduplicated against the
    /// canonical list.
    pub async fn select_categories(
        &self,
        code: &str,
        player_id: &str,
        categories: Vec<String>,
    ) -> Result<GameRoom> {
        let code = normalize_room_code(code)?;
        let room = self.require_room(&code).await?;

        let mut players = room.players.clone();
        let player = players
            .iter_mut()
            .find(|p| p.id == player_id)
            .ok_or_else(|| StoreError::NotFound(format!("player {player_id}")))?;
        player.selected_categories = dedup_categories(&categories);

        let patch = RoomPatch {
            players: Some(players),
            player_ids: Some(room.player_ids.clone()),
            ..Default::default()
        };
        self.backend
            .game_update(&code, patch)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("room {code}")))
    }

    /// Record a player's answer to the current question.
    pub async fn record_answer(
        &self,
        code: &str,
        player_id: &str,
        answer: String,
    ) -> Result<GameRoom> {
        let code = normalize_room_code(code)?;
        let room = self.require_room(&code).await?;

        if !room.player_ids.iter().any(|id| id == player_id) {
            return Err(StoreError::NotFound(format!("player {player_id}")));
        }
        let mut rounds = room.rounds.clone();
        let round = rounds
            .get_mut(room.current_question_index)
            .ok_or_else(|| StoreError::NotFound("current round".into()))?;
        round.answers.insert(player_id.to_string(), answer);

        let patch = RoomPatch {
            rounds: Some(rounds),
            ..Default::default()
        };
        self.backend
            .game_update(&code, patch)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("room {code}")))
    }

    async fn require_room(&self, code: &str) -> Result<GameRoom> {
        self.backend
            .game_get(code)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("room {code}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::types::Round;

    fn store() -> GameStore {
        GameStore::new(Arc::new(MemoryBackend::default()))
    }

    #[test]
    fn test_room_code_normalization() {
        assert_eq!(normalize_room_code("abcd-12").unwrap(), "ABCD-12");
        assert_eq!(normalize_room_code("  abcd  ").unwrap(), "ABCD");
        assert!(normalize_room_code("abc").is_err());
        assert!(normalize_room_code(&"x".repeat(65)).is_err());
        assert!(normalize_room_code("ab_d").is_err());
        assert!(normalize_room_code("ab d").is_err());
    }

    #[tokio::test]
    async fn test_invalid_code_fails_before_backend() {
        let store = store();
        let err = store
            .create_room("x!", Player::new("u1", "Alice"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_input");
        // Nothing was stored under any normalization of the bad code.
        assert!(store.list_rooms_for("u1", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let store = store();
        store
            .create_room("abcd-12", Player::new("u1", "Alice"))
            .await
            .unwrap();

        store
            .join_room("ABCD-12", Player::new("u2", "Bob"))
            .await
            .unwrap();
        let again = store
            .join_room("abcd-12", Player::new("u2", "Bob"))
            .await
            .unwrap();

        assert_eq!(again.players.len(), 2);
        assert_eq!(again.player_ids, vec!["u1".to_string(), "u2".to_string()]);
    }

    #[tokio::test]
    async fn test_player_ids_mirror_players_after_mutations() {
        let store = store();
        store
            .create_room("MIRROR", Player::new("u1", "Alice"))
            .await
            .unwrap();
        store
            .join_room("MIRROR", Player::new("u2", "Bob"))
            .await
            .unwrap();
        let room = store.set_ready("MIRROR", "u2", true).await.unwrap();

        let projected: Vec<_> = room.players.iter().map(|p| p.id.clone()).collect();
        assert_eq!(room.player_ids, projected);
        assert!(room.players[1].is_ready);
        assert!(room.player_ids.contains(&room.host_id));
    }

    #[tokio::test]
    async fn test_player_name_sanitized() {
        let store = store();
        let long_name = format!("  Ali\u{0007}ce{}  ", "x".repeat(60));
        let room = store
            .create_room("NAME", Player::new("u1", long_name))
            .await
            .unwrap();
        let name = &room.players[0].name;
        assert!(name.starts_with("Alice"));
        assert!(name.chars().count() <= MAX_PLAYER_NAME_CHARS);
        assert!(!name.contains('\u{0007}'));
    }

    #[tokio::test]
    async fn test_categories_deduplicated_against_canonical_list() {
        let store = store();
        store
            .create_room("CATS", Player::new("u1", "Alice"))
            .await
            .unwrap();
        let room = store
            .select_categories(
                "CATS",
                "u1",
                vec![
                    "hot-takes".into(),
                    "hot-takes".into(),
                    "astrology".into(),
                    "confessions".into(),
                ],
            )
            .await
            .unwrap();
        assert_eq!(
            room.players[0].selected_categories,
            vec!["hot-takes".to_string(), "confessions".to_string()]
        );
    }

    #[tokio::test]
    async fn test_step_cannot_move_backward() {
        let store = store();
        store
            .create_room("STEP", Player::new("u1", "Alice"))
            .await
            .unwrap();
        store
            .update_room(
                "STEP",
                RoomPatch {
                    step: Some(GameStep::Spicy),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let err = store
            .update_room(
                "STEP",
                RoomPatch {
                    step: Some(GameStep::Lobby),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_input");
    }

    #[tokio::test]
    async fn test_record_answer_requires_active_round() {
        let store = store();
        store
            .create_room("ANSW", Player::new("u1", "Alice"))
            .await
            .unwrap();

        let err = store
            .record_answer("ANSW", "u1", "yes".into())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");

        store
            .update_room(
                "ANSW",
                RoomPatch {
                    rounds: Some(vec![Round {
                        question: "Cats or dogs?".into(),
                        ..Default::default()
                    }]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let room = store.record_answer("ANSW", "u1", "cats".into()).await.unwrap();
        assert_eq!(room.rounds[0].answers.get("u1"), Some(&"cats".to_string()));
    }

    #[tokio::test]
    async fn test_get_deleted_room_is_not_found() {
        let store = store();
        store
            .create_room("GONE", Player::new("u1", "Alice"))
            .await
            .unwrap();
        store.delete_room("gone").await.unwrap();
        let err = store.get_room("GONE").await.unwrap_err();
        assert_eq!(err.code(), "not_found");
        // Deleting again is fine.
        store.delete_room("GONE").await.unwrap();
    }
}
