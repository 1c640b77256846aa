use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Opaque ID types for type safety
pub type UserId = String;
pub type PlayerId = String;
pub type RoomCode = String;
pub type SessionToken = String;

/// Canonical question categories players can pick from. Selections are
/// deduplicated against this list before they are stored.
pub const CATEGORIES: &[&str] = &[
    "icebreakers",
    "deep-cuts",
    "would-you-rather",
    "hot-takes",
    "confessions",
    "hypotheticals",
    "nostalgia",
    "dealbreakers",
];

/// Maximum length of a player display name after sanitization.
pub const MAX_PLAYER_NAME_CHARS: usize = 32;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum GameStep {
    Lobby,
    Categories,
    Spicy,
    Game,
    Summary,
}

impl GameStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameStep::Lobby => "lobby",
            GameStep::Categories => "categories",
            GameStep::Spicy => "spicy",
            GameStep::Game => "game",
            GameStep::Summary => "summary",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "lobby" => Some(GameStep::Lobby),
            "categories" => Some(GameStep::Categories),
            "spicy" => Some(GameStep::Spicy),
            "game" => Some(GameStep::Game),
            "summary" => Some(GameStep::Summary),
            _ => None,
        }
    }

    /// Steps only move forward in normal play; staying put is fine
    /// (idempotent re-submission of the current step).
    pub fn allows_transition_to(&self, next: GameStep) -> bool {
        next >= *self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Player {
    pub id: PlayerId,
    pub name: String,
    pub email: Option<String>,
    pub is_ready: bool,
    pub selected_categories: Vec<String>,
}

impl Player {
    pub fn new(id: impl Into<PlayerId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: None,
            is_ready: false,
            selected_categories: Vec::new(),
        }
    }
}

/// One question round: the question text plus each player's answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Round {
    pub question: String,
    /// Answers keyed by player id.
    #[serde(default)]
    pub answers: HashMap<PlayerId, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GameRoom {
    pub room_code: RoomCode,
    pub host_id: PlayerId,
    pub players: Vec<Player>,
    /// Denormalized ordered id projection of `players`. GameStore keeps the
    /// two in sync; backends store whatever they are handed.
    pub player_ids: Vec<PlayerId>,
    pub step: GameStep,
    pub spicy_level: u8,
    pub chaos_mode: bool,
    pub rounds: Vec<Round>,
    pub current_question_index: usize,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl GameRoom {
    /// Build a fresh room in the lobby step with the host as sole player.
    /// `room_code` must already be normalized and validated by the caller.
    pub fn new(room_code: RoomCode, host: Player, ttl: Duration) -> Self {
        let now = Utc::now();
        let host_id = host.id.clone();
        let player_ids = vec![host_id.clone()];
        Self {
            room_code,
            host_id,
            players: vec![host],
            player_ids,
            step: GameStep::Lobby,
            spicy_level: 0,
            chaos_mode: false,
            rounds: Vec::new(),
            current_question_index: 0,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Partial room update: only the supplied fields are merged into the stored
/// room, everything else is left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub players: Option<Vec<Player>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player_ids: Option<Vec<PlayerId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<GameStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spicy_level: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chaos_mode: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rounds: Option<Vec<Round>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_question_index: Option<usize>,
}

impl RoomPatch {
    pub fn is_empty(&self) -> bool {
        self.players.is_none()
            && self.player_ids.is_none()
            && self.step.is_none()
            && self.spicy_level.is_none()
            && self.chaos_mode.is_none()
            && self.rounds.is_none()
            && self.current_question_index.is_none()
    }

    /// Merge this patch into a room, field by field.
    pub fn apply_to(&self, room: &mut GameRoom) {
        if let Some(players) = &self.players {
            room.players = players.clone();
        }
        if let Some(player_ids) = &self.player_ids {
            room.player_ids = player_ids.clone();
        }
        if let Some(step) = self.step {
            room.step = step;
        }
        if let Some(spicy_level) = self.spicy_level {
            room.spicy_level = spicy_level;
        }
        if let Some(chaos_mode) = self.chaos_mode {
            room.chaos_mode = chaos_mode;
        }
        if let Some(rounds) = &self.rounds {
            room.rounds = rounds.clone();
        }
        if let Some(index) = self.current_question_index {
            room.current_question_index = index;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: UserId,
    pub email: String,
    /// Only SessionService and the backends ever see this; service
    /// responses expose `UserProfile` instead.
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Public projection of a user, safe to hand back to callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserProfile {
    pub id: UserId,
    pub email: String,
}

impl From<&User> for UserProfile {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.clone(),
            email: user.email.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthSession {
    pub token: SessionToken,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AuthSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_transitions_forward_only() {
        assert!(GameStep::Lobby.allows_transition_to(GameStep::Categories));
        assert!(GameStep::Categories.allows_transition_to(GameStep::Spicy));
        assert!(GameStep::Spicy.allows_transition_to(GameStep::Summary));
        assert!(GameStep::Game.allows_transition_to(GameStep::Game));
        assert!(!GameStep::Spicy.allows_transition_to(GameStep::Lobby));
        assert!(!GameStep::Summary.allows_transition_to(GameStep::Game));
    }

    #[test]
    fn test_step_round_trips_as_str() {
        for step in [
            GameStep::Lobby,
            GameStep::Categories,
            GameStep::Spicy,
            GameStep::Game,
            GameStep::Summary,
        ] {
            assert_eq!(GameStep::from_str(step.as_str()), Some(step));
        }
        assert_eq!(GameStep::from_str("podium"), None);
    }

    #[test]
    fn test_new_room_invariant() {
        let room = GameRoom::new(
            "ABCD".to_string(),
            Player::new("u1", "Alice"),
            Duration::hours(24),
        );
        assert_eq!(room.host_id, "u1");
        assert_eq!(room.player_ids, vec!["u1".to_string()]);
        assert_eq!(room.players.len(), 1);
        assert_eq!(room.step, GameStep::Lobby);
        assert_eq!(room.expires_at, room.created_at + Duration::hours(24));
    }

    #[test]
    fn test_patch_merges_only_supplied_fields() {
        let mut room = GameRoom::new(
            "ABCD".to_string(),
            Player::new("u1", "Alice"),
            Duration::hours(24),
        );
        room.spicy_level = 2;

        let patch = RoomPatch {
            step: Some(GameStep::Categories),
            ..Default::default()
        };
        patch.apply_to(&mut room);

        assert_eq!(room.step, GameStep::Categories);
        assert_eq!(room.spicy_level, 2);
        assert_eq!(room.host_id, "u1");
        assert_eq!(room.player_ids, vec!["u1".to_string()]);
    }
}
