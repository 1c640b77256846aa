//! Session-bound CSRF tokens.
//!
//! Tokens live for an hour and are deliberately not single-use: a page may
//! validate the same token on every mutating request it makes, and several
//! tokens can be valid at once for one session (each page load issues its
//! own). Swept on the same deterministic-interval discipline as the rate
//! limiter, plus lazy eviction of the token being validated.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// CSRF tokens expire an hour after issuance.
pub const TOKEN_TTL_MINUTES: i64 = 60;

#[derive(Debug, Clone)]
struct IssuedToken {
    session_id: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct CsrfTokens {
    tokens: Mutex<HashMap<String, IssuedToken>>,
    cleanup_interval: Duration,
    last_sweep: Mutex<Instant>,
}

impl CsrfTokens {
    pub fn new() -> Self {
        Self::with_cleanup_interval(Duration::from_secs(60))
    }

    pub fn with_cleanup_interval(cleanup_interval: Duration) -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            cleanup_interval,
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Mint a token bound to the given session.
    pub fn issue(&self, session_id: &str) -> String {
        self.maybe_sweep();
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        let token = hex::encode(bytes);

        let mut tokens = self.lock_tokens();
        tokens.insert(
            token.clone(),
            IssuedToken {
                session_id: session_id.to_string(),
                expires_at: Utc::now() + ChronoDuration::minutes(TOKEN_TTL_MINUTES),
            },
        );
        token
    }

    /// True only for a live token bound to this exact session. The token
    /// survives validation and may be checked again.
    pub fn validate(&self, session_id: &str, token: &str) -> bool {
        self.maybe_sweep();
        let now = Utc::now();
        let mut tokens = self.lock_tokens();
        match tokens.get(token) {
            Some(issued) if issued.expires_at <= now => {
                tokens.remove(token);
                false
            }
            Some(issued) => issued.session_id == session_id,
            None => false,
        }
    }

    fn lock_tokens(&self) -> std::sync::MutexGuard<'_, HashMap<String, IssuedToken>> {
        match self.tokens.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn maybe_sweep(&self) {
        {
            let mut last = match self.last_sweep.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if last.elapsed() < self.cleanup_interval {
                return;
            }
            *last = Instant::now();
        }
        let now = Utc::now();
        let mut tokens = self.lock_tokens();
        let before = tokens.len();
        tokens.retain(|_, issued| issued.expires_at > now);
        let swept = before - tokens.len();
        if swept > 0 {
            tracing::debug!(swept, "csrf sweep evicted tokens");
        }
    }

    #[cfg(test)]
    fn force_expire(&self, token: &str) {
        if let Some(issued) = self.lock_tokens().get_mut(token) {
            issued.expires_at = Utc::now() - ChronoDuration::seconds(1);
        }
    }
}

impl Default for CsrfTokens {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_validates_repeatedly_within_lifetime() {
        let store = CsrfTokens::new();
        let token = store.issue("sess-1");
        assert!(store.validate("sess-1", &token));
        assert!(store.validate("sess-1", &token));
    }

    #[test]
    fn test_token_bound_to_its_session() {
        let store = CsrfTokens::new();
        let token = store.issue("sess-1");
        assert!(!store.validate("sess-2", &token));
        // A failed check against the wrong session doesn't consume it.
        assert!(store.validate("sess-1", &token));
    }

    #[test]
    fn test_multiple_live_tokens_per_session() {
        let store = CsrfTokens::new();
        let first = store.issue("sess-1");
        let second = store.issue("sess-1");
        assert_ne!(first, second);
        assert!(store.validate("sess-1", &first));
        assert!(store.validate("sess-1", &second));
    }

    #[test]
    fn test_expired_token_rejected_and_evicted() {
        let store = CsrfTokens::new();
        let token = store.issue("sess-1");
        store.force_expire(&token);
        assert!(!store.validate("sess-1", &token));
        assert!(store.lock_tokens().is_empty());
    }

    #[test]
    fn test_unknown_token_rejected() {
        let store = CsrfTokens::new();
        assert!(!store.validate("sess-1", "deadbeef"));
    }
}
