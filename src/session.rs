//! User account and auth-session lifecycle.

use crate::backend::Backend;
use crate::credential::CredentialVerifier;
use crate::error::{Result, StoreError};
use crate::types::{SessionToken, UserId, UserProfile};
use regex::Regex;
use std::sync::{Arc, LazyLock};

/// RFC-shaped, not RFC-complete: something@something.tld with no
/// whitespace. Anything fancier is the mail provider's problem.
static EMAIL_SHAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email regex is valid")
});

const MIN_PASSWORD_CHARS: usize = 8;

fn validate_email(email: &str) -> Result<()> {
    if EMAIL_SHAPE.is_match(email) {
        Ok(())
    } else {
        Err(StoreError::InvalidInput("malformed email address".into()))
    }
}

fn validate_password(password: &str) -> Result<()> {
    let long_enough = password.chars().count() >= MIN_PASSWORD_CHARS;
    let has_lower = password.chars().any(|c| c.is_ascii_lowercase());
    let has_upper = password.chars().any(|c| c.is_ascii_uppercase());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    if long_enough && has_lower && has_upper && has_digit {
        Ok(())
    } else {
        Err(StoreError::WeakPassword)
    }
}

/// Result of a successful sign-up or sign-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedIn {
    pub user_id: UserId,
    pub token: SessionToken,
}

pub struct SessionService {
    backend: Arc<dyn Backend>,
    verifier: Arc<dyn CredentialVerifier>,
    /// Verified against when the email is unknown, so a sign-in miss costs
    /// the same hash work as a wrong password for a real account.
    dummy_hash: String,
}

impl SessionService {
    pub fn new(backend: Arc<dyn Backend>, verifier: Arc<dyn CredentialVerifier>) -> Self {
        let dummy_hash = verifier.hash("timing-equalizer");
        Self {
            backend,
            verifier,
            dummy_hash,
        }
    }

    pub async fn sign_up(&self, email: &str, password: &str) -> Result<SignedIn> {
        let email = email.trim().to_ascii_lowercase();
        validate_email(&email)?;
        validate_password(password)?;

        if self.backend.user_find_by_email(&email).await?.is_some() {
            return Err(StoreError::Conflict(format!("user {email}")));
        }

        let hash = self.verifier.hash(password);
        let user = self.backend.user_create(&email, &hash).await?;
        let token = self.backend.session_create(&user.id).await?;
        tracing::info!(user_id = %user.id, "user signed up");
        Ok(SignedIn {
            user_id: user.id,
            token,
        })
    }

    /// One undifferentiated failure for every wrong input: the caller can
    /// never tell whether the email or the password was at fault.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<SignedIn> {
        let email = email.trim().to_ascii_lowercase();
        let user = self.backend.user_find_by_email(&email).await?;

        let hash = user
            .as_ref()
            .map(|u| u.password_hash.as_str())
            .unwrap_or(&self.dummy_hash);
        let verified = self.verifier.verify(password, hash);

        let Some(user) = user else {
            return Err(StoreError::InvalidCredentials);
        };
        if !verified {
            return Err(StoreError::InvalidCredentials);
        }

        let token = self.backend.session_create(&user.id).await?;
        tracing::debug!(user_id = %user.id, "user signed in");
        Ok(SignedIn {
            user_id: user.id,
            token,
        })
    }

    /// Unconditional and idempotent.
    pub async fn sign_out(&self, token: &str) -> Result<()> {
        self.backend.session_delete(token).await
    }

    pub async fn validate_session(&self, token: &str) -> Result<Option<UserId>> {
        self.backend.session_validate(token).await
    }

    /// The signed-in user's public profile; never includes the hash.
    pub async fn current_user(&self, token: &str) -> Result<Option<UserProfile>> {
        let Some(user_id) = self.backend.session_validate(token).await? else {
            return Ok(None);
        };
        Ok(self
            .backend
            .user_find_by_id(&user_id)
            .await?
            .map(|user| UserProfile::from(&user)))
    }
}
