use thiserror::Error;

/// Error taxonomy for the store. Every variant carries a stable
/// machine-readable code (`code()`) plus a human message; internal detail
/// never crosses the external boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Malformed room code / email / password shape. Rejected before any
    /// backend call is made.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Password fails the minimum policy (8+ chars, lower, upper, digit).
    #[error("password must be at least 8 characters with a lowercase letter, an uppercase letter, and a digit")]
    WeakPassword,

    /// Duplicate room code or email.
    #[error("{0} already exists")]
    Conflict(String),

    /// Operating on an absent or expired entity.
    #[error("{0} not found")]
    NotFound(String),

    /// Sign-in failure. Deliberately undifferentiated so callers cannot
    /// tell which of email/password was wrong.
    #[error("invalid email or password")]
    InvalidCredentials,

    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("csrf token rejected")]
    CsrfRejected,

    /// The storage layer itself failed (connection/IO). Retryable with
    /// backoff; never conflated with NotFound.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
}

impl StoreError {
    /// Stable machine-readable code for the transport layer.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::InvalidInput(_) => "invalid_input",
            StoreError::WeakPassword => "weak_password",
            StoreError::Conflict(_) => "conflict",
            StoreError::NotFound(_) => "not_found",
            StoreError::InvalidCredentials => "invalid_credentials",
            StoreError::RateLimited { .. } => "rate_limited",
            StoreError::CsrfRejected => "csrf_rejected",
            StoreError::BackendUnavailable(_) => "backend_unavailable",
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::BackendUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::BackendUnavailable(format!("serialization failed: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(StoreError::InvalidInput("x".into()).code(), "invalid_input");
        assert_eq!(StoreError::Conflict("room".into()).code(), "conflict");
        assert_eq!(StoreError::NotFound("room".into()).code(), "not_found");
        assert_eq!(StoreError::InvalidCredentials.code(), "invalid_credentials");
        assert_eq!(
            StoreError::RateLimited {
                retry_after_secs: 3
            }
            .code(),
            "rate_limited"
        );
        assert_eq!(StoreError::CsrfRejected.code(), "csrf_rejected");
        assert_eq!(
            StoreError::BackendUnavailable("db down".into()).code(),
            "backend_unavailable"
        );
    }

    #[test]
    fn test_messages_do_not_leak_detail() {
        let err = StoreError::InvalidCredentials;
        assert_eq!(err.to_string(), "invalid email or password");
    }
}
