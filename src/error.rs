use thiserror::Error;

/// Errors surfaced by the authorization flow and token lifecycle.
///
/// Timeout and cancellation are distinct from a rejected flow so callers can
/// tell "user took too long" from "user hit cancel" from "credentials rejected".
#[derive(Debug, Error)]
pub enum AuthError {
    /// Provider rejected the flow, or the returned state did not match.
    #[error("authentication failed: {code}: {description}")]
    Authentication { code: String, description: String },

    /// The configured auth timeout elapsed before a callback arrived.
    #[error("authorization flow timed out")]
    FlowTimeout,

    /// `cancel()` was called while the flow was waiting.
    #[error("authorization flow cancelled")]
    FlowCancelled,

    /// No usable access token is held locally.
    #[error("no access token available: {0}")]
    TokenExpired(String),

    /// A refresh attempt failed (missing refresh token or provider rejection).
    #[error("token refresh failed: {0}")]
    TokenRefresh(String),

    /// Token persistence failed (keyring or serialization).
    #[error("token store error: {0}")]
    TokenStore(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl AuthError {
    pub fn authentication(code: impl Into<String>, description: impl Into<String>) -> Self {
        AuthError::Authentication {
            code: code.into(),
            description: description.into(),
        }
    }
}

/// Errors from the shared state backends.
///
/// These propagate as-is; retry/backoff on a flaky Redis is the caller's
/// concern, not this layer's.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("unknown state backend: {0}")]
    UnknownBackend(String),
}

pub type StateResult<T> = std::result::Result<T, StateError>;
