use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// OAuth token set as returned by a provider's token endpoint.
///
/// Persisted copies (TokenStore, Redis) are independent values; whoever
/// received the set from the provider last owns the canonical copy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OAuthTokenSet {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
    #[serde(default = "now_timestamp")]
    pub issued_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

fn now_timestamp() -> i64 {
    Utc::now().timestamp()
}

impl OAuthTokenSet {
    /// A token set without `expires_in` never expires.
    pub fn is_expired(&self) -> bool {
        match self.expires_in {
            Some(expires_in) => self.issued_at + expires_in <= Utc::now().timestamp(),
            None => false,
        }
    }

    /// Absolute expiry timestamp, or `None` for non-expiring tokens.
    pub fn expires_at(&self) -> Option<i64> {
        self.expires_in.map(|e| self.issued_at + e)
    }
}

/// State machine for a single authorization flow attempt.
///
/// Transitions are one-directional; terminal states never transition further.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthFlowState {
    Pending,
    AwaitingCallback,
    Exchanging,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl AuthFlowState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AuthFlowState::Completed
                | AuthFlowState::Failed
                | AuthFlowState::TimedOut
                | AuthFlowState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AuthFlowState::Pending => "pending",
            AuthFlowState::AwaitingCallback => "awaiting_callback",
            AuthFlowState::Exchanging => "exchanging",
            AuthFlowState::Completed => "completed",
            AuthFlowState::Failed => "failed",
            AuthFlowState::TimedOut => "timed_out",
            AuthFlowState::Cancelled => "cancelled",
        }
    }
}

/// User identity returned by the provider's userinfo endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserInfo {
    /// Stable subject identifier (`sub` claim or provider user id).
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
}

/// Outcome of a completed native authorization flow.
#[derive(Debug, Clone)]
pub struct AuthResult {
    pub success: bool,
    pub tokens: Option<OAuthTokenSet>,
    pub user_info: Option<UserInfo>,
    pub error: Option<String>,
}

/// Server-side session for an authenticated user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSession {
    pub session_id: String,
    pub user_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl UserSession {
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= Utc::now().timestamp(),
            None => false,
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// A registered widget: renderable content plus its capability token.
///
/// Exactly one worker owns a widget (the one that rendered it); other workers
/// route callback events to the owner via the ConnectionRouter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WidgetRecord {
    pub widget_id: String,
    pub html: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_worker_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: i64,
}

/// Live connection-owner entry for a widget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub widget_id: String,
    pub worker_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub connected_at: i64,
    pub last_heartbeat: i64,
}

/// Transient event relayed between workers. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventMessage {
    pub event_type: String,
    pub widget_id: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub source_worker_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_set_round_trip() {
        let tokens = OAuthTokenSet {
            access_token: "at-123".to_string(),
            token_type: "Bearer".to_string(),
            refresh_token: Some("rt-456".to_string()),
            expires_in: Some(3600),
            issued_at: 1_700_000_000,
            id_token: None,
            scope: Some("openid profile".to_string()),
        };

        let json = serde_json::to_string(&tokens).unwrap();
        let back: OAuthTokenSet = serde_json::from_str(&json).unwrap();

        assert_eq!(back.access_token, tokens.access_token);
        assert_eq!(back.token_type, tokens.token_type);
        assert_eq!(back.refresh_token, tokens.refresh_token);
        assert_eq!(back.expires_in, tokens.expires_in);
        assert_eq!(back.scope, tokens.scope);
    }

    #[test]
    fn test_token_set_partial_payload_defaults() {
        let back: OAuthTokenSet = serde_json::from_str(r#"{"access_token":"at-only"}"#).unwrap();

        assert_eq!(back.access_token, "at-only");
        assert_eq!(back.token_type, "Bearer");
        assert!(back.refresh_token.is_none());
        assert!(back.expires_in.is_none());
        assert!(back.scope.is_none());
        // issued_at defaults to "now", so a partial payload is not expired
        assert!(!back.is_expired());
    }

    #[test]
    fn test_token_expiry() {
        let now = Utc::now().timestamp();

        let expired = OAuthTokenSet {
            access_token: "at".to_string(),
            token_type: "Bearer".to_string(),
            refresh_token: None,
            expires_in: Some(3600),
            issued_at: now - 3601,
            id_token: None,
            scope: None,
        };
        assert!(expired.is_expired());

        let live = OAuthTokenSet {
            issued_at: now - 10,
            ..expired.clone()
        };
        assert!(!live.is_expired());

        let no_expiry = OAuthTokenSet {
            expires_in: None,
            issued_at: now - 1_000_000,
            ..expired
        };
        assert!(!no_expiry.is_expired());
    }

    #[test]
    fn test_flow_state_terminal() {
        assert!(!AuthFlowState::Pending.is_terminal());
        assert!(!AuthFlowState::AwaitingCallback.is_terminal());
        assert!(!AuthFlowState::Exchanging.is_terminal());
        assert!(AuthFlowState::Completed.is_terminal());
        assert!(AuthFlowState::Failed.is_terminal());
        assert!(AuthFlowState::TimedOut.is_terminal());
        assert!(AuthFlowState::Cancelled.is_terminal());
    }

    #[test]
    fn test_session_expiry() {
        let now = Utc::now().timestamp();
        let session = UserSession {
            session_id: "s1".to_string(),
            user_id: "u1".to_string(),
            roles: vec!["viewer".to_string()],
            metadata: HashMap::new(),
            created_at: now,
            expires_at: Some(now - 1),
        };
        assert!(session.is_expired());
        assert!(session.has_role("viewer"));
        assert!(!session.has_role("admin"));

        let open_ended = UserSession {
            expires_at: None,
            ..session
        };
        assert!(!open_ended.is_expired());
    }
}
