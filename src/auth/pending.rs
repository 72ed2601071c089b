/// Single-use pending-authorization state for the deploy-mode login flow.
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;

/// Everything the callback handler needs to finish a login that `/auth/login`
/// started, keyed by the opaque `state` value.
#[derive(Debug, Clone)]
pub struct PendingAuthState {
    pub pkce_verifier: Option<String>,
    pub redirect_uri: String,
    pub nonce: String,
    pub created_at: i64,
}

/// Process-local store of in-flight login attempts.
///
/// Entries are single-use: `take` removes on first match, so a `state` value
/// is accepted by the callback endpoint at most once. Entries older than
/// `max_age` are purged lazily on every insert.
///
/// This store is deliberately process-local; deploy mode assumes sticky
/// routing of a login attempt's `/auth/login` and `/auth/callback` pair to
/// the same worker. Cross-worker correctness for the *final* session comes
/// from the shared SessionStore, not from this transient bookkeeping.
pub struct PendingAuthStore {
    entries: Mutex<HashMap<String, PendingAuthState>>,
    max_age: Duration,
}

impl PendingAuthStore {
    pub fn new(max_age: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_age,
        }
    }

    pub fn insert(&self, state: String, pending: PendingAuthState) {
        let mut entries = self.entries.lock().unwrap();
        let cutoff = Utc::now().timestamp() - self.max_age.as_secs() as i64;
        entries.retain(|_, p| p.created_at > cutoff);
        entries.insert(state, pending);
    }

    /// Remove and return the entry for `state`. Expired entries are treated
    /// as absent.
    pub fn take(&self, state: &str) -> Option<PendingAuthState> {
        let mut entries = self.entries.lock().unwrap();
        let pending = entries.remove(state)?;
        let cutoff = Utc::now().timestamp() - self.max_age.as_secs() as i64;
        if pending.created_at <= cutoff {
            return None;
        }
        Some(pending)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(created_at: i64) -> PendingAuthState {
        PendingAuthState {
            pkce_verifier: Some("verifier".to_string()),
            redirect_uri: "https://app.example/auth/callback".to_string(),
            nonce: "nonce".to_string(),
            created_at,
        }
    }

    #[test]
    fn test_take_is_single_use() {
        let store = PendingAuthStore::new(Duration::from_secs(600));
        store.insert("state-1".to_string(), pending(Utc::now().timestamp()));

        assert!(store.take("state-1").is_some());
        assert!(store.take("state-1").is_none());
    }

    #[test]
    fn test_unknown_state_is_none() {
        let store = PendingAuthStore::new(Duration::from_secs(600));
        assert!(store.take("never-inserted").is_none());
    }

    #[test]
    fn test_expired_entries_are_rejected() {
        let store = PendingAuthStore::new(Duration::from_secs(600));
        store.insert(
            "stale".to_string(),
            pending(Utc::now().timestamp() - 601),
        );

        assert!(store.take("stale").is_none());
    }

    #[test]
    fn test_insert_purges_expired() {
        let store = PendingAuthStore::new(Duration::from_secs(600));
        store.insert("old".to_string(), pending(Utc::now().timestamp() - 700));
        store.insert("new".to_string(), pending(Utc::now().timestamp()));

        assert_eq!(store.len(), 1);
        assert!(store.take("new").is_some());
    }
}
