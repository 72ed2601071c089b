/// Durable OAuth token storage keyed by subject.
use std::collections::HashMap;
use std::sync::Mutex;

use keyring::Entry;

use crate::error::AuthError;
use crate::types::OAuthTokenSet;

/// Subject key used by single-user native installs.
pub const DEFAULT_SUBJECT: &str = "default";

/// Persistent storage of token sets per subject key. Stored values are
/// independent copies, never shared references.
pub trait TokenStore: Send + Sync {
    fn store(&self, subject: &str, tokens: &OAuthTokenSet) -> Result<(), AuthError>;
    fn load(&self, subject: &str) -> Result<Option<OAuthTokenSet>, AuthError>;
    /// Idempotent; deleting an absent subject succeeds.
    fn delete(&self, subject: &str) -> Result<(), AuthError>;

    fn has_tokens(&self, subject: &str) -> bool {
        self.load(subject).ok().flatten().is_some()
    }
}

/// In-process store for tests and the memory backend.
#[derive(Default)]
pub struct MemoryTokenStore {
    entries: Mutex<HashMap<String, OAuthTokenSet>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn store(&self, subject: &str, tokens: &OAuthTokenSet) -> Result<(), AuthError> {
        self.entries
            .lock()
            .unwrap()
            .insert(subject.to_string(), tokens.clone());
        Ok(())
    }

    fn load(&self, subject: &str) -> Result<Option<OAuthTokenSet>, AuthError> {
        Ok(self.entries.lock().unwrap().get(subject).cloned())
    }

    fn delete(&self, subject: &str) -> Result<(), AuthError> {
        self.entries.lock().unwrap().remove(subject);
        Ok(())
    }
}

/// System keyring store: Secret Service (Linux), Keychain (macOS),
/// Credential Manager (Windows). Token sets are stored as JSON under
/// `(service, subject)`.
pub struct KeyringTokenStore {
    service: String,
}

impl KeyringTokenStore {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
        }
    }

    fn entry(&self, subject: &str) -> Result<Entry, AuthError> {
        Entry::new(&self.service, subject).map_err(|e| AuthError::TokenStore(e.to_string()))
    }
}

impl TokenStore for KeyringTokenStore {
    fn store(&self, subject: &str, tokens: &OAuthTokenSet) -> Result<(), AuthError> {
        let json = serde_json::to_string(tokens)
            .map_err(|e| AuthError::TokenStore(e.to_string()))?;
        self.entry(subject)?
            .set_password(&json)
            .map_err(|e| AuthError::TokenStore(e.to_string()))
    }

    fn load(&self, subject: &str) -> Result<Option<OAuthTokenSet>, AuthError> {
        match self.entry(subject)?.get_password() {
            Ok(json) => {
                let tokens = serde_json::from_str(&json)
                    .map_err(|e| AuthError::TokenStore(e.to_string()))?;
                Ok(Some(tokens))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(AuthError::TokenStore(e.to_string())),
        }
    }

    fn delete(&self, subject: &str) -> Result<(), AuthError> {
        match self.entry(subject)?.delete_password() {
            Ok(()) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()), // Already deleted
            Err(e) => Err(AuthError::TokenStore(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tokens() -> OAuthTokenSet {
        OAuthTokenSet {
            access_token: "at".to_string(),
            token_type: "Bearer".to_string(),
            refresh_token: Some("rt".to_string()),
            expires_in: Some(3600),
            issued_at: 1_700_000_000,
            id_token: None,
            scope: None,
        }
    }

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryTokenStore::new();
        assert!(store.load("alice").unwrap().is_none());
        assert!(!store.has_tokens("alice"));

        store.store("alice", &sample_tokens()).unwrap();
        let loaded = store.load("alice").unwrap().unwrap();
        assert_eq!(loaded, sample_tokens());
        assert!(store.has_tokens("alice"));

        store.delete("alice").unwrap();
        assert!(store.load("alice").unwrap().is_none());
        // Deleting again is fine
        store.delete("alice").unwrap();
    }

    #[test]
    fn test_memory_store_copies_are_independent() {
        let store = MemoryTokenStore::new();
        let mut tokens = sample_tokens();
        store.store("bob", &tokens).unwrap();

        tokens.access_token = "mutated".to_string();
        let loaded = store.load("bob").unwrap().unwrap();
        assert_eq!(loaded.access_token, "at");
    }

    #[test]
    #[ignore] // Requires system keyring
    fn test_keyring_round_trip() {
        let store = KeyringTokenStore::new("atrium-test");
        store.store("test-subject", &sample_tokens()).unwrap();

        let loaded = store.load("test-subject").unwrap().unwrap();
        assert_eq!(loaded.access_token, "at");

        store.delete("test-subject").unwrap();
        assert!(store.load("test-subject").unwrap().is_none());
    }
}
