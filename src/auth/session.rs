/// Per-process holder of the current token set with proactive refresh.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::provider::OAuthProvider;
use crate::auth::token_store::{TokenStore, DEFAULT_SUBJECT};
use crate::error::AuthError;
use crate::types::OAuthTokenSet;

/// Invoked when a refresh fails and a full re-login is required.
pub type ReauthCallback = Arc<dyn Fn() + Send + Sync>;

/// Owns the "current" token set for this process and a one-shot background
/// task that refreshes it shortly before expiry.
///
/// Token mutation (`save_tokens`, `logout`, the timer-fired `refresh`) is
/// serialized by cancelling the previous refresh task before installing a
/// replacement, so no two refreshes for the same token set run concurrently.
pub struct SessionManager {
    provider: Arc<dyn OAuthProvider>,
    token_store: Arc<dyn TokenStore>,
    subject: String,
    refresh_buffer: Duration,
    tokens: Mutex<Option<OAuthTokenSet>>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    on_reauth_required: Option<ReauthCallback>,
}

impl SessionManager {
    pub fn new(
        provider: Arc<dyn OAuthProvider>,
        token_store: Arc<dyn TokenStore>,
        refresh_buffer: Duration,
    ) -> Self {
        Self {
            provider,
            token_store,
            subject: DEFAULT_SUBJECT.to_string(),
            refresh_buffer,
            tokens: Mutex::new(None),
            refresh_task: Mutex::new(None),
            on_reauth_required: None,
        }
    }

    pub fn with_subject(mut self, subject: &str) -> Self {
        self.subject = subject.to_string();
        self
    }

    pub fn with_reauth_callback(mut self, callback: ReauthCallback) -> Self {
        self.on_reauth_required = Some(callback);
        self
    }

    /// Load persisted tokens. Expired tokens are refreshed immediately when a
    /// refresh token exists; otherwise `None` (caller must re-authenticate).
    pub async fn initialize(self: &Arc<Self>) -> Result<Option<OAuthTokenSet>, AuthError> {
        let Some(stored) = self.token_store.load(&self.subject)? else {
            return Ok(None);
        };

        if stored.is_expired() {
            if stored.refresh_token.is_none() {
                debug!("Stored tokens expired with no refresh token");
                return Ok(None);
            }
            *self.tokens.lock().unwrap() = Some(stored);
            let refreshed = self.refresh().await?;
            return Ok(Some(refreshed));
        }

        *self.tokens.lock().unwrap() = Some(stored.clone());
        self.schedule_refresh(&stored);
        Ok(Some(stored))
    }

    /// Current access token. Never refreshes implicitly; callers that need a
    /// guaranteed-fresh token use `refresh()` or rely on the background task.
    pub fn get_access_token(&self) -> Result<String, AuthError> {
        let tokens = self.tokens.lock().unwrap();
        match tokens.as_ref() {
            None => Err(AuthError::TokenExpired("No tokens".to_string())),
            Some(t) if t.is_expired() => {
                Err(AuthError::TokenExpired("access token expired".to_string()))
            }
            Some(t) => Ok(t.access_token.clone()),
        }
    }

    pub fn current_tokens(&self) -> Option<OAuthTokenSet> {
        self.tokens.lock().unwrap().clone()
    }

    /// Exchange the held refresh token for a new token set and persist it.
    pub async fn refresh(self: &Arc<Self>) -> Result<OAuthTokenSet, AuthError> {
        let refresh_token = {
            let tokens = self.tokens.lock().unwrap();
            tokens
                .as_ref()
                .and_then(|t| t.refresh_token.clone())
                .ok_or_else(|| AuthError::TokenRefresh("No refresh token".to_string()))?
        };

        match self.provider.refresh(&refresh_token).await {
            Ok(mut new_tokens) => {
                // Some providers omit the refresh token on rotation
                if new_tokens.refresh_token.is_none() {
                    new_tokens.refresh_token = Some(refresh_token);
                }
                self.save_tokens(new_tokens.clone())?;
                info!("Access token refreshed");
                Ok(new_tokens)
            }
            Err(e) => {
                warn!("Token refresh failed: {}", e);
                if let Some(callback) = &self.on_reauth_required {
                    callback();
                }
                match e {
                    AuthError::TokenRefresh(_) => Err(e),
                    other => Err(AuthError::TokenRefresh(other.to_string())),
                }
            }
        }
    }

    /// Persist the tokens and (re)schedule the background refresh. Cancels
    /// any previous schedule first; tokens without an expiry get none.
    pub fn save_tokens(self: &Arc<Self>, tokens: OAuthTokenSet) -> Result<(), AuthError> {
        self.token_store.store(&self.subject, &tokens)?;
        *self.tokens.lock().unwrap() = Some(tokens.clone());
        self.schedule_refresh(&tokens);
        Ok(())
    }

    /// Best-effort provider revocation, then local cleanup. Revocation
    /// failure never blocks local logout. Safe with no tokens present.
    pub async fn logout(self: &Arc<Self>) {
        self.cancel_refresh_task();

        let tokens = self.tokens.lock().unwrap().take();
        if let Some(tokens) = tokens {
            if let Err(e) = self.provider.revoke(&tokens.access_token).await {
                warn!("Token revocation failed (continuing local logout): {}", e);
            }
        }

        if let Err(e) = self.token_store.delete(&self.subject) {
            warn!("Failed to delete stored tokens: {}", e);
        }

        info!("Logged out");
    }

    /// True while a scheduled refresh is pending.
    pub fn has_scheduled_refresh(&self) -> bool {
        self.refresh_task
            .lock()
            .unwrap()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    fn schedule_refresh(self: &Arc<Self>, tokens: &OAuthTokenSet) {
        // Cancel-before-replace: the old schedule must be dead before a new
        // one exists, or two refreshes could race
        let mut task = self.refresh_task.lock().unwrap();
        if let Some(old) = task.take() {
            old.abort();
        }

        let Some(expires_at) = tokens.expires_at() else {
            return;
        };

        let fire_in = (expires_at - Utc::now().timestamp() - self.refresh_buffer.as_secs() as i64)
            .max(0) as u64;
        let manager = self.clone();

        *task = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(fire_in)).await;
            debug!("Scheduled refresh firing");
            if let Err(e) = manager.refresh().await {
                warn!("Scheduled refresh failed: {}", e);
            }
        }));
    }

    fn cancel_refresh_task(&self) {
        if let Some(task) = self.refresh_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(task) = self.refresh_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token_store::MemoryTokenStore;
    use crate::types::UserInfo;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct FakeProvider {
        refresh_calls: AtomicU32,
        fail_refresh: bool,
    }

    impl FakeProvider {
        fn new(fail_refresh: bool) -> Self {
            Self {
                refresh_calls: AtomicU32::new(0),
                fail_refresh,
            }
        }
    }

    #[async_trait]
    impl OAuthProvider for FakeProvider {
        fn authorize_url(&self, _r: &str, _s: &str, _p: Option<&str>) -> String {
            String::new()
        }

        async fn exchange_code(
            &self,
            _code: &str,
            _redirect_uri: &str,
            _pkce_verifier: Option<&str>,
        ) -> Result<OAuthTokenSet, AuthError> {
            unreachable!("not exercised here")
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<OAuthTokenSet, AuthError> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_refresh {
                return Err(AuthError::TokenRefresh("provider said no".to_string()));
            }
            Ok(tokens("fresh-at", Some("fresh-rt"), Some(3600)))
        }

        async fn revoke(&self, _token: &str) -> Result<(), AuthError> {
            Err(AuthError::authentication("revoke_failed", "always fails"))
        }

        async fn fetch_userinfo(&self, _access_token: &str) -> Result<UserInfo, AuthError> {
            unreachable!("not exercised here")
        }
    }

    fn tokens(at: &str, rt: Option<&str>, expires_in: Option<i64>) -> OAuthTokenSet {
        OAuthTokenSet {
            access_token: at.to_string(),
            token_type: "Bearer".to_string(),
            refresh_token: rt.map(String::from),
            expires_in,
            issued_at: Utc::now().timestamp(),
            id_token: None,
            scope: None,
        }
    }

    fn manager(fail_refresh: bool) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(
            Arc::new(FakeProvider::new(fail_refresh)),
            Arc::new(MemoryTokenStore::new()),
            Duration::from_secs(300),
        ))
    }

    #[tokio::test]
    async fn test_initialize_empty_store() {
        let manager = manager(false);
        assert!(manager.initialize().await.unwrap().is_none());
        assert!(manager.get_access_token().is_err());
    }

    #[tokio::test]
    async fn test_initialize_refreshes_expired_tokens() {
        let manager = manager(false);
        let mut expired = tokens("old-at", Some("old-rt"), Some(3600));
        expired.issued_at = Utc::now().timestamp() - 7200;
        manager.token_store.store(DEFAULT_SUBJECT, &expired).unwrap();

        let loaded = manager.initialize().await.unwrap().unwrap();
        assert_eq!(loaded.access_token, "fresh-at");
        assert_eq!(manager.get_access_token().unwrap(), "fresh-at");
    }

    #[tokio::test]
    async fn test_initialize_expired_without_refresh_token() {
        let manager = manager(false);
        let mut expired = tokens("old-at", None, Some(3600));
        expired.issued_at = Utc::now().timestamp() - 7200;
        manager.token_store.store(DEFAULT_SUBJECT, &expired).unwrap();

        assert!(manager.initialize().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expiry_invariant_any_delta() {
        // issued_at = now - (expires_in + delta) is expired for every delta > 0
        for delta in [1, 60, 86_400] {
            let manager = manager(false);
            let mut expired = tokens("old-at", Some("rt"), Some(3600));
            expired.issued_at = Utc::now().timestamp() - (3600 + delta);
            manager.token_store.store(DEFAULT_SUBJECT, &expired).unwrap();

            let loaded = manager.initialize().await.unwrap().unwrap();
            assert_eq!(loaded.access_token, "fresh-at", "delta {delta}");
        }
    }

    #[tokio::test]
    async fn test_get_access_token_no_implicit_refresh() {
        let manager = manager(false);
        let mut expired = tokens("old-at", Some("rt"), Some(3600));
        expired.issued_at = Utc::now().timestamp() - 7200;
        *manager.tokens.lock().unwrap() = Some(expired);

        assert!(matches!(
            manager.get_access_token(),
            Err(AuthError::TokenExpired(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token() {
        let manager = manager(false);
        manager.save_tokens(tokens("at", None, Some(3600))).unwrap();

        let err = manager.refresh().await.unwrap_err();
        assert!(matches!(err, AuthError::TokenRefresh(_)));
    }

    #[tokio::test]
    async fn test_refresh_failure_invokes_reauth_callback() {
        let invoked = Arc::new(AtomicBool::new(false));
        let flag = invoked.clone();

        let manager = Arc::new(
            SessionManager::new(
                Arc::new(FakeProvider::new(true)),
                Arc::new(MemoryTokenStore::new()),
                Duration::from_secs(300),
            )
            .with_reauth_callback(Arc::new(move || flag.store(true, Ordering::SeqCst))),
        );
        manager
            .save_tokens(tokens("at", Some("rt"), Some(3600)))
            .unwrap();

        assert!(manager.refresh().await.is_err());
        assert!(invoked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_refresh_scheduling() {
        let manager = manager(false);

        manager
            .save_tokens(tokens("at", Some("rt"), Some(3600)))
            .unwrap();
        assert!(manager.has_scheduled_refresh());

        manager.save_tokens(tokens("at2", Some("rt"), None)).unwrap();
        assert!(!manager.has_scheduled_refresh());

        manager
            .save_tokens(tokens("at3", Some("rt"), Some(3600)))
            .unwrap();
        assert!(manager.has_scheduled_refresh());

        manager.logout().await;
        assert!(!manager.has_scheduled_refresh());
    }

    #[tokio::test]
    async fn test_logout_swallows_revocation_failure() {
        let manager = manager(false); // FakeProvider::revoke always fails
        manager
            .save_tokens(tokens("at", Some("rt"), Some(3600)))
            .unwrap();

        manager.logout().await;

        assert!(manager.get_access_token().is_err());
        assert!(manager
            .token_store
            .load(DEFAULT_SUBJECT)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_logout_with_no_tokens() {
        let manager = manager(false);
        manager.logout().await;
        assert!(manager.get_access_token().is_err());
    }
}
