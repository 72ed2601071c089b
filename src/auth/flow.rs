/// State machine driving one OAuth2 authorization-code flow to completion.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::auth::callback::CallbackServer;
use crate::auth::provider::{generate_state, OAuthProvider, Pkce};
use crate::auth::token_store::TokenStore;
use crate::error::AuthError;
use crate::types::{AuthFlowState, AuthResult};

/// Callback used to present the authorize URL to the user.
pub type ShowWindow = Box<dyn FnOnce(&str) + Send>;
/// Callback used to dismiss whatever `ShowWindow` opened.
pub type CloseWindow = Box<dyn FnOnce() + Send>;

/// How often a blocked `run_native` checks for cancellation.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Orchestrates one flow attempt, native or deploy. Single-shot: a new
/// attempt requires a new manager.
///
/// `run_native` blocks its calling thread (it owns a short-lived
/// current-thread runtime internally), so invoke it from a dedicated thread,
/// never from inside an async executor.
pub struct AuthFlowManager {
    provider: Arc<dyn OAuthProvider>,
    token_store: Option<Arc<dyn TokenStore>>,
    auth_timeout: Duration,
    pkce_enabled: bool,
    callback_port: u16,
    state: Mutex<AuthFlowState>,
    cancelled: Arc<AtomicBool>,
}

impl AuthFlowManager {
    pub fn new(provider: Arc<dyn OAuthProvider>, auth_timeout: Duration) -> Self {
        Self {
            provider,
            token_store: None,
            auth_timeout,
            pkce_enabled: true,
            callback_port: 0,
            state: Mutex::new(AuthFlowState::Pending),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Persist exchanged tokens under the user's subject id on completion.
    pub fn with_token_store(mut self, store: Arc<dyn TokenStore>) -> Self {
        self.token_store = Some(store);
        self
    }

    pub fn with_pkce(mut self, enabled: bool) -> Self {
        self.pkce_enabled = enabled;
        self
    }

    /// Explicit loopback port instead of an OS-assigned one.
    pub fn with_callback_port(mut self, port: u16) -> Self {
        self.callback_port = port;
        self
    }

    pub fn flow_state(&self) -> AuthFlowState {
        *self.state.lock().unwrap()
    }

    /// Wake a concurrently blocked `run_native` with `FlowCancelled`.
    /// Safe to call from any thread.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Transitions are one-directional; once terminal, the state is frozen.
    fn set_state(&self, next: AuthFlowState) {
        let mut state = self.state.lock().unwrap();
        if !state.is_terminal() {
            debug!("Auth flow: {} -> {}", state.as_str(), next.as_str());
            *state = next;
        }
    }

    /// Deploy mode: the login URL the caller should redirect the browser to.
    /// The callback half of the deploy state machine lives in the HTTP routes.
    pub fn run_deploy(&self, base_url: Option<&str>) -> String {
        match base_url {
            Some(base) => format!("{}/auth/login", base.trim_end_matches('/')),
            None => "/auth/login".to_string(),
        }
    }

    /// Drive the native loopback flow to completion, blocking until a
    /// callback arrives, the timeout elapses, or `cancel()` fires.
    pub fn run_native(
        &self,
        show_window: Option<ShowWindow>,
        close_window: Option<CloseWindow>,
    ) -> Result<AuthResult, AuthError> {
        let server = CallbackServer::new(self.callback_port);
        let result = self.run_native_inner(&server, show_window);
        server.stop();

        if let Some(close) = close_window {
            close();
        }

        match &result {
            Ok(_) => self.set_state(AuthFlowState::Completed),
            Err(AuthError::FlowTimeout) => self.set_state(AuthFlowState::TimedOut),
            Err(AuthError::FlowCancelled) => self.set_state(AuthFlowState::Cancelled),
            Err(_) => self.set_state(AuthFlowState::Failed),
        }

        result
    }

    fn run_native_inner(
        &self,
        server: &CallbackServer,
        show_window: Option<ShowWindow>,
    ) -> Result<AuthResult, AuthError> {
        let expected_state = generate_state();
        let pkce = self.pkce_enabled.then(Pkce::generate);

        let redirect_uri = server
            .start()
            .map_err(|e| AuthError::authentication("callback_server_failed", e.to_string()))?;

        let authorize_url = self.provider.authorize_url(
            &redirect_uri,
            &expected_state,
            pkce.as_ref().map(|p| p.challenge.as_str()),
        );

        self.set_state(AuthFlowState::AwaitingCallback);

        if let Some(show) = show_window {
            show(&authorize_url);
        }

        // Short wait slices so cancel() wakes us well before the timeout
        let deadline = Instant::now() + self.auth_timeout;
        let callback = loop {
            if self.cancelled.load(Ordering::SeqCst) {
                return Err(AuthError::FlowCancelled);
            }
            if Instant::now() >= deadline {
                return Err(AuthError::FlowTimeout);
            }
            if let Some(result) = server.wait_for_callback(CANCEL_POLL_INTERVAL) {
                break result;
            }
        };

        if let Some(error) = callback.error {
            let description = callback.error_description.unwrap_or_default();
            warn!("Provider returned error: {}: {}", error, description);
            return Err(AuthError::Authentication {
                code: error,
                description,
            });
        }

        // Exact match; a mismatch is terminal, never retried
        if callback.state.as_deref() != Some(expected_state.as_str()) {
            return Err(AuthError::authentication(
                "state_mismatch",
                "returned state does not match this flow attempt",
            ));
        }

        let code = callback.code.ok_or_else(|| {
            AuthError::authentication("missing_code", "callback carried no authorization code")
        })?;

        self.set_state(AuthFlowState::Exchanging);

        // Bridge to the async provider from this blocking thread
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| AuthError::authentication("runtime_failed", e.to_string()))?;

        let (tokens, user_info) = runtime.block_on(async {
            let tokens = self
                .provider
                .exchange_code(&code, &redirect_uri, pkce.as_ref().map(|p| p.verifier.as_str()))
                .await?;
            let user_info = self.provider.fetch_userinfo(&tokens.access_token).await?;
            Ok::<_, AuthError>((tokens, user_info))
        })?;

        if let Some(store) = &self.token_store {
            store.store(&user_info.subject, &tokens)?;
        }

        info!("Authorization flow completed for subject {}", user_info.subject);

        Ok(AuthResult {
            success: true,
            tokens: Some(tokens),
            user_info: Some(user_info),
            error: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OAuthTokenSet, UserInfo};
    use async_trait::async_trait;

    struct StubProvider;

    #[async_trait]
    impl OAuthProvider for StubProvider {
        fn authorize_url(
            &self,
            redirect_uri: &str,
            state: &str,
            _pkce_challenge: Option<&str>,
        ) -> String {
            format!("https://idp.example/authorize?redirect_uri={redirect_uri}&state={state}")
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
            unreachable!("not exercised here")
        }

        async fn revoke(&self, _token: &str) -> Result<(), AuthError> {
            Ok(())
        }

        async fn fetch_userinfo(&self, _access_token: &str) -> Result<UserInfo, AuthError> {
            unreachable!("not exercised here")
        }
    }

    #[test]
    fn test_run_deploy_urls() {
        let flow = AuthFlowManager::new(Arc::new(StubProvider), Duration::from_secs(1));
        assert_eq!(flow.run_deploy(None), "/auth/login");
        assert_eq!(
            flow.run_deploy(Some("https://app.example")),
            "https://app.example/auth/login"
        );
        assert_eq!(
            flow.run_deploy(Some("https://app.example/")),
            "https://app.example/auth/login"
        );
    }

    #[test]
    fn test_timeout_sets_terminal_state() {
        let flow = AuthFlowManager::new(Arc::new(StubProvider), Duration::from_millis(200));
        let err = flow.run_native(None, None).unwrap_err();
        assert!(matches!(err, AuthError::FlowTimeout));
        assert_eq!(flow.flow_state(), AuthFlowState::TimedOut);
    }

    #[test]
    fn test_cancel_wakes_blocked_flow() {
        let flow = Arc::new(AuthFlowManager::new(
            Arc::new(StubProvider),
            Duration::from_secs(30),
        ));

        let canceller = flow.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            canceller.cancel();
        });

        let started = Instant::now();
        let err = flow.run_native(None, None).unwrap_err();
        handle.join().unwrap();

        assert!(matches!(err, AuthError::FlowCancelled));
        assert_eq!(flow.flow_state(), AuthFlowState::Cancelled);
        // Woke within poll granularity, not the 30s timeout
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_close_window_runs_on_failure() {
        let closed = Arc::new(AtomicBool::new(false));
        let closed_flag = closed.clone();

        let flow = AuthFlowManager::new(Arc::new(StubProvider), Duration::from_millis(100));
        let _ = flow.run_native(
            None,
            Some(Box::new(move || closed_flag.store(true, Ordering::SeqCst))),
        );

        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_terminal_state_is_frozen() {
        let flow = AuthFlowManager::new(Arc::new(StubProvider), Duration::from_millis(100));
        let _ = flow.run_native(None, None);
        assert_eq!(flow.flow_state(), AuthFlowState::TimedOut);

        flow.set_state(AuthFlowState::Completed);
        assert_eq!(flow.flow_state(), AuthFlowState::TimedOut);
    }
}
