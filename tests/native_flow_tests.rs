//! End-to-end native authorization flow against an in-process mock provider.
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;

use atrium::auth::token_store::{MemoryTokenStore, TokenStore};
use atrium::auth::{AuthFlowManager, OAuthProvider};
use atrium::error::AuthError;
use atrium::types::{AuthFlowState, OAuthTokenSet, UserInfo};

struct MockProvider {
    /// (redirect_uri, state) captured when the flow builds its authorize URL
    captured: Mutex<Option<(String, String)>>,
    exchanged_code: Mutex<Option<String>>,
}

impl MockProvider {
    fn new() -> Self {
        Self {
            captured: Mutex::new(None),
            exchanged_code: Mutex::new(None),
        }
    }

    fn wait_for_authorize(&self, timeout: Duration) -> (String, String) {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(captured) = self.captured.lock().unwrap().clone() {
                return captured;
            }
            assert!(Instant::now() < deadline, "flow never built an authorize URL");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn mock_tokens() -> OAuthTokenSet {
        OAuthTokenSet {
            access_token: "mock-access".to_string(),
            token_type: "Bearer".to_string(),
            refresh_token: Some("mock-refresh".to_string()),
            expires_in: Some(3600),
            issued_at: Utc::now().timestamp(),
            id_token: None,
            scope: Some("openid".to_string()),
        }
    }
}

#[async_trait]
impl OAuthProvider for MockProvider {
    fn authorize_url(
        &self,
        redirect_uri: &str,
        state: &str,
        _pkce_challenge: Option<&str>,
    ) -> String {
        *self.captured.lock().unwrap() = Some((redirect_uri.to_string(), state.to_string()));
        format!("https://idp.example/authorize?state={state}")
    }

    async fn exchange_code(
        &self,
        code: &str,
        _redirect_uri: &str,
        _pkce_verifier: Option<&str>,
    ) -> Result<OAuthTokenSet, AuthError> {
        *self.exchanged_code.lock().unwrap() = Some(code.to_string());
        Ok(Self::mock_tokens())
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<OAuthTokenSet, AuthError> {
        Ok(Self::mock_tokens())
    }

    async fn revoke(&self, _token: &str) -> Result<(), AuthError> {
        Ok(())
    }

    async fn fetch_userinfo(&self, _access_token: &str) -> Result<UserInfo, AuthError> {
        Ok(UserInfo {
            subject: "user-1".to_string(),
            email: Some("user@example.com".to_string()),
            name: Some("Test User".to_string()),
            picture: None,
        })
    }
}

/// Deliver a request to the flow's loopback callback server and return the
/// raw response.
fn deliver_callback(redirect_uri: &str, query: &str) -> String {
    let authority = redirect_uri
        .trim_start_matches("http://")
        .trim_end_matches("/callback");
    // The server may already be stopping when a late duplicate arrives
    let Ok(mut stream) = TcpStream::connect(authority) else {
        return String::new();
    };
    write!(
        stream,
        "GET /callback?{} HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n",
        query
    )
    .unwrap();

    let mut response = String::new();
    let mut reader = BufReader::new(stream);
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => response.push_str(&line),
        }
    }
    response
}

#[test]
fn test_native_flow_end_to_end() {
    let provider = Arc::new(MockProvider::new());
    let store: Arc<dyn TokenStore> = Arc::new(MemoryTokenStore::new());

    let flow = Arc::new(
        AuthFlowManager::new(provider.clone(), Duration::from_secs(10))
            .with_token_store(store.clone()),
    );

    let runner = flow.clone();
    let handle = std::thread::spawn(move || runner.run_native(None, None));

    let (redirect_uri, state) = provider.wait_for_authorize(Duration::from_secs(5));
    deliver_callback(&redirect_uri, &format!("code=code-123&state={state}"));

    let result = handle.join().unwrap().expect("flow should succeed");

    assert!(result.success);
    assert_eq!(flow.flow_state(), AuthFlowState::Completed);

    // Exchanged exactly what the provider mock returned
    let tokens = result.tokens.unwrap();
    assert_eq!(tokens.access_token, "mock-access");
    assert_eq!(tokens.refresh_token.as_deref(), Some("mock-refresh"));
    let user = result.user_info.unwrap();
    assert_eq!(user.subject, "user-1");
    assert_eq!(provider.exchanged_code.lock().unwrap().as_deref(), Some("code-123"));

    // Tokens persisted under the user's subject
    let persisted = store.load("user-1").unwrap().unwrap();
    assert_eq!(persisted.access_token, "mock-access");
}

#[test]
fn test_native_flow_state_mismatch_fails() {
    let provider = Arc::new(MockProvider::new());
    let flow = Arc::new(AuthFlowManager::new(
        provider.clone(),
        Duration::from_secs(10),
    ));

    let runner = flow.clone();
    let handle = std::thread::spawn(move || runner.run_native(None, None));

    let (redirect_uri, _state) = provider.wait_for_authorize(Duration::from_secs(5));
    deliver_callback(&redirect_uri, "code=code-123&state=not-the-right-state");

    let err = handle.join().unwrap().unwrap_err();
    match err {
        AuthError::Authentication { code, .. } => assert_eq!(code, "state_mismatch"),
        other => panic!("expected state mismatch, got {other}"),
    }
    assert_eq!(flow.flow_state(), AuthFlowState::Failed);
}

#[test]
fn test_native_flow_provider_error_fails() {
    let provider = Arc::new(MockProvider::new());
    let flow = Arc::new(AuthFlowManager::new(
        provider.clone(),
        Duration::from_secs(10),
    ));

    let runner = flow.clone();
    let handle = std::thread::spawn(move || runner.run_native(None, None));

    let (redirect_uri, state) = provider.wait_for_authorize(Duration::from_secs(5));
    deliver_callback(
        &redirect_uri,
        &format!("error=access_denied&error_description=User%20declined&state={state}"),
    );

    let err = handle.join().unwrap().unwrap_err();
    match err {
        AuthError::Authentication { code, description } => {
            assert_eq!(code, "access_denied");
            assert_eq!(description, "User declined");
        }
        other => panic!("expected provider error, got {other}"),
    }
    assert_eq!(flow.flow_state(), AuthFlowState::Failed);
}

#[test]
fn test_callback_page_escapes_error_description() {
    let provider = Arc::new(MockProvider::new());
    let flow = Arc::new(AuthFlowManager::new(
        provider.clone(),
        Duration::from_secs(10),
    ));

    let runner = flow.clone();
    let handle = std::thread::spawn(move || runner.run_native(None, None));

    let (redirect_uri, state) = provider.wait_for_authorize(Duration::from_secs(5));
    let payload = urlencoding::encode("<script>alert('pwned')</script>").into_owned();
    let response = deliver_callback(
        &redirect_uri,
        &format!("error=access_denied&error_description={payload}&state={state}"),
    );

    let _ = handle.join().unwrap();

    assert!(!response.contains("<script>alert"));
    assert!(response.contains("&lt;script&gt;"));
    assert!(response.contains("Content-Security-Policy: default-src 'none'"));
}

#[test]
fn test_second_callback_is_ignored() {
    let provider = Arc::new(MockProvider::new());
    let flow = Arc::new(AuthFlowManager::new(
        provider.clone(),
        Duration::from_secs(10),
    ));

    let runner = flow.clone();
    let handle = std::thread::spawn(move || runner.run_native(None, None));

    let (redirect_uri, state) = provider.wait_for_authorize(Duration::from_secs(5));
    deliver_callback(&redirect_uri, &format!("code=winner&state={state}"));
    // Exchange may already be in flight; the second hit must not disturb it
    deliver_callback(&redirect_uri, &format!("code=loser&state={state}"));

    let result = handle.join().unwrap().expect("flow should succeed");
    assert!(result.success);
    assert_eq!(provider.exchanged_code.lock().unwrap().as_deref(), Some("winner"));
}
