/// OAuth2 provider contract and the config-driven HTTP implementation.
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::config::OAuthProviderConfig;
use crate::error::AuthError;
use crate::types::{OAuthTokenSet, UserInfo};

/// PKCE verifier/challenge pair (RFC 7636, S256).
#[derive(Debug, Clone)]
pub struct Pkce {
    pub verifier: String,
    pub challenge: String,
}

impl Pkce {
    pub fn generate() -> Self {
        let verifier = random_urlsafe(32); // 32 bytes = 43 chars base64
        let challenge = Self::challenge_for(&verifier);
        Self { verifier, challenge }
    }

    fn challenge_for(verifier: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(verifier.as_bytes());
        URL_SAFE_NO_PAD.encode(hasher.finalize())
    }
}

/// Generate a random opaque `state` value for CSRF protection.
pub fn generate_state() -> String {
    random_urlsafe(32)
}

/// Generate a random nonce for the pending-state entry.
pub fn generate_nonce() -> String {
    random_urlsafe(16)
}

fn random_urlsafe(bytes: usize) -> String {
    use rand::RngCore;
    let mut rng = rand::thread_rng();
    let mut buf = vec![0u8; bytes];
    rng.fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

/// Protocol-specific half of the authorization flow.
///
/// The flow manager and HTTP routes only talk to this trait; per-provider
/// quirks (parameter names, userinfo shapes) stay behind it.
#[async_trait]
pub trait OAuthProvider: Send + Sync {
    /// Build the authorize URL the user's browser is sent to.
    fn authorize_url(&self, redirect_uri: &str, state: &str, pkce_challenge: Option<&str>)
        -> String;

    /// Exchange an authorization code for tokens.
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        pkce_verifier: Option<&str>,
    ) -> Result<OAuthTokenSet, AuthError>;

    /// Obtain a fresh token set from a refresh token.
    async fn refresh(&self, refresh_token: &str) -> Result<OAuthTokenSet, AuthError>;

    /// Revoke a token with the provider. Providers without a revocation
    /// endpoint may treat this as a no-op.
    async fn revoke(&self, token: &str) -> Result<(), AuthError>;

    /// Fetch the authenticated user's identity.
    async fn fetch_userinfo(&self, access_token: &str) -> Result<UserInfo, AuthError>;
}

/// Wire shape of a standard token endpoint response.
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

impl TokenResponse {
    fn into_token_set(self) -> OAuthTokenSet {
        OAuthTokenSet {
            access_token: self.access_token,
            token_type: self.token_type.unwrap_or_else(|| "Bearer".to_string()),
            refresh_token: self.refresh_token,
            expires_in: self.expires_in,
            issued_at: Utc::now().timestamp(),
            id_token: self.id_token,
            scope: self.scope,
        }
    }
}

#[derive(Deserialize)]
struct UserInfoResponse {
    #[serde(alias = "id", alias = "user_id")]
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    picture: Option<String>,
}

/// Standard OAuth2 provider driven entirely by configured endpoint URLs.
pub struct HttpOAuthProvider {
    config: OAuthProviderConfig,
    client: reqwest::Client,
}

impl HttpOAuthProvider {
    pub fn new(config: OAuthProviderConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    async fn token_request(
        &self,
        params: Vec<(&str, String)>,
        failure: &str,
    ) -> Result<OAuthTokenSet, AuthError> {
        let res = self
            .client
            .post(&self.config.token_url)
            .form(&params)
            .header("Accept", "application/json")
            .send()
            .await?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(AuthError::authentication(
                failure,
                format!("provider returned {}: {}", status, body),
            ));
        }

        let token_response: TokenResponse = res.json().await?;
        Ok(token_response.into_token_set())
    }
}

#[async_trait]
impl OAuthProvider for HttpOAuthProvider {
    fn authorize_url(
        &self,
        redirect_uri: &str,
        state: &str,
        pkce_challenge: Option<&str>,
    ) -> String {
        let mut url = format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}",
            self.config.authorize_url,
            urlencoding::encode(&self.config.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&self.config.scopes),
            urlencoding::encode(state),
        );

        if let Some(challenge) = pkce_challenge {
            url.push_str(&format!(
                "&code_challenge={}&code_challenge_method=S256",
                urlencoding::encode(challenge)
            ));
        }

        url
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        pkce_verifier: Option<&str>,
    ) -> Result<OAuthTokenSet, AuthError> {
        let mut params = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", redirect_uri.to_string()),
            ("client_id", self.config.client_id.clone()),
        ];
        if let Some(secret) = &self.config.client_secret {
            params.push(("client_secret", secret.clone()));
        }
        if let Some(verifier) = pkce_verifier {
            params.push(("code_verifier", verifier.to_string()));
        }

        self.token_request(params, "token_exchange_failed").await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<OAuthTokenSet, AuthError> {
        let mut params = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
            ("client_id", self.config.client_id.clone()),
        ];
        if let Some(secret) = &self.config.client_secret {
            params.push(("client_secret", secret.clone()));
        }

        match self.token_request(params, "refresh_failed").await {
            Ok(tokens) => Ok(tokens),
            Err(AuthError::Authentication { description, .. }) => {
                Err(AuthError::TokenRefresh(description))
            }
            Err(e) => Err(e),
        }
    }

    async fn revoke(&self, token: &str) -> Result<(), AuthError> {
        let Some(revoke_url) = &self.config.revoke_url else {
            return Ok(());
        };

        let mut params = vec![
            ("token", token.to_string()),
            ("client_id", self.config.client_id.clone()),
        ];
        if let Some(secret) = &self.config.client_secret {
            params.push(("client_secret", secret.clone()));
        }

        let res = self
            .client
            .post(revoke_url)
            .form(&params)
            .send()
            .await?;

        if !res.status().is_success() {
            return Err(AuthError::authentication(
                "revoke_failed",
                format!("provider returned {}", res.status()),
            ));
        }

        Ok(())
    }

    async fn fetch_userinfo(&self, access_token: &str) -> Result<UserInfo, AuthError> {
        let Some(userinfo_url) = &self.config.userinfo_url else {
            return Err(AuthError::authentication(
                "userinfo_unavailable",
                "no userinfo endpoint configured",
            ));
        };

        let res = self
            .client
            .get(userinfo_url)
            .header("Authorization", format!("Bearer {}", access_token))
            .header("Accept", "application/json")
            .send()
            .await?;

        if !res.status().is_success() {
            return Err(AuthError::authentication(
                "userinfo_failed",
                format!("provider returned {}", res.status()),
            ));
        }

        let info: UserInfoResponse = res.json().await?;
        Ok(UserInfo {
            subject: info.sub,
            email: info.email,
            name: info.name,
            picture: info.picture,
        })
    }
}
