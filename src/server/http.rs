use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::pending::{PendingAuthState, PendingAuthStore};
use crate::auth::provider::{generate_nonce, generate_state, OAuthProvider, Pkce};
use crate::auth::token_store::TokenStore;
use crate::config::Config;
use crate::metrics::METRICS;
use crate::rate_limit::RateLimiter;
use crate::rbac;
use crate::state::{SessionStore, StateBackend, WidgetStore};
use crate::types::{UserInfo, UserSession};

/// Generic description for internal failures; upstream error text never
/// reaches the client.
const INTERNAL_ERROR_DESCRIPTION: &str = "An internal error occurred";

/// HTTP server state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub provider: Arc<dyn OAuthProvider>,
    pub backend: StateBackend,
    pub pending: Arc<PendingAuthStore>,
    pub rate_limiter: RateLimiter,
    pub token_store: Arc<dyn TokenStore>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        provider: Arc<dyn OAuthProvider>,
        backend: StateBackend,
        token_store: Arc<dyn TokenStore>,
    ) -> Self {
        let pending = Arc::new(PendingAuthStore::new(Duration::from_secs(
            config.auth.pending_state_max_age,
        )));
        let rate_limiter = RateLimiter::new(
            config.rate_limiting.login_attempts,
            Duration::from_secs(config.rate_limiting.window_secs),
        );
        Self {
            config,
            provider,
            backend,
            pending,
            rate_limiter,
            token_store,
        }
    }
}

/// Build the deploy-mode router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/auth/login", get(login_handler))
        .route("/auth/callback", get(callback_handler))
        .route("/auth/status", get(status_handler))
        .route("/auth/userinfo", get(userinfo_handler))
        .route("/auth/refresh", post(refresh_handler))
        .route("/auth/logout", post(logout_handler))
        .route("/widgets/:widget_id", get(widget_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// GET /health
async fn health_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(expected) = &state.config.server.internal_api_token {
        let presented = headers
            .get("x-internal-token")
            .and_then(|v| v.to_str().ok());
        if presented != Some(expected.as_str()) {
            return json_error(StatusCode::UNAUTHORIZED, "unauthorized", None);
        }
    }

    Json(json!({
        "status": "healthy",
        "version": crate::VERSION,
        "worker_id": state.config.server.worker_id,
        "backend": state.config.state.backend,
    }))
    .into_response()
}

/// GET /metrics (Prometheus format)
async fn metrics_handler() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = METRICS.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return String::new();
    }

    String::from_utf8(buffer).unwrap_or_default()
}

/// GET /auth/login - start a deploy-mode authorization flow
async fn login_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !state.config.auth.enabled {
        return json_error(StatusCode::NOT_FOUND, "auth_disabled", None);
    }

    if state.config.rate_limiting.enabled
        && !state.rate_limiter.check_rate_limit(&client_key(&headers))
    {
        METRICS.login_rate_limited_total.inc();
        return json_error(StatusCode::TOO_MANY_REQUESTS, "rate_limited", None);
    }

    METRICS.login_attempts_total.inc();

    let oauth_state = generate_state();
    let pkce = state.config.auth.pkce.then(Pkce::generate);
    let redirect_uri = format!("{}/auth/callback", serving_base(&state.config, &headers));

    state.pending.insert(
        oauth_state.clone(),
        PendingAuthState {
            pkce_verifier: pkce.as_ref().map(|p| p.verifier.clone()),
            redirect_uri: redirect_uri.clone(),
            nonce: generate_nonce(),
            created_at: Utc::now().timestamp(),
        },
    );

    let authorize_url = state.provider.authorize_url(
        &redirect_uri,
        &oauth_state,
        pkce.as_ref().map(|p| p.challenge.as_str()),
    );

    redirect_found(&authorize_url, None)
}

/// GET /auth/callback - finish a deploy-mode authorization flow
async fn callback_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    // The pending entry is consumed up front: a state value is accepted at
    // most once, whatever happens afterwards
    let pending = params
        .get("state")
        .and_then(|s| state.pending.take(s));
    let Some(pending) = pending else {
        METRICS
            .callback_failures_total
            .with_label_values(&["invalid_state"])
            .inc();
        return json_error(StatusCode::BAD_REQUEST, "invalid_state", None);
    };

    if let Some(provider_error) = params.get("error") {
        METRICS
            .callback_failures_total
            .with_label_values(&["provider_error"])
            .inc();
        warn!(
            "Provider returned error at callback: {}: {}",
            provider_error,
            params.get("error_description").map(String::as_str).unwrap_or("")
        );
        return json_error(StatusCode::BAD_REQUEST, provider_error, None);
    }

    let Some(code) = params.get("code") else {
        METRICS
            .callback_failures_total
            .with_label_values(&["missing_code"])
            .inc();
        return json_error(StatusCode::BAD_REQUEST, "missing_code", None);
    };

    let tokens = match state
        .provider
        .exchange_code(code, &pending.redirect_uri, pending.pkce_verifier.as_deref())
        .await
    {
        Ok(tokens) => tokens,
        Err(e) => {
            // Full detail stays in the log; the client gets a fixed string
            error!("Token exchange failed: {}", e);
            METRICS
                .callback_failures_total
                .with_label_values(&["token_exchange_failed"])
                .inc();
            return json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "token_exchange_failed",
                Some(INTERNAL_ERROR_DESCRIPTION),
            );
        }
    };

    let user_info = match state.provider.fetch_userinfo(&tokens.access_token).await {
        Ok(info) => info,
        Err(e) => {
            error!("Userinfo fetch failed: {}", e);
            METRICS
                .callback_failures_total
                .with_label_values(&["userinfo_failed"])
                .inc();
            return json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "token_exchange_failed",
                Some(INTERNAL_ERROR_DESCRIPTION),
            );
        }
    };

    let session = build_session(&state.config, &user_info);
    if let Err(e) = state.backend.sessions.create_session(session.clone()).await {
        error!("Session creation failed: {}", e);
        return json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            Some(INTERNAL_ERROR_DESCRIPTION),
        );
    }

    if let Err(e) = state.token_store.store(&user_info.subject, &tokens) {
        warn!("Failed to persist provider tokens: {}", e);
    }

    METRICS.sessions_created_total.inc();
    info!(
        "Session {} created for user {}",
        session.session_id, session.user_id
    );

    let token = rbac::generate_session_token(
        &session.session_id,
        &state.config.auth.token_secret,
        state.config.auth.session_ttl,
    );
    let cookie = format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        state.config.auth.session_cookie_name, token, state.config.auth.session_ttl
    );

    redirect_found("/", Some(cookie))
}

/// GET /auth/status
async fn status_handler(State(state): State<AppState>, headers: HeaderMap) -> Json<Value> {
    match session_from_request(&state, &headers).await {
        Some(session) => Json(json!({
            "authenticated": true,
            "user_id": session.user_id,
            "roles": session.roles,
            "expires_at": session.expires_at,
        })),
        None => Json(json!({ "authenticated": false })),
    }
}

/// GET /auth/userinfo
async fn userinfo_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match session_from_request(&state, &headers).await {
        Some(session) => Json(json!({
            "user_id": session.user_id,
            "roles": session.roles,
            "email": session.metadata.get("email"),
            "name": session.metadata.get("name"),
            "created_at": session.created_at,
        }))
        .into_response(),
        None => json_error(StatusCode::UNAUTHORIZED, "unauthorized", None),
    }
}

/// POST /auth/refresh - extend the current session
async fn refresh_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    // CSRF gate runs before any session logic
    if !origin_matches(&state.config, &headers) {
        return json_error(StatusCode::FORBIDDEN, "csrf_failed", None);
    }

    let Some(session) = session_from_request(&state, &headers).await else {
        return json_error(StatusCode::UNAUTHORIZED, "unauthorized", None);
    };

    let ttl = state.config.auth.session_ttl;
    match state
        .backend
        .sessions
        .refresh_session(&session.session_id, ttl)
        .await
    {
        Ok(true) => {
            let token = rbac::generate_session_token(
                &session.session_id,
                &state.config.auth.token_secret,
                ttl,
            );
            let cookie = format!(
                "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
                state.config.auth.session_cookie_name, token, ttl
            );
            let mut response = Json(json!({
                "success": true,
                "expires_at": Utc::now().timestamp() + ttl as i64,
            }))
            .into_response();
            if let Ok(value) = cookie.parse() {
                response.headers_mut().insert(header::SET_COOKIE, value);
            }
            response
        }
        Ok(false) => json_error(StatusCode::UNAUTHORIZED, "unauthorized", None),
        Err(e) => {
            error!("Session refresh failed: {}", e);
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                Some(INTERNAL_ERROR_DESCRIPTION),
            )
        }
    }
}

/// POST /auth/logout - always succeeds locally, even with no session
async fn logout_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !origin_matches(&state.config, &headers) {
        return json_error(StatusCode::FORBIDDEN, "csrf_failed", None);
    }

    if let Some(session) = session_from_request(&state, &headers).await {
        if let Err(e) = state
            .backend
            .sessions
            .delete_session(&session.session_id)
            .await
        {
            warn!("Session deletion failed during logout: {}", e);
        }
        info!("Session {} logged out", session.session_id);
    }

    let cookie = format!(
        "{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0",
        state.config.auth.session_cookie_name
    );
    let mut response = Json(json!({ "success": true })).into_response();
    if let Ok(value) = cookie.parse() {
        response.headers_mut().insert(header::SET_COOKIE, value);
    }
    response
}

/// GET /widgets/:widget_id - serve stored widget HTML behind its capability
/// token (or an authorized session).
async fn widget_handler(
    State(state): State<AppState>,
    Path(widget_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let widget = match state.backend.widgets.get(&widget_id).await {
        Ok(Some(widget)) => widget,
        Ok(None) => return json_error(StatusCode::NOT_FOUND, "not_found", None),
        Err(e) => {
            error!("Widget lookup failed: {}", e);
            return json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                Some(INTERNAL_ERROR_DESCRIPTION),
            );
        }
    };

    if state.config.auth.enabled && state.config.auth.require_auth_for_widgets {
        let presented = params.get("token").map(String::as_str);

        let token_ok = match presented {
            Some(token) => {
                widget.token.as_deref() == Some(token)
                    || rbac::validate_widget_token(token, &state.config.auth.token_secret)
                        .as_deref()
                        == Some(widget_id.as_str())
            }
            None => false,
        };

        if !token_ok {
            let session_ok = match session_from_request(&state, &headers).await {
                Some(session) => state
                    .backend
                    .sessions
                    .check_permission(&session.session_id, "widget", &widget_id, "view")
                    .await
                    .unwrap_or(false),
                None => false,
            };
            if !session_ok {
                return json_error(StatusCode::FORBIDDEN, "forbidden", None);
            }
        }
    }

    Html(widget.html).into_response()
}

fn build_session(config: &Config, user_info: &UserInfo) -> UserSession {
    let is_admin = user_info
        .email
        .as_deref()
        .map(|email| config.auth.admin_users.iter().any(|a| a == email))
        .unwrap_or(false);

    let roles = if is_admin {
        vec![rbac::ADMIN_ROLE.to_string()]
    } else {
        config.auth.default_roles.clone()
    };

    let mut metadata = HashMap::new();
    if let Some(email) = &user_info.email {
        metadata.insert("email".to_string(), email.clone());
    }
    if let Some(name) = &user_info.name {
        metadata.insert("name".to_string(), name.clone());
    }

    let now = Utc::now().timestamp();
    UserSession {
        session_id: Uuid::new_v4().to_string(),
        user_id: user_info.subject.clone(),
        roles,
        metadata,
        created_at: now,
        expires_at: Some(now + config.auth.session_ttl as i64),
    }
}

/// Extract and validate the session cookie (or bearer header).
pub async fn session_from_request(state: &AppState, headers: &HeaderMap) -> Option<UserSession> {
    let token = session_token_from_headers(
        headers,
        &state.config.auth.session_cookie_name,
    )?;
    let session_id = rbac::validate_session_token(&token, &state.config.auth.token_secret)?;
    state
        .backend
        .sessions
        .get_session(&session_id)
        .await
        .ok()
        .flatten()
}

fn session_token_from_headers(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    if let Some(cookies) = headers.get(header::COOKIE).and_then(|v| v.to_str().ok()) {
        for part in cookies.split(';') {
            if let Some((name, value)) = part.trim().split_once('=') {
                if name == cookie_name {
                    return Some(value.to_string());
                }
            }
        }
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(String::from)
}

/// Rate-limit key for a client. Deploy mode sits behind the toolkit's front
/// proxy, so the forwarded address is the stable identity.
fn client_key(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "local".to_string())
}

/// Base URL this request was served under, for building the redirect URI.
fn serving_base(config: &Config, headers: &HeaderMap) -> String {
    if let Some(base) = &config.server.base_url {
        return base.trim_end_matches('/').to_string();
    }
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("http://{}", host)
}

/// Mutating auth routes require an `Origin` matching the serving host.
fn origin_matches(config: &Config, headers: &HeaderMap) -> bool {
    let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let Ok(origin_url) = url::Url::parse(origin) else {
        return false;
    };

    let origin_authority = match origin_url.port() {
        Some(port) => format!("{}:{}", origin_url.host_str().unwrap_or(""), port),
        None => origin_url.host_str().unwrap_or("").to_string(),
    };

    // Compare against the configured public URL when present, else the Host
    // header of this very request
    let expected_authority = match &config.server.base_url {
        Some(base) => match url::Url::parse(base) {
            Ok(base_url) => match base_url.port() {
                Some(port) => format!("{}:{}", base_url.host_str().unwrap_or(""), port),
                None => base_url.host_str().unwrap_or("").to_string(),
            },
            Err(_) => return false,
        },
        None => match headers.get(header::HOST).and_then(|v| v.to_str().ok()) {
            Some(host) => host.to_string(),
            None => return false,
        },
    };

    !origin_authority.is_empty() && origin_authority == expected_authority
}

fn json_error(status: StatusCode, code: &str, description: Option<&str>) -> Response {
    let body = match description {
        Some(description) => json!({ "error": code, "error_description": description }),
        None => json!({ "error": code }),
    };
    (status, Json(body)).into_response()
}

fn redirect_found(location: &str, cookie: Option<String>) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, location);
    if let Some(cookie) = cookie {
        builder = builder.header(header::SET_COOKIE, cookie);
    }
    builder
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
