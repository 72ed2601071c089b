/// Shared-state abstraction behind deploy mode: four stores, each with a
/// Memory and a Redis implementation satisfying the same contract.
///
/// Calling code never branches on the backend; the factory picks one from
/// configuration at process start.
pub mod memory;
pub mod redis;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::config::StateConfig;
use crate::error::{StateError, StateResult};
use crate::types::{ConnectionInfo, EventMessage, UserSession, WidgetRecord};

/// Widget registry: content, capability token, and owning worker.
#[async_trait]
pub trait WidgetStore: Send + Sync {
    async fn register(
        &self,
        widget_id: &str,
        html: &str,
        token: Option<String>,
        owner_worker_id: Option<String>,
        metadata: HashMap<String, String>,
    ) -> StateResult<()>;
    async fn get(&self, widget_id: &str) -> StateResult<Option<WidgetRecord>>;
    async fn get_html(&self, widget_id: &str) -> StateResult<Option<String>>;
    async fn get_token(&self, widget_id: &str) -> StateResult<Option<String>>;
    async fn exists(&self, widget_id: &str) -> StateResult<bool>;
    /// `false` when the widget is absent; absence is a normal outcome.
    async fn delete(&self, widget_id: &str) -> StateResult<bool>;
    /// `false` when the widget is absent.
    async fn update_html(&self, widget_id: &str, html: &str) -> StateResult<bool>;
    async fn list_active(&self) -> StateResult<Vec<String>>;
    async fn count(&self) -> StateResult<usize>;
}

/// Connection-ownership routing: which worker holds the live connection for
/// a widget. At most one owner record per widget; re-registration is
/// last-writer-wins.
#[async_trait]
pub trait ConnectionRouter: Send + Sync {
    async fn register_connection(
        &self,
        widget_id: &str,
        worker_id: &str,
        user_id: Option<String>,
        session_id: Option<String>,
    ) -> StateResult<()>;
    async fn get_connection_info(&self, widget_id: &str) -> StateResult<Option<ConnectionInfo>>;
    async fn get_owner(&self, widget_id: &str) -> StateResult<Option<String>>;
    /// Extends liveness; `last_heartbeat` strictly increases. `false` when
    /// no connection is registered.
    async fn refresh_heartbeat(&self, widget_id: &str) -> StateResult<bool>;
    async fn unregister_connection(&self, widget_id: &str) -> StateResult<bool>;
    async fn list_worker_connections(&self, worker_id: &str) -> StateResult<Vec<String>>;
}

/// Server-side sessions plus the role→permission mapping they resolve
/// against.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, session: UserSession) -> StateResult<()>;
    async fn get_session(&self, session_id: &str) -> StateResult<Option<UserSession>>;
    /// Existence and not-expired in one call.
    async fn validate_session(&self, session_id: &str) -> StateResult<bool>;
    /// Extends `expires_at` by `extend_secs` from now; `false` when absent.
    async fn refresh_session(&self, session_id: &str, extend_secs: u64) -> StateResult<bool>;
    async fn delete_session(&self, session_id: &str) -> StateResult<bool>;
    async fn list_user_sessions(&self, user_id: &str) -> StateResult<Vec<UserSession>>;
    async fn set_role_permissions(
        &self,
        role: &str,
        permissions: HashSet<String>,
    ) -> StateResult<()>;
    async fn get_role_permissions(&self, role: &str) -> StateResult<HashSet<String>>;
    /// Resolves the session's roles through the role→permission mapping.
    async fn check_permission(
        &self,
        session_id: &str,
        resource_type: &str,
        resource_id: &str,
        action: &str,
    ) -> StateResult<bool>;
}

/// Cross-worker event fan-out. Messages are transient, never persisted.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Must not block on subscriber slowness.
    async fn publish(&self, channel: &str, message: EventMessage) -> StateResult<()>;
    /// Long-lived stream; consume it in a dedicated task until cancelled.
    async fn subscribe(&self, channel: &str) -> StateResult<BoxStream<'static, EventMessage>>;
    /// Idempotent; releases the underlying subscription resource.
    async fn unsubscribe(&self, channel: &str) -> StateResult<()>;
}

/// The four stores a worker needs, wired to the same backend.
#[derive(Clone)]
pub struct StateBackend {
    pub widgets: Arc<dyn WidgetStore>,
    pub connections: Arc<dyn ConnectionRouter>,
    pub sessions: Arc<dyn SessionStore>,
    pub events: Arc<dyn EventBus>,
}

impl StateBackend {
    /// Select and construct a backend from configuration.
    pub async fn from_config(config: &StateConfig) -> StateResult<Self> {
        match config.backend.as_str() {
            "memory" => Ok(Self::memory()),
            "redis" => Self::redis(&config.redis_url, &config.key_prefix).await,
            other => Err(StateError::UnknownBackend(other.to_string())),
        }
    }

    /// Single-process in-memory backend, the zero-dependency default.
    pub fn memory() -> Self {
        Self {
            widgets: Arc::new(memory::MemoryWidgetStore::new()),
            connections: Arc::new(memory::MemoryConnectionRouter::new()),
            sessions: Arc::new(memory::MemorySessionStore::new()),
            events: Arc::new(memory::MemoryEventBus::new()),
        }
    }

    /// Shared Redis backend for multi-worker deploys.
    pub async fn redis(url: &str, key_prefix: &str) -> StateResult<Self> {
        let shared = redis::RedisShared::connect(url, key_prefix).await?;
        Ok(Self {
            widgets: Arc::new(redis::RedisWidgetStore::new(shared.clone())),
            connections: Arc::new(redis::RedisConnectionRouter::new(shared.clone())),
            sessions: Arc::new(redis::RedisSessionStore::new(shared.clone())),
            events: Arc::new(redis::RedisEventBus::new(shared)),
        })
    }
}
