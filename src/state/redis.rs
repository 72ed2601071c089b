/// Redis backend: shared state across worker processes. Key TTLs handle
/// session expiry natively; everything else is last-writer-wins JSON values
/// under a configurable namespace prefix.
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use crate::error::StateResult;
use crate::rbac;
use crate::state::{ConnectionRouter, EventBus, SessionStore, WidgetStore};
use crate::types::{ConnectionInfo, EventMessage, UserSession, WidgetRecord};

/// Shared connection handle plus the key namespace.
#[derive(Clone)]
pub struct RedisShared {
    client: redis::Client,
    manager: ConnectionManager,
    prefix: String,
}

impl RedisShared {
    pub async fn connect(url: &str, prefix: &str) -> StateResult<Self> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            manager,
            prefix: prefix.to_string(),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    fn key(&self, parts: &[&str]) -> String {
        let mut key = self.prefix.clone();
        for part in parts {
            key.push(':');
            key.push_str(part);
        }
        key
    }
}

pub struct RedisWidgetStore {
    shared: RedisShared,
}

impl RedisWidgetStore {
    pub fn new(shared: RedisShared) -> Self {
        Self { shared }
    }

    fn widget_key(&self, widget_id: &str) -> String {
        self.shared.key(&["widget", widget_id])
    }

    fn index_key(&self) -> String {
        self.shared.key(&["widgets"])
    }

    async fn load(&self, widget_id: &str) -> StateResult<Option<WidgetRecord>> {
        let mut conn = self.shared.conn();
        let raw: Option<String> = conn.get(self.widget_key(widget_id)).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl WidgetStore for RedisWidgetStore {
    async fn register(
        &self,
        widget_id: &str,
        html: &str,
        token: Option<String>,
        owner_worker_id: Option<String>,
        metadata: HashMap<String, String>,
    ) -> StateResult<()> {
        let record = WidgetRecord {
            widget_id: widget_id.to_string(),
            html: html.to_string(),
            token,
            owner_worker_id,
            metadata,
            created_at: Utc::now().timestamp(),
        };
        let json = serde_json::to_string(&record)?;

        let mut conn = self.shared.conn();
        let _: () = conn.set(self.widget_key(widget_id), json).await?;
        let _: () = conn.sadd(self.index_key(), widget_id).await?;
        crate::metrics::METRICS.widgets_registered_total.inc();
        Ok(())
    }

    async fn get(&self, widget_id: &str) -> StateResult<Option<WidgetRecord>> {
        self.load(widget_id).await
    }

    async fn get_html(&self, widget_id: &str) -> StateResult<Option<String>> {
        Ok(self.load(widget_id).await?.map(|w| w.html))
    }

    async fn get_token(&self, widget_id: &str) -> StateResult<Option<String>> {
        Ok(self.load(widget_id).await?.and_then(|w| w.token))
    }

    async fn exists(&self, widget_id: &str) -> StateResult<bool> {
        let mut conn = self.shared.conn();
        Ok(conn.exists(self.widget_key(widget_id)).await?)
    }

    async fn delete(&self, widget_id: &str) -> StateResult<bool> {
        let mut conn = self.shared.conn();
        let removed: i64 = conn.del(self.widget_key(widget_id)).await?;
        let _: () = conn.srem(self.index_key(), widget_id).await?;
        Ok(removed > 0)
    }

    async fn update_html(&self, widget_id: &str, html: &str) -> StateResult<bool> {
        // Read-modify-write; concurrent writers are last-writer-wins
        let Some(mut record) = self.load(widget_id).await? else {
            return Ok(false);
        };
        record.html = html.to_string();
        let json = serde_json::to_string(&record)?;

        let mut conn = self.shared.conn();
        let _: () = conn.set(self.widget_key(widget_id), json).await?;
        Ok(true)
    }

    async fn list_active(&self) -> StateResult<Vec<String>> {
        let mut conn = self.shared.conn();
        Ok(conn.smembers(self.index_key()).await?)
    }

    async fn count(&self) -> StateResult<usize> {
        let mut conn = self.shared.conn();
        Ok(conn.scard(self.index_key()).await?)
    }
}

pub struct RedisConnectionRouter {
    shared: RedisShared,
}

impl RedisConnectionRouter {
    pub fn new(shared: RedisShared) -> Self {
        Self { shared }
    }

    fn conn_key(&self, widget_id: &str) -> String {
        self.shared.key(&["conn", widget_id])
    }

    fn worker_key(&self, worker_id: &str) -> String {
        self.shared.key(&["worker_conns", worker_id])
    }

    async fn load(&self, widget_id: &str) -> StateResult<Option<ConnectionInfo>> {
        let mut conn = self.shared.conn();
        let raw: Option<String> = conn.get(self.conn_key(widget_id)).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn store(&self, info: &ConnectionInfo) -> StateResult<()> {
        let json = serde_json::to_string(info)?;
        let mut conn = self.shared.conn();
        let _: () = conn.set(self.conn_key(&info.widget_id), json).await?;
        Ok(())
    }
}

#[async_trait]
impl ConnectionRouter for RedisConnectionRouter {
    async fn register_connection(
        &self,
        widget_id: &str,
        worker_id: &str,
        user_id: Option<String>,
        session_id: Option<String>,
    ) -> StateResult<()> {
        // Last-writer-wins; drop the previous owner's index entry first
        if let Some(previous) = self.load(widget_id).await? {
            if previous.worker_id != worker_id {
                let mut conn = self.shared.conn();
                let _: () = conn
                    .srem(self.worker_key(&previous.worker_id), widget_id)
                    .await?;
            }
        }

        let now = Utc::now().timestamp();
        let info = ConnectionInfo {
            widget_id: widget_id.to_string(),
            worker_id: worker_id.to_string(),
            user_id,
            session_id,
            connected_at: now,
            last_heartbeat: now,
        };
        self.store(&info).await?;

        let mut conn = self.shared.conn();
        let _: () = conn.sadd(self.worker_key(worker_id), widget_id).await?;
        Ok(())
    }

    async fn get_connection_info(&self, widget_id: &str) -> StateResult<Option<ConnectionInfo>> {
        self.load(widget_id).await
    }

    async fn get_owner(&self, widget_id: &str) -> StateResult<Option<String>> {
        Ok(self.load(widget_id).await?.map(|c| c.worker_id))
    }

    async fn refresh_heartbeat(&self, widget_id: &str) -> StateResult<bool> {
        let Some(mut info) = self.load(widget_id).await? else {
            return Ok(false);
        };
        info.last_heartbeat = Utc::now().timestamp().max(info.last_heartbeat + 1);
        self.store(&info).await?;
        Ok(true)
    }

    async fn unregister_connection(&self, widget_id: &str) -> StateResult<bool> {
        let Some(info) = self.load(widget_id).await? else {
            return Ok(false);
        };
        let mut conn = self.shared.conn();
        let removed: i64 = conn.del(self.conn_key(widget_id)).await?;
        let _: () = conn
            .srem(self.worker_key(&info.worker_id), widget_id)
            .await?;
        Ok(removed > 0)
    }

    async fn list_worker_connections(&self, worker_id: &str) -> StateResult<Vec<String>> {
        let mut conn = self.shared.conn();
        let members: Vec<String> = conn.smembers(self.worker_key(worker_id)).await?;

        // Prune index entries whose connection records are gone
        let mut live = Vec::with_capacity(members.len());
        for widget_id in members {
            let exists: bool = conn.exists(self.conn_key(&widget_id)).await?;
            if exists {
                live.push(widget_id);
            } else {
                let _: () = conn.srem(self.worker_key(worker_id), &widget_id).await?;
            }
        }
        Ok(live)
    }
}

pub struct RedisSessionStore {
    shared: RedisShared,
}

impl RedisSessionStore {
    pub fn new(shared: RedisShared) -> Self {
        Self { shared }
    }

    fn session_key(&self, session_id: &str) -> String {
        self.shared.key(&["session", session_id])
    }

    fn user_key(&self, user_id: &str) -> String {
        self.shared.key(&["user_sessions", user_id])
    }

    fn role_key(&self, role: &str) -> String {
        self.shared.key(&["role", role])
    }

    async fn store(&self, session: &UserSession) -> StateResult<()> {
        let json = serde_json::to_string(session)?;
        let key = self.session_key(&session.session_id);
        let mut conn = self.shared.conn();

        match session.expires_at {
            Some(expires_at) => {
                // Native key expiry does the TTL enforcement
                let ttl = (expires_at - Utc::now().timestamp()).max(1) as u64;
                let _: () = conn.set_ex(key, json, ttl).await?;
            }
            None => {
                let _: () = conn.set(key, json).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn create_session(&self, session: UserSession) -> StateResult<()> {
        self.store(&session).await?;
        let mut conn = self.shared.conn();
        let _: () = conn
            .sadd(self.user_key(&session.user_id), &session.session_id)
            .await?;
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> StateResult<Option<UserSession>> {
        let mut conn = self.shared.conn();
        let raw: Option<String> = conn.get(self.session_key(session_id)).await?;
        let Some(json) = raw else {
            return Ok(None);
        };
        let session: UserSession = serde_json::from_str(&json)?;
        // The key TTL normally evicts first; this covers clock skew
        if session.is_expired() {
            return Ok(None);
        }
        Ok(Some(session))
    }

    async fn validate_session(&self, session_id: &str) -> StateResult<bool> {
        Ok(self.get_session(session_id).await?.is_some())
    }

    async fn refresh_session(&self, session_id: &str, extend_secs: u64) -> StateResult<bool> {
        let Some(mut session) = self.get_session(session_id).await? else {
            return Ok(false);
        };
        session.expires_at = Some(Utc::now().timestamp() + extend_secs as i64);
        self.store(&session).await?;
        Ok(true)
    }

    async fn delete_session(&self, session_id: &str) -> StateResult<bool> {
        let user_id = self.get_session(session_id).await?.map(|s| s.user_id);
        let mut conn = self.shared.conn();
        let removed: i64 = conn.del(self.session_key(session_id)).await?;
        if let Some(user_id) = user_id {
            let _: () = conn.srem(self.user_key(&user_id), session_id).await?;
        }
        Ok(removed > 0)
    }

    async fn list_user_sessions(&self, user_id: &str) -> StateResult<Vec<UserSession>> {
        let mut conn = self.shared.conn();
        let ids: Vec<String> = conn.smembers(self.user_key(user_id)).await?;

        let mut sessions = Vec::with_capacity(ids.len());
        for session_id in ids {
            match self.get_session(&session_id).await? {
                Some(session) => sessions.push(session),
                None => {
                    // Evicted by TTL; drop the stale index entry
                    let _: () = conn.srem(self.user_key(user_id), &session_id).await?;
                }
            }
        }
        Ok(sessions)
    }

    async fn set_role_permissions(
        &self,
        role: &str,
        permissions: HashSet<String>,
    ) -> StateResult<()> {
        let key = self.role_key(role);
        let mut conn = self.shared.conn();
        let _: () = conn.del(&key).await?;
        if !permissions.is_empty() {
            let members: Vec<String> = permissions.into_iter().collect();
            let _: () = conn.sadd(&key, members).await?;
        }
        Ok(())
    }

    async fn get_role_permissions(&self, role: &str) -> StateResult<HashSet<String>> {
        let mut conn = self.shared.conn();
        Ok(conn.smembers(self.role_key(role)).await?)
    }

    async fn check_permission(
        &self,
        session_id: &str,
        resource_type: &str,
        _resource_id: &str,
        action: &str,
    ) -> StateResult<bool> {
        let Some(session) = self.get_session(session_id).await? else {
            return Ok(false);
        };
        if rbac::is_admin(&session) {
            return Ok(true);
        }

        let mut granted = HashSet::new();
        for role in &session.roles {
            granted.extend(self.get_role_permissions(role).await?);
        }
        Ok(rbac::any_permission_covers(
            granted.iter().map(String::as_str),
            resource_type,
            action,
        ))
    }
}

/// Pub/sub fan-out. Each subscription owns a dedicated pubsub connection
/// drained by a forwarding task; `unsubscribe` aborts the task, which drops
/// the connection.
pub struct RedisEventBus {
    shared: RedisShared,
    subscriptions: Mutex<HashMap<String, Vec<JoinHandle<()>>>>,
}

impl RedisEventBus {
    pub fn new(shared: RedisShared) -> Self {
        Self {
            shared,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    fn channel_key(&self, channel: &str) -> String {
        self.shared.key(&["events", channel])
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, channel: &str, message: EventMessage) -> StateResult<()> {
        let payload = serde_json::to_string(&message)?;
        let mut conn = self.shared.conn();
        let _: () = conn.publish(self.channel_key(channel), payload).await?;
        crate::metrics::METRICS
            .events_published_total
            .with_label_values(&[channel])
            .inc();
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> StateResult<BoxStream<'static, EventMessage>> {
        let mut pubsub = self.shared.client.get_async_pubsub().await?;
        pubsub.subscribe(self.channel_key(channel)).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let channel_name = channel.to_string();

        let handle = tokio::spawn(async move {
            let mut messages = Box::pin(pubsub.into_on_message());
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("Dropping undecodable event payload: {}", e);
                        continue;
                    }
                };
                match serde_json::from_str::<EventMessage>(&payload) {
                    Ok(event) => {
                        if tx.send(event).is_err() {
                            // Subscriber stream dropped; stop forwarding
                            break;
                        }
                    }
                    Err(e) => warn!("Dropping malformed event on {}: {}", channel_name, e),
                }
            }
            debug!("Event forwarder for {} stopped", channel_name);
        });

        self.subscriptions
            .lock()
            .unwrap()
            .entry(channel.to_string())
            .or_default()
            .push(handle);

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn unsubscribe(&self, channel: &str) -> StateResult<()> {
        if let Some(handles) = self.subscriptions.lock().unwrap().remove(channel) {
            for handle in handles {
                handle.abort();
            }
        }
        Ok(())
    }
}
