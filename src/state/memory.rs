/// In-process backend: plain maps behind a mutex, lazy expiry checks only.
/// The async signatures complete synchronously so the backend stays
/// interchangeable with Redis.
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::StateResult;
use crate::rbac;
use crate::state::{ConnectionRouter, EventBus, SessionStore, WidgetStore};
use crate::types::{ConnectionInfo, EventMessage, UserSession, WidgetRecord};

#[derive(Default)]
pub struct MemoryWidgetStore {
    widgets: Mutex<HashMap<String, WidgetRecord>>,
}

impl MemoryWidgetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WidgetStore for MemoryWidgetStore {
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
        self.widgets
            .lock()
            .unwrap()
            .insert(widget_id.to_string(), record);
        crate::metrics::METRICS.widgets_registered_total.inc();
        Ok(())
    }

    async fn get(&self, widget_id: &str) -> StateResult<Option<WidgetRecord>> {
        Ok(self.widgets.lock().unwrap().get(widget_id).cloned())
    }

    async fn get_html(&self, widget_id: &str) -> StateResult<Option<String>> {
        Ok(self
            .widgets
            .lock()
            .unwrap()
            .get(widget_id)
            .map(|w| w.html.clone()))
    }

    async fn get_token(&self, widget_id: &str) -> StateResult<Option<String>> {
        Ok(self
            .widgets
            .lock()
            .unwrap()
            .get(widget_id)
            .and_then(|w| w.token.clone()))
    }

    async fn exists(&self, widget_id: &str) -> StateResult<bool> {
        Ok(self.widgets.lock().unwrap().contains_key(widget_id))
    }

    async fn delete(&self, widget_id: &str) -> StateResult<bool> {
        Ok(self.widgets.lock().unwrap().remove(widget_id).is_some())
    }

    async fn update_html(&self, widget_id: &str, html: &str) -> StateResult<bool> {
        let mut widgets = self.widgets.lock().unwrap();
        match widgets.get_mut(widget_id) {
            Some(record) => {
                record.html = html.to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_active(&self) -> StateResult<Vec<String>> {
        Ok(self.widgets.lock().unwrap().keys().cloned().collect())
    }

    async fn count(&self) -> StateResult<usize> {
        Ok(self.widgets.lock().unwrap().len())
    }
}

#[derive(Default)]
pub struct MemoryConnectionRouter {
    connections: Mutex<HashMap<String, ConnectionInfo>>,
}

impl MemoryConnectionRouter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConnectionRouter for MemoryConnectionRouter {
    async fn register_connection(
        &self,
        widget_id: &str,
        worker_id: &str,
        user_id: Option<String>,
        session_id: Option<String>,
    ) -> StateResult<()> {
        let now = Utc::now().timestamp();
        let info = ConnectionInfo {
            widget_id: widget_id.to_string(),
            worker_id: worker_id.to_string(),
            user_id,
            session_id,
            connected_at: now,
            last_heartbeat: now,
        };
        // Last-writer-wins: a re-registration replaces the previous owner
        self.connections
            .lock()
            .unwrap()
            .insert(widget_id.to_string(), info);
        Ok(())
    }

    async fn get_connection_info(&self, widget_id: &str) -> StateResult<Option<ConnectionInfo>> {
        Ok(self.connections.lock().unwrap().get(widget_id).cloned())
    }

    async fn get_owner(&self, widget_id: &str) -> StateResult<Option<String>> {
        Ok(self
            .connections
            .lock()
            .unwrap()
            .get(widget_id)
            .map(|c| c.worker_id.clone()))
    }

    async fn refresh_heartbeat(&self, widget_id: &str) -> StateResult<bool> {
        let mut connections = self.connections.lock().unwrap();
        match connections.get_mut(widget_id) {
            Some(info) => {
                // Strictly increasing even within one clock second
                info.last_heartbeat = Utc::now().timestamp().max(info.last_heartbeat + 1);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn unregister_connection(&self, widget_id: &str) -> StateResult<bool> {
        Ok(self
            .connections
            .lock()
            .unwrap()
            .remove(widget_id)
            .is_some())
    }

    async fn list_worker_connections(&self, worker_id: &str) -> StateResult<Vec<String>> {
        Ok(self
            .connections
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.worker_id == worker_id)
            .map(|c| c.widget_id.clone())
            .collect())
    }
}

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, UserSession>>,
    role_permissions: Mutex<HashMap<String, HashSet<String>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_session(&self, session: UserSession) -> StateResult<()> {
        self.sessions
            .lock()
            .unwrap()
            .insert(session.session_id.clone(), session);
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> StateResult<Option<UserSession>> {
        // Lazy expiry: reads evict
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get(session_id) {
            Some(s) if s.is_expired() => {
                sessions.remove(session_id);
                Ok(None)
            }
            Some(s) => Ok(Some(s.clone())),
            None => Ok(None),
        }
    }

    async fn validate_session(&self, session_id: &str) -> StateResult<bool> {
        Ok(self.get_session(session_id).await?.is_some())
    }

    async fn refresh_session(&self, session_id: &str, extend_secs: u64) -> StateResult<bool> {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get_mut(session_id) {
            Some(s) if !s.is_expired() => {
                s.expires_at = Some(Utc::now().timestamp() + extend_secs as i64);
                Ok(true)
            }
            Some(_) => {
                sessions.remove(session_id);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn delete_session(&self, session_id: &str) -> StateResult<bool> {
        Ok(self.sessions.lock().unwrap().remove(session_id).is_some())
    }

    async fn list_user_sessions(&self, user_id: &str) -> StateResult<Vec<UserSession>> {
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.user_id == user_id && !s.is_expired())
            .cloned()
            .collect())
    }

    async fn set_role_permissions(
        &self,
        role: &str,
        permissions: HashSet<String>,
    ) -> StateResult<()> {
        self.role_permissions
            .lock()
            .unwrap()
            .insert(role.to_string(), permissions);
        Ok(())
    }

    async fn get_role_permissions(&self, role: &str) -> StateResult<HashSet<String>> {
        Ok(self
            .role_permissions
            .lock()
            .unwrap()
            .get(role)
            .cloned()
            .unwrap_or_default())
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

        let role_permissions = self.role_permissions.lock().unwrap();
        let granted = session
            .roles
            .iter()
            .filter_map(|role| role_permissions.get(role))
            .flatten()
            .map(String::as_str);
        Ok(rbac::any_permission_covers(granted, resource_type, action))
    }
}

/// Fan-out over per-channel unbounded senders. Publish never waits on a
/// subscriber; a slow consumer only grows its own queue.
#[derive(Default)]
pub struct MemoryEventBus {
    channels: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<EventMessage>>>>,
}

impl MemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, channel: &str, message: EventMessage) -> StateResult<()> {
        let mut channels = self.channels.lock().unwrap();
        if let Some(senders) = channels.get_mut(channel) {
            senders.retain(|tx| tx.send(message.clone()).is_ok());
        }
        crate::metrics::METRICS
            .events_published_total
            .with_label_values(&[channel])
            .inc();
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> StateResult<BoxStream<'static, EventMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels
            .lock()
            .unwrap()
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn unsubscribe(&self, channel: &str) -> StateResult<()> {
        // Dropping the senders ends every subscriber stream for the channel
        self.channels.lock().unwrap().remove(channel);
        Ok(())
    }
}
