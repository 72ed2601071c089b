pub mod http;

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::auth::provider::HttpOAuthProvider;
use crate::auth::token_store::{MemoryTokenStore, TokenStore};
use crate::config::Config;
use crate::state::{EventBus, StateBackend};

pub use http::{build_router, AppState};

/// Start the deploy-mode HTTP server for this worker.
pub async fn serve(config: Config) -> Result<()> {
    let config = Arc::new(config);

    let backend = StateBackend::from_config(&config.state)
        .await
        .context("Failed to initialize state backend")?;
    let provider = Arc::new(HttpOAuthProvider::new(config.oauth.clone()));
    let token_store: Arc<dyn TokenStore> = Arc::new(MemoryTokenStore::new());

    let state = AppState::new(config.clone(), provider, backend.clone(), token_store);

    spawn_event_relay(&backend, &config.server.worker_id).await;

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    info!(
        "Deploy server listening on {} (worker {}, backend {})",
        config.server.bind, config.server.worker_id, config.state.backend
    );

    axum::serve(listener, app).await?;

    Ok(())
}

/// Subscribe to this worker's event channel and dispatch inbound messages
/// for widgets it owns. Other workers publish here when a callback for one
/// of our widgets lands on them.
async fn spawn_event_relay(backend: &StateBackend, worker_id: &str) {
    let channel = format!("worker:{}", worker_id);
    match backend.events.subscribe(&channel).await {
        Ok(mut stream) => {
            let worker = worker_id.to_string();
            tokio::spawn(async move {
                while let Some(event) = stream.next().await {
                    debug!(
                        "Worker {} received {} for widget {} from {}",
                        worker, event.event_type, event.widget_id, event.source_worker_id
                    );
                }
                debug!("Event relay for worker {} ended", worker);
            });
        }
        Err(e) => warn!("Event relay unavailable: {}", e),
    }
}
