use anyhow::Result;
use atrium::{config::Config, server};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.server.log_level.clone()));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("Atrium deploy server v{}", atrium::VERSION);
    info!(
        "State backend: {}, auth enabled: {}",
        config.state.backend, config.auth.enabled
    );

    server::serve(config).await
}
