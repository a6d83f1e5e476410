use anyhow::{Context, Result};
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod headers;
mod metrics;
mod registry;
mod server;
mod tunnel;

use config::RelayConfig;
use server::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("skyconnect_relay=info")),
        )
        .init();

    let config = RelayConfig::from_env()?;
    let addr = config.listen;
    info!(
        "SkyConnect relay on {} (domain: {}, request timeout: {:?})",
        addr,
        config.domain.as_deref().unwrap_or("<host header>"),
        config.request_timeout
    );

    let app = server::app(AppState::new(config));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}
