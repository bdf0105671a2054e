mod config;
mod platform;
mod relay;
mod server;
mod session;
mod store;
#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::platform::bridge::BridgeConnector;
use crate::platform::telegram::TelegramLauncher;
use crate::session::UserRegistry;
use crate::store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,chatrelay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Bridge: {} {:?}", config.bridge.command, config.bridge.args);
    info!("  Sessions: {}", config.bridge.session_dir.display());
    info!("  Database: {}", config.store.database_path.display());
    info!("  Telegram bots: {}", config.telegram.bots.len());

    let store = Store::open(&config.store.database_path)?;

    let registry = UserRegistry::new(
        Arc::new(BridgeConnector::new(config.bridge.clone())),
        Arc::new(TelegramLauncher::new(store.clone())),
        store,
        config.pacing.clone(),
        config.session.clone(),
        config.telegram.bots.clone(),
    );

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    info!("Listening on {}", config.server.bind);

    axum::serve(listener, server::router(registry.clone()))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
        })
        .await
        .context("HTTP server failed")?;

    registry.shutdown_all().await;
    info!("All sessions closed");

    Ok(())
}
