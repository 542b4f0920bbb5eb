//! rdgate
//!
//! Cookie-routed remote-display relay.
//!
//! This binary:
//! - Loads configuration from `RDGATE_*` environment variables
//! - Selects the routing directory (static table or mstshash pass-through)
//! - Starts the public relay listener
//! - Serves the operator API, unless disabled

use std::sync::Arc;

use anyhow::{Context, Result};
use rdgate_directory::{EndpointResolver, MstsHashResolver, StaticResolver};
use rdgate_relay::{admin, Config, ConnectionRegistry, ListenerManager, RelayMetrics};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to RDGATE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting rdgate relay");
    info!(
        bind_addr = %config.relay.bind_addr,
        admin_bind = ?config.admin_bind,
        directory_file = ?config.directory_file,
        max_connect_attempts = config.relay.max_connect_attempts,
        "Configuration loaded"
    );

    let resolver: Arc<dyn EndpointResolver> = match &config.directory_file {
        Some(path) => {
            let table = StaticResolver::from_file(path)
                .with_context(|| format!("failed to load directory file {}", path.display()))?;
            info!(routes = table.len(), "Using static directory");
            Arc::new(table)
        }
        None => {
            info!(port = config.default_backend_port, "Using mstshash pass-through directory");
            Arc::new(MstsHashResolver::new(config.default_backend_port))
        }
    };

    let manager = Arc::new(ListenerManager::new(
        config.relay.clone(),
        resolver,
        Arc::new(ConnectionRegistry::new()),
        Arc::new(RelayMetrics::new()),
    ));

    manager
        .start()
        .await
        .context("failed to start relay listener")?;

    if let Some(admin_bind) = config.admin_bind {
        let listener = TcpListener::bind(admin_bind)
            .await
            .with_context(|| format!("failed to bind operator API on {admin_bind}"))?;
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            if let Err(e) = admin::serve(listener, manager).await {
                error!(error = %e, "Operator API failed");
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("Shutdown requested");
    manager.stop().await;
    Ok(())
}
