//! cachefleet coordinator
//!
//! Serves the agent API one level up: callers see a single node whose
//! resources are the sum of the fleet and whose instances live wherever the
//! placement policy put them.

use std::sync::Arc;

use anyhow::Result;
use cachefleet_agent_api::{agent_router, AgentApi};
use cachefleet_coordinator::{CachedFleetAggregator, Config, FleetAggregator};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting cachefleet coordinator");
    info!(
        listen_addr = %config.listen_addr,
        nodes = config.nodes.len(),
        cached = config.cached,
        refresh_interval_ms = config.refresh_interval.as_millis() as u64,
        "Configuration loaded"
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let fleet = Arc::new(FleetAggregator::from_config(&config)?);

    let cached = if config.cached {
        let cached = Arc::new(CachedFleetAggregator::new(
            Arc::clone(&fleet),
            config.refresh_interval,
        ));
        cached.start().await;
        Some(cached)
    } else {
        None
    };

    let provider: Arc<dyn AgentApi> = match &cached {
        Some(cached) => Arc::clone(cached) as Arc<dyn AgentApi>,
        None => fleet,
    };
    let app = agent_router(provider, config.api_credential.clone(), "coordinator");

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    // Spawn the server with graceful shutdown
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    // Wait for shutdown signal (Ctrl+C)
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    if let Some(cached) = cached {
        cached.stop().await;
    }

    info!("Coordinator shutdown complete");
    Ok(())
}
