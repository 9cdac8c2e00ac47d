//! gantry master
//!
//! Tracks the agent fleet, schedules task requests onto slots, drives
//! allocations through their lifecycle, and aggregates task logs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use gantry_master::{
    agent::{AgentRpc, HttpAgentRpc, MockAgentRpc},
    api, config,
    db::Store,
    registry::Registry,
    Master,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Per-call timeout for commands sent to agents.
const AGENT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to GANTRY_LOG_LEVEL.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting gantry master");
    info!(listen_addr = %config.listen_addr, dev_mode = config.dev_mode, "Configuration loaded");

    let pools = config.load_pools()?;
    info!(pools = ?pools.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(), "Pools loaded");

    let store = match Store::open(&config.db_path) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, path = %config.db_path.display(), "Failed to open store");
            return Err(e.into());
        }
    };

    let registry = Arc::new(Registry::new());
    let rpc: Arc<dyn AgentRpc> = if config.dev_mode {
        info!("Using in-process agent RPC (dev mode)");
        Arc::new(MockAgentRpc::new())
    } else {
        Arc::new(HttpAgentRpc::new(registry.clone(), AGENT_RPC_TIMEOUT)?)
    };

    let master = Master::new(store, registry, rpc, pools, config.settings.clone())?;
    // Restored records must be in place before handshakes or passes.
    master.prepare_reattach()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handles = master.spawn_background(&shutdown_rx);

    let app = api::create_router(master.clone());
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
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
        }
    });

    // Agents reconnect over HTTP, so waiting for them starts once we listen.
    let reattach_handle = tokio::spawn({
        let master = master.clone();
        async move {
            if let Err(e) = master.reattach().await {
                error!(error = %e, "Reattachment failed");
            }
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);
    reattach_handle.abort();

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = Duration::from_secs(10);
    for handle in worker_handles {
        if tokio::time::timeout(shutdown_timeout, handle).await.is_err() {
            warn!("Worker did not shut down in time");
        }
    }

    info!("gantry master shutdown complete");
    Ok(())
}
