//! # Overwatch - GSLB health consensus node
//!
//! Ingests agent gossip, validates backends independently, and keeps one
//! authoritative health verdict per backend for DNS serving.
//!
//! ## Architecture
//! ```text
//! Agents → UDP gossip → Overwatch → Registry → DNS answers
//!                           ↓
//!                   Store (memory | Redis)
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use gslb_common::StatusChange;
use overwatch::config::{AppConfig, CliOverrides};
use overwatch::gossip::{GossipHandler, GossipReceiver};
use overwatch::routes;
use overwatch::state::AppState;

const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// GSLB Overwatch - backend health consensus
#[derive(Parser, Debug)]
#[command(name = "overwatch")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/overwatch.toml")]
    config: String,

    /// Redis URL (overrides config)
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Admin listen address (overrides config)
    #[arg(short, long, env = "LISTEN_ADDR")]
    listen: Option<String>,

    /// Gossip UDP bind address (overrides config)
    #[arg(long, env = "GOSSIP_BIND")]
    gossip_bind: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

impl Args {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            listen: self.listen.clone(),
            gossip_bind: self.gossip_bind.clone(),
            redis_url: self.redis_url.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    let _ = dotenvy::dotenv();

    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level, args.json_logs)?;

    info!("Starting GSLB Overwatch v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::load(&args.config, &args.overrides())?;
    info!(node_id = %config.node_id, "Configuration loaded from {}", args.config);
    let gossip_key = config.gossip.key()?;

    // Create shutdown broadcast channel
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Initialize application state (store, registry, auth, validator)
    let state = AppState::new(config.clone()).await?;
    info!(
        store = state.store.kind(),
        backends = state.registry.backend_count().await,
        "State loaded"
    );

    // Status change observer
    tokio::spawn(log_status_changes(
        state.registry.subscribe(),
        shutdown_tx.subscribe(),
    ));

    // Stale sweeper
    tokio::spawn(state.registry.clone().run_sweeper(shutdown_tx.subscribe()));

    // External validation
    let validator_task = state.validator.clone().start(shutdown_tx.subscribe());

    // Gossip ingestion: receiver → bounded queue → sequential handler
    let (queue_tx, queue_rx) = mpsc::channel(config.gossip.queue_capacity);
    let receiver = GossipReceiver::bind(
        &config.gossip.bind_addr,
        gossip_key,
        queue_tx,
        state.gossip_stats.clone(),
    )
    .await?;
    tokio::spawn(receiver.run(shutdown_tx.subscribe()));

    let handler = GossipHandler::new(
        state.registry.clone(),
        state.auth.clone(),
        config.gossip.require_agent_auth,
        state.gossip_stats.clone(),
    );
    tokio::spawn(handler.run(queue_rx, shutdown_tx.subscribe()));

    // Build router
    let app = routes::create_router(state.clone());

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .context("Failed to bind admin listener")?;
    info!("Overwatch listening on {}", config.listen_addr);

    // Handle graceful shutdown
    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
        }
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error")?;

    if let Some(task) = validator_task {
        let _ = task.await;
    }

    // Drain queued store writes, but never wait on a hung store for long
    let flushed = tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, async {
        state.registry.flush().await;
        state.auth.flush().await;
    })
    .await;
    if flushed.is_err() {
        warn!("Timed out flushing store writes");
    }
    if let Err(e) = state.store.close().await {
        warn!(error = %e, "Failed to close store");
    }

    info!("Overwatch shutdown complete");
    Ok(())
}

/// Log every effective-status transition
async fn log_status_changes(
    mut changes: broadcast::Receiver<StatusChange>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            change = changes.recv() => {
                match change {
                    Ok(change) => {
                        info!(
                            backend = %change.backend.key(),
                            agent_id = %change.backend.agent_id,
                            old = change.old.map(|s| s.as_str()).unwrap_or("none"),
                            new = change.new.map(|s| s.as_str()).unwrap_or("removed"),
                            "Backend status changed"
                        );
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Status change observer lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }

    Ok(())
}
