//! worker-cache: runs one worker with an in-process master.
//!
//! Starts the block cache, its heartbeat and lease-sweep tasks, and a
//! read-only HTTP status API. Ctrl-C stops the tasks after a final heartbeat.

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use worker_cache::config::{Cli, Config};
use worker_cache::master::registry::MasterRegistry;
use worker_cache::server::status_api::{build_router, AppState};
use worker_cache::storage::local::LocalUnderStorage;
use worker_cache::worker::Worker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "worker_cache=debug,tower_http=debug"
    } else {
        "worker_cache=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("worker-cache v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }
    config.validate()?;
    let config = Arc::new(config);

    info!(
        worker_id = config.worker.worker_id,
        capacity_bytes = config.worker.capacity_bytes,
        heartbeat_ms = config.heartbeat.interval_ms,
        lease_timeout_ms = config.lease.timeout_ms,
        under_storage = %config.under_storage.path.display(),
        "Configuration loaded"
    );

    let under_storage = Arc::new(LocalUnderStorage::new(config.under_storage.path.clone()).await?);
    let worker = Arc::new(Worker::new(config.clone(), under_storage)?);
    let registry = Arc::new(MasterRegistry::new());

    // Background tasks.
    let shutdown = CancellationToken::new();
    let heartbeat = worker
        .heartbeat_synchronizer(registry.clone())
        .spawn(shutdown.clone());
    let reaper = worker.spawn_lease_reaper(shutdown.clone());

    let state = Arc::new(AppState {
        worker: worker.clone(),
        registry: Some(registry),
        start_time: Instant::now(),
    });
    let app = build_router(state);

    let listen_addr = config.server.listen.clone();
    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl-C");
            }
            info!("Shutting down");
            server_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    for result in futures::future::join_all([heartbeat, reaper]).await {
        if let Err(e) = result {
            error!(error = %e, "Background task failed");
        }
    }

    info!("Stopped");
    Ok(())
}
