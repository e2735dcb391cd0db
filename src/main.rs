//! leasehold - connector state-machine runtime
//!
//! Runs the contract negotiation, transfer process and data-flow managers
//! against leased entity stores until interrupted.

use clap::Parser;
use leasehold_connector::{ConnectorRuntime, Stores};
use leasehold_core::{Clock, SystemClock};
use leasehold_runtime::{run_metrics_server, Config, Metrics};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "leasehold", version, about = "Connector state-machine runtime")]
struct Args {
    /// Config file (YAML). Falls back to LEASEHOLD_CONFIG.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match Config::load(args.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };
    if let Err(e) = config.validate() {
        tracing::error!("Invalid configuration: {}", e);
        return Err(e.into());
    }

    tracing::info!("Starting leasehold connector");
    tracing::info!("  Instance id: {}", config.instance_id);
    tracing::info!(
        "  Batch size: {}, lease duration: {}ms",
        config.engine.batch_size,
        config.engine.lease_duration_ms
    );
    tracing::info!(
        "  Idle backoff: {}ms..{}ms, max retries: {}",
        config.engine.min_backoff_ms,
        config.engine.max_backoff_ms,
        config.engine.max_retries
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let stores = Stores::in_memory(
        &config.instance_id,
        clock.clone(),
        config.engine.lease_duration_ms as i64,
    );

    let metrics = if config.metrics.enabled {
        Some(Arc::new(Metrics::new()?))
    } else {
        tracing::info!("  Metrics: disabled");
        None
    };

    let mut builder = ConnectorRuntime::builder(config.clone())
        .clock(clock)
        .stores(stores);
    if let Some(metrics) = &metrics {
        builder = builder.metrics(metrics.clone());
    }
    let runtime = builder.build();

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let metrics_handle = metrics.map(|metrics| {
        let addr = config.metrics.bind_addr;
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, shutdown).await {
                tracing::error!("Metrics server error: {}", e);
            }
        })
    });

    runtime.start();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping connector...");

    runtime.stop().await;
    let _ = shutdown_tx.send(());
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    tracing::info!("Connector stopped");
    Ok(())
}
