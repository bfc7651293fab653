//! Oracle node
//!
//! Loads configuration, builds the price aggregator and runs it until
//! SIGINT/SIGTERM.

mod settings;

use anyhow::Context;
use std::sync::Arc;

use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use oracle_core::{LogFormat, StoreKind};
use oracle_price_feed::{FilePriceStore, MemoryPriceStore, PriceAggregator, PriceStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    let config = settings::load().context("Failed to load configuration")?;
    init_logging(config.log_format);

    info!("Starting oracle node v{}", env!("CARGO_PKG_VERSION"));

    let store: Arc<dyn PriceStore> = match config.store.kind {
        StoreKind::Memory => Arc::new(MemoryPriceStore::new()),
        StoreKind::File => {
            let path = config
                .store
                .path
                .clone()
                .context("store.path is required for a file store")?;
            Arc::new(
                FilePriceStore::open(&path)
                    .await
                    .with_context(|| format!("Failed to open price store at {}", path.display()))?,
            )
        }
    };

    let engine = PriceAggregator::builder(config).store(store).build()?;
    engine.start().await?;
    info!(
        "Tracking {} assets: {}",
        engine.asset_ids().len(),
        engine.asset_ids().join(", ")
    );
    info!("Press Ctrl+C to shutdown");

    shutdown_signal().await;

    engine.stop().await?;
    let metrics = engine.get_metrics();
    info!(
        "Shutdown complete: {} commits, {} failed, {} dropped deliveries",
        metrics.total_updates, metrics.failed_updates, metrics.dropped_deliveries
    );
    Ok(())
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        }
        _ = terminate => {
            info!("Received termination signal");
        }
    }
}
