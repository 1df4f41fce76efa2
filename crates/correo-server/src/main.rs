//! Correo - Mail server entry point

use anyhow::Result;
use correo_common::config::Config;
use correo_core::{Courier, PolicyCache, QueueManager};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting correo mail server...");

    // Load configuration
    let config = Config::load()?;

    // Initialize the MTA-STS policy cache and its background refresher
    let sts_cache = Arc::new(PolicyCache::new(config.server.data_dir.join("sts-cache"))?);
    info!(
        dir = %config.server.data_dir.join("sts-cache").display(),
        "MTA-STS policy cache initialized"
    );

    let refresh_handle = {
        let sts_cache = sts_cache.clone();
        tokio::spawn(async move {
            sts_cache.periodically_refresh().await;
        })
    };

    // Initialize the outbound courier and queue worker
    let courier = Arc::new(
        Courier::new(config.server.hostname.clone(), sts_cache.clone())
            .with_smtp_port(config.delivery.smtp_port),
    );

    let spool_dir = config
        .delivery
        .spool_dir
        .clone()
        .unwrap_or_else(|| config.server.data_dir.join("queue"));
    let queue_manager = Arc::new(QueueManager::new(spool_dir, courier, &config.delivery)?);

    let queue_handle = {
        let queue_manager = queue_manager.clone();
        tokio::spawn(async move {
            queue_manager.run().await;
        })
    };

    info!("correo server started successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Cleanup
    refresh_handle.abort();
    queue_handle.abort();

    for (name, value) in sts_cache.metrics().as_pairs() {
        info!(counter = name, value, "final counter");
    }

    info!("correo server shutdown complete");

    Ok(())
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,correo=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_level(true))
        .with(filter)
        .init();
}
