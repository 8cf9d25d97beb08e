use std::sync::Arc;

use anyhow::{Context, Result};
use taskhub_durable::persistence::TaskHubStore;
use taskhub_durable::{PostgresTaskHubStore, TaskHubConfig, TaskHubWorker};
use taskhub_worker::register_samples;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    // Configure via RUST_LOG, or LOG_LEVEL for this crate and the library
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        EnvFilter::new(format!(
            "taskhub_worker={level},taskhub_durable={level}",
            level = log_level
        ))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("taskhub-worker starting...");

    let config = TaskHubConfig::from_env();
    let database_url = config
        .database_url
        .clone()
        .context("DATABASE_URL must be set")?;

    let max_connections = (config.orchestration_concurrency + config.activity_concurrency + 2) as u32;
    let store = PostgresTaskHubStore::connect(&database_url, max_connections)
        .await
        .context("Failed to connect to database")?;
    store
        .initialize()
        .await
        .context("Failed to run task hub migrations")?;

    tracing::info!(
        worker_id = %config.worker_id,
        orchestration_concurrency = config.orchestration_concurrency,
        activity_concurrency = config.activity_concurrency,
        "Starting task hub worker"
    );

    let mut worker = TaskHubWorker::new(Arc::new(store), config);
    register_samples(&mut worker);
    worker.start().context("Failed to start worker")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    worker
        .shutdown()
        .await
        .context("Worker did not shut down cleanly")?;

    tracing::info!("Worker shutdown complete");
    Ok(())
}
