//! Kiln Worker
//!
//! Consumes build tasks from RabbitMQ and turns source archives into
//! packaged build artifacts.
//!
//! Architecture:
//! - Configuration: Load settings from environment (and `.env`) or defaults
//! - Services: Archive handling, external builder, task pipeline
//! - Scheduler: Queue consumption, redelivery policy and message settlement
//!
//! For each task the worker fetches `key` from the object store, extracts
//! it, runs the builder for `buildType`, packages the output and uploads it
//! as `<projectId>_<buildType>.tar.gz`, then acknowledges the message. Any
//! failure rejects the message for redelivery until the attempt ceiling
//! dead-letters it.

mod config;
mod scheduler;
mod service;
mod workspace;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use kiln_client::{AmqpConfig, AmqpQueue, ArtifactStore, ObjectStoreArtifacts};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use crate::config::Config;
use crate::scheduler::{TaskConsumer, TaskHandler};
use crate::service::{CommandBuilder, TarArchiver, TaskPipeline, WorkspaceSettings};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine; real deployments use the environment
    let dotenv = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kiln_worker=info,kiln_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Kiln Worker");
    if let Ok(path) = dotenv {
        info!("Loaded environment from {}", path.display());
    }

    // Load configuration
    let config = Config::from_env();
    config.validate().context("Invalid configuration")?;
    info!(
        "Loaded configuration: queue={}, bucket={}, work_root={}",
        config.queue,
        config.store_bucket,
        config.work_root.display()
    );

    // Initialize artifact store
    let store: Arc<dyn ArtifactStore> = Arc::new(
        ObjectStoreArtifacts::s3(&config.s3()).context("Failed to configure object store")?,
    );
    info!(
        "Object store initialized (endpoint: {})",
        config.store_endpoint.as_deref().unwrap_or("AWS S3")
    );

    // Initialize services
    let builder = CommandBuilder::new(config.builder());
    match builder.check_available().await {
        Ok(version) => info!("Builder {} available: {}", config.builder_program, version),
        Err(e) => warn!(
            "Builder check failed, builds will fail until it is installed: {}",
            e
        ),
    }

    let pipeline = TaskPipeline::new(
        store,
        Arc::new(TarArchiver::new()),
        Arc::new(builder),
        WorkspaceSettings {
            work_root: config.work_root.clone(),
            keep_run_dirs: config.keep_run_dirs,
        },
    );
    let policy = config.retry_policy();
    let consumer = TaskConsumer::new(TaskHandler::new(pipeline, policy), config.max_parallel_tasks);

    info!("Services initialized");

    // Connect to the broker (with retry logic)
    let queue = connect_with_retry(&config.amqp()).await?;
    let consumer_tag = format!("kiln-worker-{}", Uuid::new_v4());
    let source = queue
        .consume(&consumer_tag)
        .await
        .context("Failed to start consuming")?;

    info!("Worker initialized successfully");
    info!(
        "Max parallel tasks: {}, max delivery attempts: {}",
        config.max_parallel_tasks,
        if config.max_delivery_attempts == 0 {
            "unbounded".to_string()
        } else {
            policy.max_attempts().to_string()
        }
    );

    let result = consumer.run(source, shutdown_signal()).await;

    if let Err(e) = queue.close().await {
        warn!("Failed to close broker connection cleanly: {}", e);
    }

    if let Err(e) = result {
        error!("Consumer error: {}", e);
        return Err(e).context("Task consumer stopped unexpectedly");
    }

    info!("Kiln Worker stopped");
    Ok(())
}

/// Connect to the broker with retry logic and exponential backoff
///
/// This handles the case where RabbitMQ may not be ready yet when the
/// worker starts (common in container environments).
async fn connect_with_retry(config: &AmqpConfig) -> Result<AmqpQueue> {
    const MAX_RETRIES: u32 = 10;
    const INITIAL_DELAY_MS: u64 = 500;
    const MAX_DELAY_MS: u64 = 30_000;

    let mut attempt = 0;
    let mut delay_ms = INITIAL_DELAY_MS;

    loop {
        attempt += 1;

        match AmqpQueue::connect(config).await {
            Ok(queue) => return Ok(queue),
            Err(e) => {
                if attempt >= MAX_RETRIES {
                    error!(
                        "Failed to connect to RabbitMQ after {} attempts",
                        MAX_RETRIES
                    );
                    return Err(anyhow::anyhow!("Failed to connect to RabbitMQ: {}", e));
                }

                warn!(
                    "Failed to connect to RabbitMQ (attempt {}/{}): {}",
                    attempt, MAX_RETRIES, e
                );
                warn!("Retrying in {} ms...", delay_ms);

                tokio::time::sleep(Duration::from_millis(delay_ms)).await;

                // Exponential backoff with cap
                delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
            }
        }
    }
}

/// Waits for SIGINT or SIGTERM
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = ctrl_c() => {}
        _ = sigterm.recv() => info!(signal = "SIGTERM", "Signal received"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    ctrl_c().await;
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!(signal = "SIGINT", "Signal received"),
        Err(e) => {
            // Without a handler the worker runs until the source closes
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
