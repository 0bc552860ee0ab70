//! Outbox relay daemon.
//!
//! Main entry point: loads configuration, establishes the database pool,
//! installs the schema, and runs the relay engine until a shutdown signal
//! arrives. Exits zero on graceful shutdown and non-zero on fatal
//! bootstrap errors.

mod config;
mod publisher;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use outbox_core::{
    storage::{schema, Storage},
    HealthService, RealClock,
};
use outbox_relay::{ChangeListener, RelayEngine};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{config::Config, publisher::WebhookPublisher};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("starting outbox relay daemon");

    let config = Config::load()?;
    info!(
        database_url = %config.database_url_masked(),
        publisher_url = %config.publisher_url,
        worker_count = config.worker_count,
        batch_size = config.outbox_batch_size,
        on_limit_exceeded = %config.on_limit_exceeded,
        max_backlog_size = config.max_backlog_size,
        "configuration loaded"
    );

    let pool = create_database_pool(&config).await?;
    info!("database connection pool established");

    schema::install(&pool).await.context("failed to install outbox schema")?;
    info!("outbox schema verified");

    let storage = Storage::new(pool.clone());
    let relay_publisher = Arc::new(
        WebhookPublisher::new(
            &config.publisher_url,
            Duration::from_secs(config.publisher_timeout_seconds),
        )
        .context("failed to build webhook publisher")?,
    );

    let mut engine = RelayEngine::new(
        storage.clone(),
        config.to_relay_config(),
        relay_publisher,
        Arc::new(RealClock::new()),
    )
    .context("invalid relay configuration")?;

    if config.listen_enabled {
        match ChangeListener::connect(&pool, engine.wake_handle(), engine.cancellation_token())
            .await
        {
            Ok(listener) => {
                tokio::spawn(listener.run());
            },
            Err(e) => {
                warn!(error = %e, "change listener unavailable, relying on polling");
            },
        }
    }

    let health_handle = spawn_health_reporter(&config, storage, engine.cancellation_token());

    engine.start().await.context("failed to start relay engine")?;
    info!("outbox relay is running");

    shutdown_signal().await;
    info!("shutdown signal received, starting graceful shutdown");

    if let Err(e) = engine.shutdown().await {
        // In-flight events are lease-protected; the reaper recovers them.
        warn!(error = %e, "graceful shutdown incomplete");
    }
    if let Some(handle) = health_handle {
        let _ = handle.await;
    }

    pool.close().await;
    info!("outbox relay shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,outboxd=debug"))
        .expect("invalid RUST_LOG environment variable");

    let fmt_layer = fmt::layer().with_target(true).with_file(true).with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with a bounded retry budget.
///
/// An unreachable database after the budget is a fatal bootstrap error and
/// exits the process non-zero.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    let mut retries = 0;
    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("failed to verify database connection")?;
                return Ok(pool);
            },
            Err(_) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}

/// Spawns the periodic health summary reporter, if enabled.
fn spawn_health_reporter(
    config: &Config,
    storage: Storage,
    cancellation_token: CancellationToken,
) -> Option<tokio::task::JoinHandle<()>> {
    if config.health_interval_seconds == 0 {
        return None;
    }

    let interval = Duration::from_secs(config.health_interval_seconds);
    let service = HealthService::new(storage, config.to_health_thresholds());

    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancellation_token.cancelled() => break,
                () = tokio::time::sleep(interval) => {
                    let report = service.check().await;
                    match &report.gauges {
                        Some(gauges) => info!(
                            status = ?report.status,
                            pending = gauges.pending,
                            processing = gauges.processing,
                            dead_letter = gauges.dead_letter,
                            oldest_pending_age_seconds = gauges.oldest_pending_age_seconds,
                            backlog_utilization_percent = gauges.backlog_utilization_percent,
                            "outbox health"
                        ),
                        None => error!(status = ?report.status, "outbox health check failed"),
                    }
                },
            }
        }
    }))
}

/// Waits for CTRL+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received CTRL+C signal"),
        _ = terminate => info!("received SIGTERM signal"),
    }
}
