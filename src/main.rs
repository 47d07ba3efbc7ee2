//! Courier email delivery service.
//!
//! Main entry point. Wires the delivery log, the send queue and the SMTP
//! transport together, then supervises ingestion and retry sweeps until a
//! shutdown signal arrives.

mod config;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_core::{storage::Storage, Clock, RealClock};
use courier_delivery::{
    ingestor::PostgresMessageSource,
    storage::PostgresDeliveryLogStore,
    transport::SmtpTransport,
    DeliveryEngine, DeliveryRuntime, MessageIngestor, RetrySweeper,
};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config)?;

    info!("Starting courier email delivery service");
    info!(
        database_url = %config.database_url_masked(),
        queue = %config.queue_name,
        smtp_host = %config.smtp_host,
        smtp_port = config.smtp_port,
        max_attempts = config.max_attempts,
        sweep_period_seconds = config.sweep_period_seconds,
        "Configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    let storage = Arc::new(Storage::new(db_pool.clone()));
    if config.database_bootstrap_schema {
        storage.bootstrap_schema().await.context("Failed to bootstrap database schema")?;
        info!("Database schema ready");
    }

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let transport = SmtpTransport::new(config.to_smtp_config())?;
    let store = PostgresDeliveryLogStore::new(storage.clone());
    let engine = Arc::new(DeliveryEngine::new(
        Arc::new(store),
        Arc::new(transport),
        config.to_delivery_config(),
        clock.clone(),
    )?);

    let ingest_config = config.to_ingest_config();
    let source = PostgresMessageSource::new(storage.clone(), &ingest_config);
    let ingestor = MessageIngestor::new(engine.clone(), Arc::new(source), ingest_config, clock.clone());
    let sweeper = RetrySweeper::new(engine.clone(), clock);

    let runtime = DeliveryRuntime::start(engine.clone(), ingestor, sweeper);
    info!(queue = %config.queue_name, "Courier is ready to deliver email");

    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");

    if let Err(e) = runtime.shutdown().await {
        error!(error = %e, "Delivery runtime did not shut down cleanly");
    }

    let stats = engine.stats().await;
    info!(
        submitted = stats.submitted,
        attempts = stats.attempts,
        sent = stats.sent,
        failed = stats.failed,
        cancelled = stats.cancelled,
        interrupted = stats.interrupted,
        "Delivery totals for this run"
    );

    db_pool.close().await;
    info!("Database connections closed");

    info!("Courier shutdown complete");
    Ok(())
}

/// Initializes tracing from `RUST_LOG` or the configured filter.
fn init_tracing(config: &Config) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.rust_log))
        .context("Invalid log filter")?;

    let registry = tracing_subscriber::registry().with(filter);

    if config.log_format == "json" {
        registry
            .with(fmt::layer().json().with_current_span(true).with_span_list(false))
            .try_init()
            .context("Failed to install tracing subscriber")?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()
            .context("Failed to install tracing subscriber")?;
    }

    Ok(())
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    let mut retries = 0;
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "Database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        () = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
