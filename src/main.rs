//! Courier record delivery service.
//!
//! Claims unprocessed rows from one PostgreSQL table, posts each row's
//! business columns to the configured endpoint, and records the outcome in
//! the same transaction. Runs until interrupted; a shutdown signal drains
//! in-flight deliveries and commits what finished.

mod config;

use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use courier_core::{storage::PostgresStore, Clock, RealClock};
use courier_delivery::{Coordinator, DeliveryError};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;

/// Delivers rows of a PostgreSQL table to an HTTP endpoint.
#[derive(Debug, Parser)]
#[command(name = "courier", version, about)]
struct Cli {
    /// Table to deliver. Must have `id`, `is_processed` and `retry` columns.
    table: String,

    /// Configuration file, `courier.toml` in the working directory if omitted.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("courier: {e:#}");
            return ExitCode::FAILURE;
        },
    };

    init_tracing(&config.rust_log);

    match run(cli, config).await {
        Ok(()) => {
            info!("Courier shutdown complete");
            ExitCode::SUCCESS
        },
        Err(e) => match Stop::of(&e) {
            Stop::Interrupted => {
                info!(reason = %e, "Courier interrupted before delivery started");
                ExitCode::SUCCESS
            },
            Stop::Fatal => {
                error!(error = %format!("{e:#}"), "Courier stopped on a fatal error");
                ExitCode::FAILURE
            },
            Stop::Startup => {
                warn!(error = %format!("{e:#}"), "Courier could not start");
                ExitCode::FAILURE
            },
        },
    }
}

/// How a failed run ended, which decides the log level and exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    /// Shutdown was requested before the run got going.
    Interrupted,
    /// Delivery failed in a way that makes the outcome of a cycle unknown.
    Fatal,
    /// Setup failed before any row was claimed.
    Startup,
}

impl Stop {
    fn of(error: &anyhow::Error) -> Self {
        match error.downcast_ref::<DeliveryError>() {
            Some(DeliveryError::ShutdownRequested) => Self::Interrupted,
            Some(e) if e.is_fatal() => Self::Fatal,
            _ => Self::Startup,
        }
    }
}

async fn run(cli: Cli, config: Config) -> Result<()> {
    info!(
        table = %cli.table,
        database_url = %config.database_url_masked(),
        endpoint = %config.endpoint_url,
        "Starting courier"
    );

    let pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    let store = match PostgresStore::connect(pool, &cli.table).await {
        Ok(store) => store,
        Err(e) if e.is_startup_fatal() => {
            anyhow::bail!("table {} cannot be delivered: {e}", cli.table);
        },
        Err(e) => return Err(e).context("Failed to inspect table"),
    };
    info!(table = store.table(), "Table validated");

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            info!("Shutdown signal received, draining in-flight deliveries");
            shutdown.cancel();
        }
    });

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let coordinator =
        Coordinator::start(Box::new(store), config.to_delivery_config(), clock, shutdown)?;
    let summary = coordinator.run().await?;

    info!(
        cycles = summary.cycles,
        committed_cycles = summary.committed_cycles,
        delivered = summary.delivered,
        retried = summary.retried,
        skipped = summary.skipped,
        "Delivery stopped"
    );
    Ok(())
}

/// Initializes tracing. `RUST_LOG` reaches here through the configuration.
fn init_tracing(directives: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_new(directives).unwrap_or_else(|e| {
        eprintln!("courier: invalid log filter {directives:?}: {e}, falling back to info");
        EnvFilter::new("info")
    });

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .execute(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(e) if retries < config.database_connect_retries => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = config.database_connect_retries,
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
            error!(error = %e, "Failed to install Ctrl+C handler");
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_delivery_errors_stop_as_fatal() {
        let error = anyhow::Error::new(DeliveryError::store("commit failed"));
        assert_eq!(Stop::of(&error), Stop::Fatal);

        let error = anyhow::Error::new(DeliveryError::worker_fatal("mark failed"));
        assert_eq!(Stop::of(&error), Stop::Fatal);
    }

    #[test]
    fn setup_errors_stop_as_startup() {
        let error = anyhow::Error::new(DeliveryError::configuration("worker_count must be positive"));
        assert_eq!(Stop::of(&error), Stop::Startup);

        let error = anyhow::anyhow!("table users cannot be delivered: missing column retry");
        assert_eq!(Stop::of(&error), Stop::Startup);
    }

    #[test]
    fn shutdown_request_is_not_a_failure() {
        let error = anyhow::Error::new(DeliveryError::ShutdownRequested);
        assert_eq!(Stop::of(&error), Stop::Interrupted);
    }
}
