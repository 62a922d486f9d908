//! mailpipe entry point.

mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use mailpipe_common::{Config, LoggingConfig, Metrics, MetricsEmitter, StoreBackend};
use mailpipe_queue::{FailedQueueOperator, RetryConfig, RetryScheduler, connect_bus};
use serde_json::json;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Command};

/// Waits for a shutdown signal (SIGINT or SIGTERM).
///
/// On Unix systems, this listens for both SIGINT (Ctrl+C) and SIGTERM.
/// On Windows, this only listens for Ctrl+C.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT, initiating graceful shutdown...");
        },
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}

fn init_tracing(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(config.json.then(|| fmt::layer().json()))
        .with((!config.json).then(fmt::layer))
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Config::load().context("Failed to load configuration"),
    }
}

async fn build_scheduler(config: &Config) -> anyhow::Result<RetryScheduler> {
    let store = mailpipe_db::connect_store(config)
        .await
        .context("Failed to connect to document store")?;
    let bus = connect_bus(&config.broker)
        .await
        .context("Failed to connect to message bus")?;
    let emitter = MetricsEmitter::from_config(Arc::new(Metrics::new()), &config.metrics)
        .context("Failed to set up metrics sink")?;

    Ok(RetryScheduler::new(
        store,
        bus,
        emitter,
        config.retry.clone(),
        config.scheduler.clone(),
        RetryConfig::from_broker(&config.broker),
    ))
}

async fn operator(config: &Config) -> anyhow::Result<FailedQueueOperator> {
    let bus = connect_bus(&config.broker)
        .await
        .context("Failed to connect to message bus")?;
    Ok(FailedQueueOperator::new(bus))
}

async fn serve(config: &Config) -> anyhow::Result<()> {
    let scheduler = build_scheduler(config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = tokio::spawn(async move { scheduler.run_forever(shutdown_rx).await });

    shutdown_signal().await;
    if shutdown_tx.send(true).is_err() {
        warn!("Scheduler already stopped");
    }
    worker.await.context("Scheduler task failed")?;

    info!("Shutdown complete");
    Ok(())
}

async fn migrate(config: &Config) -> anyhow::Result<()> {
    if config.database.backend == StoreBackend::Memory {
        warn!("In-memory document store has no schema, nothing to migrate");
        return Ok(());
    }

    let db = mailpipe_db::init(&config.database)
        .await
        .context("Failed to connect to database")?;
    info!("Running database migrations...");
    mailpipe_db::migrate(&db).await.context("Migration failed")?;
    info!("Migrations completed");
    Ok(())
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_tracing(&config.logging);

    match &cli.command {
        Command::Serve => {
            info!("Starting mailpipe retry scheduler...");
            serve(&config).await
        }
        Command::RunOnce => {
            let report = build_scheduler(&config).await?.run_once().await;
            print_json(&serde_json::to_value(&report)?)
        }
        Command::Inspect { queue, limit } => {
            let entries = operator(&config).await?.inspect(queue, *limit).await?;
            print_json(&serde_json::to_value(&entries)?)
        }
        Command::Requeue { queue, limit } => {
            let moved = operator(&config).await?.requeue(queue, *limit).await?;
            print_json(&json!({ "queue": queue, "requeued": moved }))
        }
        Command::Purge { queue } => {
            let purged = operator(&config).await?.purge(queue).await?;
            print_json(&json!({ "queue": queue, "purged": purged }))
        }
        Command::Migrate => migrate(&config).await,
    }
}
