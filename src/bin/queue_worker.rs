//! Standalone consumer for the external request queue.
//!
//! Use this instead of the server's embedded consumer when the API runs
//! with more than one replica; only one consumer may run at a time.

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rust_leads_api::config::Config;
use rust_leads_api::credentials::FileCredentialProvider;
use rust_leads_api::db::Database;
use rust_leads_api::pg_store::PgStore;
use rust_leads_api::services::ViperClient;
use rust_leads_api::store::Store;
use rust_leads_api::worker::{run_cleanup_loop, QueueWorker};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Parser)]
#[command(name = "queue-worker", about = "Processes queued enrichment requests")]
struct Args {
    /// Process a single item and exit.
    #[arg(long)]
    once: bool,

    /// Idle sleep in seconds when the queue is empty.
    #[arg(long, default_value_t = 5, env = "QUEUE_POLL_INTERVAL_SECS")]
    interval: u64,

    /// Delete old finished items and exit.
    #[arg(long)]
    cleanup: bool,

    /// Run cleanup once per hour while looping.
    #[arg(long)]
    auto_cleanup: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rust_leads_api=debug,queue_worker=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;
    let db = Database::new(&config.database_url).await?;
    let store: Arc<dyn Store> = Arc::new(PgStore::new(db.pool.clone()));

    let viper = Arc::new(ViperClient::from_config(&config)?);
    let credentials = Arc::new(FileCredentialProvider::new(
        &config.viper_tokens_path,
        config.viper_refresh_command.clone(),
        Duration::from_secs(config.viper_refresh_timeout_secs),
    ));
    let worker = QueueWorker::new(store, viper.clone(), viper, credentials)
        .with_poll_interval(Duration::from_secs(args.interval));

    if args.cleanup {
        let report = worker.queue().cleanup().await?;
        tracing::info!(
            "Cleanup complete: {} completed and {} failed items deleted",
            report.completed_deleted,
            report.failed_deleted
        );
        return Ok(());
    }

    if args.once {
        match worker.process_next().await? {
            Some(item) => tracing::info!("Processed item {} ({:?})", item.id, item.status),
            None => tracing::info!("Queue is empty"),
        }
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown signal received, finishing current item"),
            Err(e) => {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        }
        let _ = shutdown_tx.send(true);
    });

    let cleanup_task = args.auto_cleanup.then(|| {
        tokio::spawn(run_cleanup_loop(
            worker.queue().clone(),
            CLEANUP_INTERVAL,
            shutdown_rx.clone(),
        ))
    });

    worker.run(shutdown_rx).await;

    if let Some(task) = cleanup_task {
        let _ = task.await;
    }
    Ok(())
}
