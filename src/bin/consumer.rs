//! edit-consumer: applies the durable edit log to the document store.
//!
//! Usage: `edit-consumer [config.toml]` (or `FANOUT_CONFIG=config.toml`).
//! Exits non-zero when the consumer group cannot be joined.

use doc_fanout::config::ConsumerConfig;
use doc_fanout::ingest::{DocumentStore, EditConsumer, MemoryDocumentStore, SqliteDocumentStore};
use doc_fanout::lifecycle::{termination_signal, Shutdown};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("FANOUT_CONFIG").ok())
        .map(PathBuf::from);

    let config = match ConsumerConfig::load(path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = Shutdown::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        termination_signal().await;
        info!("Termination signal received");
        signal.trigger();
    });

    match config.sqlite_path.clone() {
        Some(db_path) => match SqliteDocumentStore::new(&db_path).await {
            Ok(store) => {
                let store = Arc::new(store);
                let code = run(config, store.clone(), &shutdown).await;
                store.close().await;
                code
            }
            Err(e) => {
                error!(path = %db_path, error = %e, "Failed to open document store");
                ExitCode::FAILURE
            }
        },
        None => {
            warn!("No sqlite_path configured, applying edits to an in-memory store");
            run(config, Arc::new(MemoryDocumentStore::new()), &shutdown).await
        }
    }
}

async fn run<S: DocumentStore>(config: ConsumerConfig, store: Arc<S>, shutdown: &Shutdown) -> ExitCode {
    let consumer = EditConsumer::new(config, store);
    info!(member_id = %consumer.member_id(), "Starting edit consumer");
    match consumer.run(shutdown.subscribe()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Edit consumer failed");
            ExitCode::FAILURE
        }
    }
}
