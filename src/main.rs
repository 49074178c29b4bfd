use std::sync::Arc;

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;

use retroledger::api::{self, AppState};
use retroledger::config::{CliArgs, Config};
use retroledger::workflow::AdjustmentWorkflow;
use retroledger_core::{CategoryPolicy, StorageBackend};
use retroledger_memory::InMemoryStorage;
use retroledger_sqlite::SqliteStorage;

#[tokio::main]
async fn main() {
    let cli = CliArgs::parse();
    let config = Config::load(&cli);

    let filter = tracing_subscriber::EnvFilter::try_new(&config.logging.level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if config.logging.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install metrics recorder");

    let storage: Arc<dyn StorageBackend> = match config.storage.backend.as_str() {
        "sqlite" => {
            let storage = SqliteStorage::new(&config.storage.path)
                .expect("Failed to open SQLite database");
            tracing::info!(path = %config.storage.path, "Using SQLite storage");
            Arc::new(storage)
        }
        "memory" => {
            tracing::info!("Using in-memory storage");
            Arc::new(InMemoryStorage::new())
        }
        other => {
            eprintln!("Unknown storage backend '{}', expected 'memory' or 'sqlite'", other);
            std::process::exit(1);
        }
    };

    let workflow = Arc::new(AdjustmentWorkflow::new(
        storage.clone(),
        CategoryPolicy::new(),
    ));
    let state = AppState {
        workflow,
        storage,
        metrics,
    };
    let app = api::router(state, Arc::new(config.auth.clone()));

    let addr = config.listen_addr();
    tracing::info!(%addr, "RetroLedger API listening");

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .expect("Server failed");
}
