//! sportswire-sync - Resilient sports-news ingestion
//!
//! Main entry point: wires storage, the content client, OAuth, the sync
//! engine and its scheduler, and the operational HTTP server.

use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};

use sportswire_sync::cancel::CancelToken;
use sportswire_sync::config::Config;
use sportswire_sync::content::ContentApiClient;
use sportswire_sync::database::SqliteDatabase;
use sportswire_sync::http::ResilientClient;
use sportswire_sync::oauth::OAuthManager;
use sportswire_sync::publish::build_publishers;
use sportswire_sync::server::{AppState, Server};
use sportswire_sync::sync::{SyncEngine, SyncScheduler};
use sportswire_sync::telemetry::{init_tracing, SyncMetrics, TelemetryProvider};

/// sportswire-sync - Resilient sports-news ingestion
#[derive(Parser, Debug)]
#[command(name = "sportswire-sync")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "SPORTSWIRE_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = load_config(&args)?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    let telemetry = TelemetryProvider::new(&config.otel)?;
    init_tracing(&telemetry, &config.logging)?;
    let metrics = Arc::new(SyncMetrics::new(&telemetry.meter()));

    info!(version = env!("CARGO_PKG_VERSION"), "Starting sportswire-sync");

    let database = SqliteDatabase::new(&config.database.path)
        .await?
        .with_capacities(
            config.sync.persisted_run_log_capacity,
            config.sync.error_log_capacity,
        );
    let database = Arc::new(database);
    info!(path = %config.database.path, "Database initialized");

    let cancel = CancelToken::new();
    let http = ResilientClient::new(config.http.clone(), config.retry.clone())?
        .with_metrics(metrics.clone());

    let content = ContentApiClient::new(
        config.content_api.clone(),
        http.clone().with_cancel_token(cancel.clone()),
    );

    let oauth = Arc::new(
        OAuthManager::new(
            database.clone(),
            database.clone(),
            http.clone(),
            config.oauth.clone(),
        )
        .with_metrics(metrics.clone()),
    );

    let publishers = build_publishers(&config.publish, oauth.clone(), http.clone());
    info!(count = publishers.len(), "Social publishers configured");

    let engine = Arc::new(
        SyncEngine::new(
            &config,
            Arc::new(content),
            database.clone(),
            database.clone(),
            database.clone(),
        )
        .with_publishers(publishers)
        .with_cancel_token(cancel)
        .with_metrics(metrics),
    );
    info!(
        entities = config.enabled_entities().len(),
        leagues = config.sync_leagues().len(),
        "Sync engine initialized"
    );

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let scheduler = SyncScheduler::new(config.scheduler.clone(), engine.clone(), shutdown_rx);
    let scheduler_status = scheduler.status_handle();
    let scheduler_task = tokio::spawn(scheduler.run());

    let state = AppState {
        engine: engine.clone(),
        oauth,
        sync_state: database.clone(),
        errors: database,
        scheduler: Some(scheduler_status),
    };

    let server = Server::new(config.server.clone(), state);
    info!(
        host = %config.server.host,
        port = %config.server.port,
        "Starting HTTP server"
    );

    let shutdown_engine = engine.clone();
    let result = server
        .run(async move {
            shutdown_signal().await;
            shutdown_engine.cancel();
            let _ = shutdown_tx.send(());
        })
        .await;

    if let Err(e) = scheduler_task.await {
        error!(error = %e, "Scheduler task failed");
    }

    if let Err(e) = telemetry.shutdown() {
        error!(error = %e, "Failed to shutdown OpenTelemetry");
    }

    info!("sportswire-sync shutdown complete");

    result.map_err(Into::into)
}

/// Load configuration from file or environment
fn load_config(args: &Args) -> anyhow::Result<Config> {
    match &args.config {
        Some(path) => {
            // Tracing is not initialized yet
            eprintln!("Loading configuration from file: {}", path);
            Config::from_file(path).map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
        }
        None => {
            eprintln!("Loading configuration from environment variables");
            Config::from_env().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
