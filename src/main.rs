use anyhow::Result;
use axum::Router;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{fs, io::ErrorKind, net::SocketAddr, path::Path, str::FromStr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use services::{
    admission::{AdmissionController, AdmissionLimits},
    ingest::IngestPipeline,
    metadata::MetadataStore,
    object_store::ObjectStore,
    stages,
    storage_service::StorageService,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting blob-store with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Optional metadata database ---
    let metadata = match cfg.database_url.as_deref() {
        Some(url) => Some(connect_metadata(url, cfg.metadata_timeout).await?),
        None => {
            tracing::info!("No database configured, running without metadata");
            None
        }
    };

    // --- Handle migration mode ---
    if migrate {
        let Some(metadata) = &metadata else {
            anyhow::bail!("--migrate requires a database url");
        };
        metadata.ensure_schema().await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }
    if let Some(metadata) = &metadata {
        metadata.ensure_schema().await?;
    }

    // --- Initialize core services ---
    let store = ObjectStore::new(&cfg.storage_dir, cfg.max_allocation_attempts);
    let pipeline = IngestPipeline::new(store, metadata)
        .with_pre_stages(stages::pre_stages(&cfg.pre_stages)?)
        .with_post_stages(stages::post_stages(&cfg.post_stages)?);
    let admission = Arc::new(AdmissionController::new(AdmissionLimits::from_raw(
        cfg.rps_limit,
        cfg.bps_limit,
    )));

    let shutdown = CancellationToken::new();
    let sweeper = if admission.limits().is_unlimited() {
        None
    } else {
        Some(Arc::clone(&admission).spawn_sweeper(cfg.sweep_interval, shutdown.clone()))
    };

    let storage = StorageService::new(admission, pipeline);

    // --- Build router ---
    let app: Router = routes::routes::routes(cfg.max_upload_bytes).with_state(storage);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
    .await?;

    shutdown.cancel();
    if let Some(sweeper) = sweeper {
        if let Err(err) = sweeper.await {
            tracing::error!("admission sweeper failed: {}", err);
        }
    }

    Ok(())
}

/// Open the SQLite pool behind the metadata store, creating the file if needed.
async fn connect_metadata(db_url: &str, timeout: Duration) -> Result<MetadataStore> {
    tracing::debug!("Connecting using raw URL => {}", db_url);

    // Extract the local file path SQLx will use
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    let db_path_obj = Path::new(db_path);

    // Create parent directory if needed
    if let Some(parent) = db_path_obj.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let options = SqliteConnectOptions::from_str(db_url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .acquire_timeout(timeout)
        .connect_with(options)
        .await?;

    Ok(MetadataStore::new(Arc::new(pool), timeout))
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                tracing::error!("failed to listen for shutdown signal: {}", err);
                return;
            }
            tracing::info!("Shutdown signal received");
        }
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}
