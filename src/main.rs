use anyhow::{Context, Result};
use axum::Router;
use std::{fs, io::ErrorKind, path::Path, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

mod config;
mod db;
mod errors;
mod handlers;
mod headers;
mod metadata;
mod models;
mod packaging;
mod routes;
mod services;
mod tasks;
#[cfg(test)]
mod test_helpers;

use config::{AppConfig, Mode};
use routes::routes::AppState;
use services::{
    by_reference::Pipeline, deposit_service::DepositService, storage_service::StorageService,
};
use tasks::{
    TaskScheduler,
    runner::{QueueScheduler, RetryPolicy, spawn_workers},
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + mode ---
    let (cfg, mode) = AppConfig::from_env_and_args()?;
    tracing::info!("Starting sword-deposit ({:?}) with config: {:?}", mode, cfg);

    // --- Ensure storage directories exist ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }
    let db_path = cfg
        .database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    // --- Initialize SQLite and schema ---
    let db = Arc::new(db::connect(&cfg.database_url, 5).await?);
    db::run_migrations(&db).await?;
    if mode == Mode::Migrate {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    // --- Initialize core services ---
    let storage = StorageService::new(db.clone(), cfg.storage_dir.clone())
        .with_unpack_limit(cfg.max_unpacked_size);
    let cfg = Arc::new(cfg);
    let (queue, receiver) = QueueScheduler::new();
    let scheduler: Arc<dyn TaskScheduler> = Arc::new(queue);
    let deposits = DepositService::new(storage.clone(), cfg.clone(), scheduler.clone())?;

    if mode == Mode::CollectGarbage {
        let report = deposits.collect_garbage().await?;
        tracing::info!(
            deleted = report.deleted.len(),
            untagged = report.untagged.len(),
            "Garbage collection complete."
        );
        return Ok(());
    }

    // --- Background pipeline ---
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(cfg.fetch_timeout_secs))
        .build()
        .context("building HTTP client")?;
    let pipeline = Pipeline::new(
        storage.clone(),
        http,
        cfg.max_by_reference_size,
        scheduler.clone(),
    );
    let _workers = spawn_workers(
        receiver,
        pipeline.clone(),
        cfg.task_workers,
        RetryPolicy::new(cfg.task_max_retries),
    );
    let resumed = pipeline.resume_pending().await?;
    if resumed > 0 {
        tracing::info!("Resumed {} pending tasks", resumed);
    }

    // --- Build router ---
    let state = AppState {
        storage,
        deposits,
        config: cfg.clone(),
    };
    let app: Router = routes::routes::routes()
        .with_state(state)
        .layer(TraceLayer::new_for_http());

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
    axum::serve(listener, app).await?;

    Ok(())
}
