use anyhow::{Context, Result};
use axum::Router;
use std::{fs, io::ErrorKind, path::Path, time::Duration};
use tokio::{net::TcpListener, runtime::Builder};
use tracing_subscriber::EnvFilter;

mod auth;
mod config;
mod context;
mod db;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
#[cfg(test)]
mod test_support;

use config::{AppConfig, Mode};
use context::PipelineContext;
use services::worker::BatchWorker;

/// How long shutdown waits for blocking work, such as a transform whose item
/// already timed out, before the process exits anyway.
const BLOCKING_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

fn main() -> Result<()> {
    let runtime = Builder::new_multi_thread().enable_all().build()?;
    let outcome = runtime.block_on(run());
    runtime.shutdown_timeout(BLOCKING_SHUTDOWN_GRACE);
    outcome
}

async fn run() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + mode ---
    let (cfg, mode) = AppConfig::from_env_and_args()?;

    tracing::info!(?mode, "Starting photo-pipeline with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)
            .with_context(|| format!("creating storage directory {}", cfg.storage_dir))?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Handle migration mode ---
    if mode == Mode::Migrate {
        let db = db::connect(&cfg.database_url).await?;
        db::run_migrations(&db).await?;
        db.close().await;
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    let ctx = PipelineContext::open(cfg).await?;

    let outcome = match mode {
        Mode::RunBatch => run_batch(&ctx).await,
        _ => serve(&ctx).await,
    };
    ctx.close().await;
    outcome
}

/// One worker pass, for schedulers that spawn a process per trigger.
async fn run_batch(ctx: &PipelineContext) -> Result<()> {
    let worker = BatchWorker::new(ctx.clone(), ctx.config.worker_settings());
    let stats = worker
        .run_batch(&ctx.config.queue_name, ctx.config.wall_clock_budget())
        .await?;
    println!("{}", serde_json::to_string(&stats)?);
    Ok(())
}

async fn serve(ctx: &PipelineContext) -> Result<()> {
    let cfg = &ctx.config;

    // --- Build router ---
    let app: Router = routes::routes::routes(cfg.max_request_bytes()).with_state(ctx.clone());

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
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("could not listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
