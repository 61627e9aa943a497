//! Scheduler entry point for the batch worker.

use crate::{
    auth::verify_bearer,
    context::PipelineContext,
    errors::AppError,
    services::worker::{BatchStats, BatchWorker},
};
use axum::{Json, extract::State, http::HeaderMap};

/// `POST /internal/process-photos` (also `GET`)
///
/// Credentials are checked before the queue is touched. Runs one worker
/// pass within the configured wall-clock budget and returns its summary.
pub async fn process_photos(
    State(ctx): State<PipelineContext>,
    headers: HeaderMap,
) -> Result<Json<BatchStats>, AppError> {
    verify_bearer(&headers, ctx.config.trigger_secret.as_deref())?;

    let worker = BatchWorker::new(ctx.clone(), ctx.config.worker_settings());
    let stats = worker
        .run_batch(&ctx.config.queue_name, ctx.config.wall_clock_budget())
        .await?;
    Ok(Json(stats))
}
