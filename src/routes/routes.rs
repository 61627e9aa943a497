//! Defines the HTTP surface of the pipeline.
//!
//! ## Structure
//! - **Health checks**
//!   - `GET  /healthz`, `GET /readyz`
//! - **Scheduler trigger** (bearer secret)
//!   - `POST /internal/process-photos` (also `GET`)
//! - **Intake** (photographer, admin)
//!   - `POST /classrooms/{classroom_id}/photos`
//! - **Status and operators**
//!   - `GET  /photos/{id}`
//!   - `GET  /admin/photos?status=&limit=`
//!   - `GET  /admin/pipeline`
//!   - `POST /admin/photos/{id}/retry`
//! - **Derivatives**
//!   - `GET  /media/{*key}`; the wildcard allows keys like `{photo_id}/preview.jpg`.

use crate::{
    context::PipelineContext,
    handlers::{
        health_handlers::{healthz, readyz},
        photo_handlers::{get_photo, list_photos, pipeline_overview, retry_photo, serve_media},
        trigger_handlers::process_photos,
        upload_handlers::upload_photos,
    },
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build the router. `max_upload_request` bounds the whole multipart body
/// of one upload request.
pub fn routes(max_upload_request: usize) -> Router<PipelineContext> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/internal/process-photos",
            post(process_photos).get(process_photos),
        )
        .route(
            "/classrooms/{classroom_id}/photos",
            post(upload_photos).layer(DefaultBodyLimit::max(max_upload_request)),
        )
        .route("/photos/{id}", get(get_photo))
        .route("/admin/photos", get(list_photos))
        .route("/admin/pipeline", get(pipeline_overview))
        .route("/admin/photos/{id}/retry", post(retry_photo))
        .route("/media/{*key}", get(serve_media))
}
