//! Photo status, operator views and derivative serving.

use crate::{
    auth::{Role, Session, require_role},
    context::PipelineContext,
    errors::AppError,
    models::{
        object::Object,
        photo::{Photo, PhotoStatus},
        queue_message::QueueMetrics,
    },
    services::{
        object_store::object_url, photo_repository::StatusCounts, worker::requeue_failed,
    },
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

/// Derivative keys are content-stable per photo, so caches may keep them forever.
const MEDIA_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";
const DEFAULT_LIST_LIMIT: i64 = 100;

#[derive(Debug, Deserialize)]
pub struct ListPhotosQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Serialize, Debug)]
pub struct PhotoList {
    pub status: PhotoStatus,
    pub photos: Vec<Photo>,
}

#[derive(Serialize, Debug)]
pub struct PipelineOverview {
    pub photos: StatusCounts,
    pub queue: QueueMetrics,
}

/// `GET /photos/{id}`
pub async fn get_photo(
    State(ctx): State<PipelineContext>,
    session: Session,
    Path(id): Path<Uuid>,
) -> Result<Json<Photo>, AppError> {
    require_role(&session, &[Role::Admin, Role::Photographer, Role::Parent])?;
    ctx.photos
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("photo {} not found", id)))
}

/// `GET /admin/photos?status=FAILED&limit=100`
pub async fn list_photos(
    State(ctx): State<PipelineContext>,
    session: Session,
    Query(q): Query<ListPhotosQuery>,
) -> Result<Json<PhotoList>, AppError> {
    require_role(&session, &[Role::Admin])?;
    let status = match q.status.as_deref() {
        Some(s) => s.parse::<PhotoStatus>().map_err(AppError::bad_request)?,
        None => PhotoStatus::Failed,
    };
    let photos = ctx
        .photos
        .list_by_status(status, q.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .await?;
    Ok(Json(PhotoList { status, photos }))
}

/// `GET /admin/pipeline`
pub async fn pipeline_overview(
    State(ctx): State<PipelineContext>,
    session: Session,
) -> Result<Json<PipelineOverview>, AppError> {
    require_role(&session, &[Role::Admin])?;
    Ok(Json(PipelineOverview {
        photos: ctx.photos.status_counts().await?,
        queue: ctx.queue.metrics(&ctx.config.queue_name).await?,
    }))
}

/// `POST /admin/photos/{id}/retry`
///
/// Only `FAILED` photos can be retried; anything else is a 409.
pub async fn retry_photo(
    State(ctx): State<PipelineContext>,
    session: Session,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<Photo>), AppError> {
    require_role(&session, &[Role::Admin])?;
    if let Some(photo) = requeue_failed(&ctx, id).await? {
        tracing::info!(photo_id = %id, user = %session.user_id, "retry requested");
        return Ok((StatusCode::ACCEPTED, Json(photo)));
    }
    match ctx.photos.get(id).await? {
        Some(photo) => Err(AppError::conflict(format!(
            "photo {} is {}, only FAILED photos can be retried",
            id, photo.status
        ))),
        None => Err(AppError::not_found(format!("photo {} not found", id))),
    }
}

/// `GET /media/{*key}`
///
/// Streams a derivative. Only the derivatives bucket is reachable here;
/// originals are never served.
pub async fn serve_media(
    State(ctx): State<PipelineContext>,
    Path(key): Path<String>,
    request_headers: HeaderMap,
) -> Result<Response, AppError> {
    let url = object_url(&ctx.config.derivatives_bucket, &key);
    let (meta, file) = ctx.store.open_object(&url).await?;

    let etag = format!("\"{}\"", meta.etag);
    let not_modified = request_headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|tag| tag.trim() == etag || tag.trim() == "*"));

    let mut response = if not_modified {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::NOT_MODIFIED;
        response
    } else {
        let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
        set_content_headers(response.headers_mut(), &meta);
        response
    };
    set_cache_headers(response.headers_mut(), &meta, &etag);
    Ok(response)
}

fn set_content_headers(headers: &mut HeaderMap, meta: &Object) {
    let content_type = meta
        .content_type
        .as_deref()
        .unwrap_or("application/octet-stream");
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(meta.size_bytes.max(0)),
    );
}

fn set_cache_headers(headers: &mut HeaderMap, meta: &Object, etag: &str) {
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(MEDIA_CACHE_CONTROL),
    );
    if let Ok(value) = HeaderValue::from_str(etag) {
        headers.insert(header::ETAG, value);
    }
    let last_modified = meta
        .last_modified
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string();
    if let Ok(value) = HeaderValue::from_str(&last_modified) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}
