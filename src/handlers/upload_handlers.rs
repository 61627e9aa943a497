//! Photographer uploads.

use crate::{
    auth::{Role, Session, require_role},
    context::PipelineContext,
    errors::AppError,
    models::photo::PhotoStatus,
    services::intake::{UploadFile, intake_photos},
};
use axum::{
    Json,
    extract::{Multipart, Path, State},
    http::StatusCode,
};
use serde::Serialize;
use uuid::Uuid;

#[derive(Serialize, Debug)]
pub struct UploadedPhoto {
    pub id: Uuid,
    pub status: PhotoStatus,
}

#[derive(Serialize, Debug)]
pub struct UploadResponse {
    pub photos: Vec<UploadedPhoto>,
}

/// `POST /classrooms/{classroom_id}/photos`
///
/// Every multipart field carrying a filename is one photo. Responds once
/// each original is stored and queued; derivatives come later.
pub async fn upload_photos(
    State(ctx): State<PipelineContext>,
    session: Session,
    Path(classroom_id): Path<String>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), AppError> {
    require_role(&session, &[Role::Photographer, Role::Admin])?;

    let mut files = Vec::new();
    while let Some(field) = multipart.next_field().await? {
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = field.bytes().await?;
        files.push(UploadFile {
            filename,
            content_type,
            bytes,
        });
    }

    let photos = intake_photos(&ctx, &classroom_id, files).await?;
    tracing::info!(
        user = %session.user_id,
        classroom_id = %classroom_id,
        count = photos.len(),
        "upload accepted"
    );

    let photos = photos
        .into_iter()
        .map(|p| UploadedPhoto {
            id: p.id,
            status: p.status,
        })
        .collect();
    Ok((StatusCode::CREATED, Json(UploadResponse { photos })))
}
