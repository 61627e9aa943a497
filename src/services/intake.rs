//! Upload intake.
//!
//! Validates uploaded files, stores each original, creates its `PENDING`
//! photo row and enqueues exactly one processing message. No image work
//! happens here; request latency stays independent of image size.

use crate::{
    context::PipelineContext,
    models::{
        photo::{self, Photo},
        queue_message::ProcessPhoto,
    },
    services::{object_store::StorageError, queue::QueueError},
};
use bytes::Bytes;
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

const MAX_CLASSROOM_ID_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("file `{filename}` is {size} bytes, above the {limit} byte limit")]
    TooLarge {
        filename: String,
        size: usize,
        limit: usize,
    },
    #[error("file `{filename}` has content type `{content_type}`, which is not accepted")]
    UnsupportedContentType {
        filename: String,
        content_type: String,
    },
    #[error("file `{0}` is not a recognizable image")]
    NotAnImage(String),
    #[error("file `{0}` is empty")]
    Empty(String),
    #[error("classroom id `{0}` is invalid")]
    InvalidClassroom(String),
    #[error("no files were uploaded")]
    NoFiles,
    #[error("at most {0} files can be uploaded per request")]
    TooManyFiles(usize),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

#[derive(Debug, Clone)]
pub struct IntakeLimits {
    pub max_upload_bytes: usize,
    pub max_files_per_request: usize,
    pub accepted_content_types: Vec<String>,
}

/// One file as received from the multipart body.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub filename: String,
    pub content_type: String,
    pub bytes: Bytes,
}

/// A file that passed validation, with its sniffed format.
#[derive(Debug, Clone)]
pub struct ValidatedUpload {
    pub file: UploadFile,
    pub content_type: &'static str,
    pub extension: &'static str,
}

fn ensure_classroom_id(classroom_id: &str) -> Result<(), IntakeError> {
    let valid = !classroom_id.is_empty()
        && classroom_id.len() <= MAX_CLASSROOM_ID_LEN
        && classroom_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(IntakeError::InvalidClassroom(classroom_id.to_string()))
    }
}

/// Check size, declared content type and magic bytes of one file.
pub fn validate_upload(limits: &IntakeLimits, file: UploadFile) -> Result<ValidatedUpload, IntakeError> {
    if file.bytes.is_empty() {
        return Err(IntakeError::Empty(file.filename));
    }
    if file.bytes.len() > limits.max_upload_bytes {
        return Err(IntakeError::TooLarge {
            size: file.bytes.len(),
            limit: limits.max_upload_bytes,
            filename: file.filename,
        });
    }

    let accepted = |ct: &str| {
        limits
            .accepted_content_types
            .iter()
            .any(|a| a.eq_ignore_ascii_case(ct))
    };
    let declared = file
        .content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();
    if !accepted(&declared) {
        return Err(IntakeError::UnsupportedContentType {
            filename: file.filename,
            content_type: declared,
        });
    }

    let format = image::guess_format(&file.bytes)
        .map_err(|_| IntakeError::NotAnImage(file.filename.clone()))?;
    let sniffed = format.to_mime_type();
    if !accepted(sniffed) {
        return Err(IntakeError::UnsupportedContentType {
            filename: file.filename,
            content_type: sniffed.to_string(),
        });
    }
    let extension = format.extensions_str().first().copied().unwrap_or("bin");

    Ok(ValidatedUpload {
        file,
        content_type: sniffed,
        extension,
    })
}

/// Validate a whole request before anything is stored, so a bad file
/// rejects the batch without leaving half of it behind.
pub fn validate_all(
    limits: &IntakeLimits,
    files: Vec<UploadFile>,
) -> Result<Vec<ValidatedUpload>, IntakeError> {
    if files.is_empty() {
        return Err(IntakeError::NoFiles);
    }
    if files.len() > limits.max_files_per_request {
        return Err(IntakeError::TooManyFiles(limits.max_files_per_request));
    }
    files
        .into_iter()
        .map(|file| validate_upload(limits, file))
        .collect()
}

/// Store one validated original and queue it for processing.
pub async fn intake_photo(
    ctx: &PipelineContext,
    classroom_id: &str,
    upload: ValidatedUpload,
) -> Result<Photo, IntakeError> {
    ensure_classroom_id(classroom_id)?;
    let photo_id = Uuid::new_v4();
    let key = photo::original_key(photo_id, upload.extension);

    ctx.store
        .put_object(
            &ctx.config.originals_bucket,
            &key,
            upload.file.bytes,
            upload.content_type,
        )
        .await?;

    let photo = ctx.photos.create(photo_id, classroom_id, &key).await?;

    if let Err(err) = ctx
        .queue
        .enqueue(&ctx.config.queue_name, &ProcessPhoto { photo_id })
        .await
    {
        error!(%photo_id, "enqueue failed after photo creation: {}", err);
        // Without a message nothing would ever pick the photo up.
        ctx.photos
            .record_failure(photo_id, &format!("enqueue failed: {}", err), true)
            .await?;
        return Err(err.into());
    }

    info!(
        %photo_id,
        classroom_id,
        filename = %upload.file.filename,
        "photo accepted for processing"
    );
    Ok(photo)
}

/// Validate every file, then take each one in.
pub async fn intake_photos(
    ctx: &PipelineContext,
    classroom_id: &str,
    files: Vec<UploadFile>,
) -> Result<Vec<Photo>, IntakeError> {
    ensure_classroom_id(classroom_id)?;
    let uploads = validate_all(&ctx.config.intake_limits(), files)?;
    let mut photos = Vec::with_capacity(uploads.len());
    for upload in uploads {
        photos.push(intake_photo(ctx, classroom_id, upload).await?);
    }
    Ok(photos)
}
