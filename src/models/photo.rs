//! A class photo and its processing lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Processing state of a photo.
///
/// `PENDING -> PROCESSING -> READY`, or `-> FAILED` once the retry ceiling
/// is reached. A failed attempt below the ceiling goes back to `PENDING`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhotoStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

impl PhotoStatus {
    pub const ALL: [PhotoStatus; 4] = [
        PhotoStatus::Pending,
        PhotoStatus::Processing,
        PhotoStatus::Ready,
        PhotoStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PhotoStatus::Pending => "PENDING",
            PhotoStatus::Processing => "PROCESSING",
            PhotoStatus::Ready => "READY",
            PhotoStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for PhotoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhotoStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PhotoStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown photo status `{}`", s))
    }
}

/// A single uploaded photo.
///
/// Rows only hold object keys; bytes are owned by the object store.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Photo {
    pub id: Uuid,

    /// Owning classroom; never changes after creation.
    pub classroom_id: String,

    /// Key of the untouched upload in the originals bucket.
    pub original_key: String,

    /// Derivative keys in the derivatives bucket, set together on success.
    pub watermarked_key: Option<String>,
    pub thumbnail_key: Option<String>,
    pub preview_key: Option<String>,

    pub status: PhotoStatus,

    /// Number of processing attempts made so far.
    pub attempts: i64,

    pub last_error: Option<String>,

    /// Dimensions of the original, filled at processing time.
    pub width: Option<i64>,
    pub height: Option<i64>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Derivative keys are a pure function of the photo id, so a re-run after a
/// crash overwrites the same objects instead of leaking new ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivativeKeys {
    pub thumbnail: String,
    pub preview: String,
    pub watermarked: String,
}

impl DerivativeKeys {
    pub fn for_photo(photo_id: Uuid) -> Self {
        Self {
            thumbnail: format!("{}/thumbnail.jpg", photo_id),
            preview: format!("{}/preview.jpg", photo_id),
            watermarked: format!("{}/watermarked.jpg", photo_id),
        }
    }
}

/// Key of the original upload for a photo.
pub fn original_key(photo_id: Uuid, extension: &str) -> String {
    format!("{}/original.{}", photo_id, extension)
}
