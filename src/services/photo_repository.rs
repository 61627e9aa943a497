//! Photo rows.
//!
//! Every mutation is one UPDATE keyed by photo id with the allowed source
//! states in its WHERE clause, so concurrent workers never need a
//! multi-row transaction.

use crate::models::photo::{DerivativeKeys, Photo, PhotoStatus};
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use uuid::Uuid;

const PHOTO_COLUMNS: &str = "id, classroom_id, original_key, watermarked_key, thumbnail_key, \
     preview_key, status, attempts, last_error, width, height, created_at, updated_at";

/// Per-status totals for the operator view.
#[derive(Serialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: i64,
    pub processing: i64,
    pub ready: i64,
    pub failed: i64,
}

#[derive(Clone)]
pub struct PhotoRepository {
    db: SqlitePool,
}

impl PhotoRepository {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        id: Uuid,
        classroom_id: &str,
        original_key: &str,
    ) -> sqlx::Result<Photo> {
        let now = Utc::now();
        sqlx::query_as::<_, Photo>(&format!(
            "INSERT INTO photos (id, classroom_id, original_key, status, attempts, created_at, updated_at)
             VALUES (?, ?, ?, ?, 0, ?, ?)
             RETURNING {PHOTO_COLUMNS}"
        ))
        .bind(id)
        .bind(classroom_id)
        .bind(original_key)
        .bind(PhotoStatus::Pending)
        .bind(now)
        .bind(now)
        .fetch_one(&self.db)
        .await
    }

    pub async fn get(&self, id: Uuid) -> sqlx::Result<Option<Photo>> {
        sqlx::query_as::<_, Photo>(&format!("SELECT {PHOTO_COLUMNS} FROM photos WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.db)
            .await
    }

    /// Claim a photo for an attempt: `PROCESSING` and `attempts + 1`.
    ///
    /// Returns None when the row is missing, `READY` or `FAILED`.
    /// `PROCESSING` is accepted because a crashed attempt leaves it behind.
    pub async fn mark_processing(&self, id: Uuid) -> sqlx::Result<Option<Photo>> {
        sqlx::query_as::<_, Photo>(&format!(
            "UPDATE photos SET status = ?, attempts = attempts + 1, updated_at = ?
             WHERE id = ? AND status IN (?, ?)
             RETURNING {PHOTO_COLUMNS}"
        ))
        .bind(PhotoStatus::Processing)
        .bind(Utc::now())
        .bind(id)
        .bind(PhotoStatus::Pending)
        .bind(PhotoStatus::Processing)
        .fetch_optional(&self.db)
        .await
    }

    pub async fn mark_ready(
        &self,
        id: Uuid,
        keys: &DerivativeKeys,
        width: u32,
        height: u32,
    ) -> sqlx::Result<Option<Photo>> {
        sqlx::query_as::<_, Photo>(&format!(
            "UPDATE photos SET status = ?, thumbnail_key = ?, preview_key = ?, watermarked_key = ?,
                 width = ?, height = ?, last_error = NULL, updated_at = ?
             WHERE id = ? AND status != ?
             RETURNING {PHOTO_COLUMNS}"
        ))
        .bind(PhotoStatus::Ready)
        .bind(&keys.thumbnail)
        .bind(&keys.preview)
        .bind(&keys.watermarked)
        .bind(i64::from(width))
        .bind(i64::from(height))
        .bind(Utc::now())
        .bind(id)
        .bind(PhotoStatus::Ready)
        .fetch_optional(&self.db)
        .await
    }

    /// Record a failed attempt. `terminal` moves the photo to `FAILED`,
    /// otherwise it goes back to `PENDING` for a later retry.
    pub async fn record_failure(
        &self,
        id: Uuid,
        error: &str,
        terminal: bool,
    ) -> sqlx::Result<Option<Photo>> {
        let status = if terminal {
            PhotoStatus::Failed
        } else {
            PhotoStatus::Pending
        };
        sqlx::query_as::<_, Photo>(&format!(
            "UPDATE photos SET status = ?, last_error = ?, updated_at = ?
             WHERE id = ? AND status != ?
             RETURNING {PHOTO_COLUMNS}"
        ))
        .bind(status)
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .bind(PhotoStatus::Ready)
        .fetch_optional(&self.db)
        .await
    }

    /// Put a `FAILED` photo back to `PENDING` with a fresh attempt budget.
    pub async fn reset_for_retry(&self, id: Uuid) -> sqlx::Result<Option<Photo>> {
        sqlx::query_as::<_, Photo>(&format!(
            "UPDATE photos SET status = ?, attempts = 0, last_error = NULL, updated_at = ?
             WHERE id = ? AND status = ?
             RETURNING {PHOTO_COLUMNS}"
        ))
        .bind(PhotoStatus::Pending)
        .bind(Utc::now())
        .bind(id)
        .bind(PhotoStatus::Failed)
        .fetch_optional(&self.db)
        .await
    }

    /// Most recently updated photos in a given state.
    pub async fn list_by_status(&self, status: PhotoStatus, limit: i64) -> sqlx::Result<Vec<Photo>> {
        sqlx::query_as::<_, Photo>(&format!(
            "SELECT {PHOTO_COLUMNS} FROM photos WHERE status = ?
             ORDER BY updated_at DESC LIMIT ?"
        ))
        .bind(status)
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.db)
        .await
    }

    pub async fn status_counts(&self) -> sqlx::Result<StatusCounts> {
        let rows: Vec<(PhotoStatus, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM photos GROUP BY status")
                .fetch_all(&self.db)
                .await?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            match status {
                PhotoStatus::Pending => counts.pending = n,
                PhotoStatus::Processing => counts.processing = n,
                PhotoStatus::Ready => counts.ready = n,
                PhotoStatus::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }
}
