//! src/services/queue.rs
//!
//! Durable at-least-once message queue stored in SQLite.
//!
//! A dequeue claims messages by pushing their `visible_at` into the future
//! in a single UPDATE, so concurrent consumers never hold the same message
//! at the same time. Messages that are never acknowledged become claimable
//! again once their visibility timeout elapses; that is the only crash
//! recovery mechanism.

use crate::models::queue_message::{QueueMessage, QueueMetrics};
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

const MAX_QUEUE_NAME_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue name `{0}` is invalid")]
    InvalidQueueName(String),
    #[error("payload could not be encoded: {0}")]
    Payload(#[from] serde_json::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Clone)]
pub struct ProcessingQueue {
    db: SqlitePool,
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn ensure_queue_name(name: &str) -> QueueResult<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_QUEUE_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(QueueError::InvalidQueueName(name.to_string()))
    }
}

impl ProcessingQueue {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Create the named queue. Creating an existing queue is a no-op.
    pub async fn create_queue(&self, name: &str) -> QueueResult<()> {
        ensure_queue_name(name)?;
        sqlx::query("INSERT OR IGNORE INTO queues (name, created_at) VALUES (?, ?)")
            .bind(name)
            .bind(Utc::now())
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Store a JSON payload and return its message id. Never waits on consumers.
    pub async fn enqueue<T: Serialize>(&self, name: &str, payload: &T) -> QueueResult<Uuid> {
        self.create_queue(name).await?;
        let body = serde_json::to_string(payload)?;
        let id = Uuid::new_v4();

        sqlx::query(
            "INSERT INTO queue_messages (id, queue_name, payload, enqueued_at, visible_at, read_count)
             VALUES (?, ?, ?, ?, ?, 0)",
        )
        .bind(id)
        .bind(name)
        .bind(&body)
        .bind(Utc::now())
        .bind(now_millis())
        .execute(&self.db)
        .await?;

        debug!("enqueued message {} on {}", id, name);
        Ok(id)
    }

    /// Claim up to `max_messages` visible messages, hiding each for
    /// `visibility_timeout`. An empty result is a normal outcome.
    pub async fn dequeue_batch(
        &self,
        name: &str,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> QueueResult<Vec<QueueMessage>> {
        ensure_queue_name(name)?;
        if max_messages == 0 {
            return Ok(Vec::new());
        }
        let now = now_millis();

        let mut messages = sqlx::query_as::<_, QueueMessage>(
            r#"
            UPDATE queue_messages
            SET visible_at = ?, read_count = read_count + 1
            WHERE id IN (
                SELECT id FROM queue_messages
                WHERE queue_name = ? AND visible_at <= ?
                ORDER BY rowid ASC
                LIMIT ?
            )
            RETURNING rowid AS seq, id, queue_name, payload, enqueued_at, read_count
            "#,
        )
        .bind(now.saturating_add(millis(visibility_timeout)))
        .bind(name)
        .bind(now)
        .bind(max_messages as i64)
        .fetch_all(&self.db)
        .await?;

        messages.sort_by_key(|m| m.seq);
        Ok(messages)
    }

    /// Permanently remove a message. Returns false if it was already gone.
    pub async fn acknowledge(&self, name: &str, message_id: Uuid) -> QueueResult<bool> {
        let result = sqlx::query("DELETE FROM queue_messages WHERE queue_name = ? AND id = ?")
            .bind(name)
            .bind(message_id)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Make a claimed message claimable again right away.
    pub async fn release(&self, name: &str, message_id: Uuid) -> QueueResult<bool> {
        self.release_after(name, message_id, Duration::ZERO).await
    }

    /// Make a claimed message claimable again after `delay`.
    pub async fn release_after(
        &self,
        name: &str,
        message_id: Uuid,
        delay: Duration,
    ) -> QueueResult<bool> {
        let result =
            sqlx::query("UPDATE queue_messages SET visible_at = ? WHERE queue_name = ? AND id = ?")
                .bind(now_millis().saturating_add(millis(delay)))
                .bind(name)
                .bind(message_id)
                .execute(&self.db)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Hide a claimed message for another `visibility_timeout`, but only if
    /// nobody has dequeued it since `claimed.read_count`. Returns false when
    /// the claim was lost to another consumer or the message is gone.
    pub async fn extend_claim(
        &self,
        claimed: &QueueMessage,
        visibility_timeout: Duration,
    ) -> QueueResult<bool> {
        let result = sqlx::query(
            "UPDATE queue_messages SET visible_at = ?
             WHERE queue_name = ? AND id = ? AND read_count = ?",
        )
        .bind(now_millis().saturating_add(millis(visibility_timeout)))
        .bind(&claimed.queue_name)
        .bind(claimed.message_id)
        .bind(claimed.read_count)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn metrics(&self, name: &str) -> QueueResult<QueueMetrics> {
        ensure_queue_name(name)?;
        let (total, visible): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN visible_at <= ? THEN 1 ELSE 0 END), 0)
             FROM queue_messages WHERE queue_name = ?",
        )
        .bind(now_millis())
        .bind(name)
        .fetch_one(&self.db)
        .await?;

        let oldest_enqueued_at = sqlx::query_scalar(
            "SELECT enqueued_at FROM queue_messages WHERE queue_name = ? ORDER BY rowid ASC LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&self.db)
        .await?;

        Ok(QueueMetrics {
            queue_name: name.to_string(),
            total,
            visible,
            in_flight: total - visible,
            oldest_enqueued_at,
        })
    }

    /// Messages currently stored for a photo, claimed or not.
    pub async fn count_for_photo(&self, name: &str, photo_id: Uuid) -> QueueResult<i64> {
        let count = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queue_messages
             WHERE queue_name = ? AND json_extract(payload, '$.photo_id') = ?",
        )
        .bind(name)
        .bind(photo_id.to_string())
        .fetch_one(&self.db)
        .await?;
        Ok(count)
    }
}
