//! Messages held by the processing queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A claimed queue message.
///
/// The queue references photos by value only; it never owns photo rows.
#[derive(Clone, FromRow, Debug)]
pub struct QueueMessage {
    #[sqlx(rename = "id")]
    pub message_id: Uuid,

    /// Insertion order within the queue.
    pub seq: i64,

    pub queue_name: String,

    /// Raw JSON payload as enqueued.
    pub payload: String,

    pub enqueued_at: DateTime<Utc>,

    /// Number of times the message was dequeued without acknowledgement.
    pub read_count: i64,
}

/// Payload of a "process this photo" message.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessPhoto {
    pub photo_id: Uuid,
}

/// Point-in-time counters for one queue.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueMetrics {
    pub queue_name: String,
    pub total: i64,
    pub visible: i64,
    pub in_flight: i64,
    pub oldest_enqueued_at: Option<DateTime<Utc>>,
}
