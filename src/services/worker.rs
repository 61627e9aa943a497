//! Batch worker.
//!
//! One `run_batch` call is one bounded processing pass: claim messages,
//! transform each referenced photo, write derivatives, update the row, and
//! only then acknowledge. A crash between any two of those steps leaves the
//! message claimable again once its visibility timeout runs out; derivative
//! keys are fixed per photo so the redo overwrites instead of duplicating.

use crate::{
    context::PipelineContext,
    models::{
        photo::{DerivativeKeys, Photo, PhotoStatus},
        queue_message::{ProcessPhoto, QueueMessage},
    },
    services::{object_store::object_url, queue::QueueError, transform::TransformError},
};
use futures::{StreamExt, stream};
use serde::Serialize;
use std::{collections::HashSet, time::Duration};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

const JPEG: &str = "image/jpeg";
const MAX_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub originals_bucket: String,
    pub derivatives_bucket: String,
    pub batch_size: usize,
    pub concurrency: usize,
    pub visibility_timeout: Duration,
    pub item_timeout: Duration,
    pub retry_ceiling: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub fail_fast_on_decode: bool,
}

impl WorkerSettings {
    /// Delay before the next attempt: `base * 2^(attempts - 1)`, capped.
    pub fn backoff(&self, attempts: i64) -> Duration {
        let exponent = attempts.saturating_sub(1).clamp(0, 20) as u32;
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.backoff_max)
    }
}

/// Summary returned to the trigger.
#[derive(Serialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchStats {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl BatchStats {
    fn record(&mut self, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::Succeeded => self.succeeded += 1,
            ItemOutcome::Skipped(_) => self.skipped += 1,
            ItemOutcome::Retry { .. } | ItemOutcome::Failed(_) => self.failed += 1,
            ItemOutcome::Deferred | ItemOutcome::ClaimLost => return,
        }
        self.processed += 1;
    }
}

/// What happened to one claimed message, and so what to tell the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Derivatives written and row `READY`; acknowledge.
    Succeeded,
    /// Nothing to do (duplicate delivery, unknown photo, bad payload); acknowledge.
    Skipped(&'static str),
    /// Attempt failed below the ceiling; release after `delay`, or leave
    /// the claim to expire when `delay` is None.
    Retry { error: String, delay: Option<Duration> },
    /// Retry ceiling reached, row is `FAILED`; acknowledge.
    Failed(String),
    /// Claimed after the deadline passed; release untouched.
    Deferred,
    /// The claim lapsed while queued behind other items and another
    /// consumer has taken the message; leave it to them.
    ClaimLost,
}

/// Invocation-level failures. Per-item failures never surface here.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("queue unavailable: {0}")]
    Queue(#[from] QueueError),
    #[error("photo repository unavailable: {0}")]
    Repository(#[from] sqlx::Error),
}

/// Why one attempt failed.
struct AttemptFailure {
    message: String,
    input_failure: bool,
}

impl AttemptFailure {
    fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            input_failure: false,
        }
    }
}

impl From<TransformError> for AttemptFailure {
    fn from(err: TransformError) -> Self {
        Self {
            input_failure: err.is_input_failure(),
            message: err.to_string(),
        }
    }
}

pub struct BatchWorker {
    ctx: PipelineContext,
    settings: WorkerSettings,
}

impl BatchWorker {
    pub fn new(ctx: PipelineContext, settings: WorkerSettings) -> Self {
        Self { ctx, settings }
    }

    /// Drain `queue_name` until it is empty or `budget` has elapsed.
    ///
    /// The deadline is checked between items, never inside a transform, so
    /// the call can overrun by at most one item's processing time.
    pub async fn run_batch(
        &self,
        queue_name: &str,
        budget: Duration,
    ) -> Result<BatchStats, WorkerError> {
        let deadline = Instant::now() + budget;
        let mut stats = BatchStats::default();
        let mut seen: HashSet<Uuid> = HashSet::new();

        while Instant::now() < deadline {
            let claimed = match self
                .ctx
                .queue
                .dequeue_batch(
                    queue_name,
                    self.settings.batch_size.clamp(1, MAX_BATCH_SIZE),
                    self.settings.visibility_timeout,
                )
                .await
            {
                Ok(claimed) => claimed,
                Err(err) if stats.processed == 0 => return Err(err.into()),
                Err(err) => {
                    warn!("dequeue failed mid-batch, stopping early: {}", err);
                    break;
                }
            };
            if claimed.is_empty() {
                break;
            }

            // One attempt per message per invocation; the next trigger retries.
            let (fresh, repeated): (Vec<_>, Vec<_>) = claimed
                .into_iter()
                .partition(|msg| !seen.contains(&msg.message_id));
            for msg in &repeated {
                self.release(queue_name, msg, Duration::ZERO).await;
            }
            if fresh.is_empty() {
                break;
            }
            seen.extend(fresh.iter().map(|msg| msg.message_id));

            let outcomes: Vec<ItemOutcome> = stream::iter(fresh)
                .map(|msg| async move {
                    let outcome = self.start(&msg, deadline).await;
                    self.settle(queue_name, &msg, &outcome).await;
                    outcome
                })
                .buffer_unordered(self.settings.concurrency.max(1))
                .collect()
                .await;

            for outcome in &outcomes {
                stats.record(outcome);
            }
            if !repeated.is_empty() {
                break;
            }
        }

        info!(
            queue = queue_name,
            processed = stats.processed,
            succeeded = stats.succeeded,
            failed = stats.failed,
            skipped = stats.skipped,
            "batch finished"
        );
        Ok(stats)
    }

    /// Begin one claimed item.
    ///
    /// A batch is claimed at once but started one slot at a time, so by the
    /// time an item starts its claim may be old. The claim is re-armed for a
    /// full visibility timeout first; if someone else dequeued the message in
    /// the meantime the item is dropped.
    pub async fn start(&self, msg: &QueueMessage, deadline: Instant) -> ItemOutcome {
        if Instant::now() >= deadline {
            return ItemOutcome::Deferred;
        }
        match self
            .ctx
            .queue
            .extend_claim(msg, self.settings.visibility_timeout)
            .await
        {
            Ok(true) => self.handle(msg).await,
            Ok(false) => {
                warn!(message_id = %msg.message_id, "claim lapsed before processing started");
                ItemOutcome::ClaimLost
            }
            Err(err) => ItemOutcome::Retry {
                error: err.to_string(),
                delay: None,
            },
        }
    }

    /// Process one message up to, but not including, the queue update.
    pub async fn handle(&self, msg: &QueueMessage) -> ItemOutcome {
        let photo_id = match serde_json::from_str::<ProcessPhoto>(&msg.payload) {
            Ok(payload) => payload.photo_id,
            Err(err) => {
                warn!(message_id = %msg.message_id, "unreadable payload: {}", err);
                return ItemOutcome::Skipped("unreadable payload");
            }
        };

        let photo = match self.ctx.photos.get(photo_id).await {
            Ok(Some(photo)) => photo,
            Ok(None) => {
                warn!(%photo_id, message_id = %msg.message_id, "photo no longer exists");
                return ItemOutcome::Skipped("photo not found");
            }
            Err(err) => {
                return ItemOutcome::Retry {
                    error: err.to_string(),
                    delay: None,
                };
            }
        };

        match photo.status {
            PhotoStatus::Ready => {
                debug!(%photo_id, "duplicate delivery of a ready photo");
                return ItemOutcome::Skipped("already ready");
            }
            PhotoStatus::Failed => return ItemOutcome::Skipped("already failed"),
            PhotoStatus::Pending | PhotoStatus::Processing => {}
        }

        let photo = match self.ctx.photos.mark_processing(photo_id).await {
            Ok(Some(photo)) => photo,
            Ok(None) => return ItemOutcome::Skipped("no longer claimable"),
            Err(err) => {
                return ItemOutcome::Retry {
                    error: err.to_string(),
                    delay: None,
                };
            }
        };

        debug!(
            %photo_id,
            message_id = %msg.message_id,
            attempt = photo.attempts,
            read_count = msg.read_count,
            "processing photo"
        );

        match self.process(&photo).await {
            Ok(outcome) => outcome,
            Err(failure) => self.fail(&photo, failure).await,
        }
    }

    async fn process(&self, photo: &Photo) -> Result<ItemOutcome, AttemptFailure> {
        let original_url = object_url(&self.settings.originals_bucket, &photo.original_key);
        let original = self
            .ctx
            .store
            .get_object(&original_url)
            .await
            .map_err(|err| AttemptFailure::transient(format!("reading original: {}", err)))?;

        // On timeout the blocking transform keeps running until it returns;
        // only its result is dropped.
        let derivatives = tokio::time::timeout(
            self.settings.item_timeout,
            self.ctx.engine.clone().transform_blocking(original),
        )
        .await
        .map_err(|_| {
            AttemptFailure::transient(format!(
                "transform timed out after {}s",
                self.settings.item_timeout.as_secs()
            ))
        })??;

        let keys = DerivativeKeys::for_photo(photo.id);
        let bucket = &self.settings.derivatives_bucket;
        for (key, bytes) in [
            (&keys.thumbnail, derivatives.thumbnail),
            (&keys.preview, derivatives.preview),
            (&keys.watermarked, derivatives.watermarked),
        ] {
            self.ctx
                .store
                .put_object(bucket, key, bytes, JPEG)
                .await
                .map_err(|err| AttemptFailure::transient(format!("writing {}: {}", key, err)))?;
        }

        match self
            .ctx
            .photos
            .mark_ready(photo.id, &keys, derivatives.width, derivatives.height)
            .await
        {
            Ok(Some(_)) => {
                info!(photo_id = %photo.id, attempt = photo.attempts, "photo ready");
                Ok(ItemOutcome::Succeeded)
            }
            Ok(None) => Ok(ItemOutcome::Skipped("already ready")),
            Err(err) => Err(AttemptFailure::transient(format!("updating photo: {}", err))),
        }
    }

    /// Record a failed attempt and decide between retrying and giving up.
    async fn fail(&self, photo: &Photo, failure: AttemptFailure) -> ItemOutcome {
        let ceiling_reached = photo.attempts >= i64::from(self.settings.retry_ceiling);
        let terminal =
            ceiling_reached || (self.settings.fail_fast_on_decode && failure.input_failure);

        warn!(
            photo_id = %photo.id,
            attempt = photo.attempts,
            terminal,
            "processing failed: {}",
            failure.message
        );

        match self
            .ctx
            .photos
            .record_failure(photo.id, &failure.message, terminal)
            .await
        {
            Ok(_) if terminal => ItemOutcome::Failed(failure.message),
            Ok(_) => ItemOutcome::Retry {
                delay: Some(self.settings.backoff(photo.attempts)),
                error: failure.message,
            },
            // The row still says PROCESSING; let the claim expire and retry.
            Err(err) => {
                warn!(photo_id = %photo.id, "could not record failure: {}", err);
                ItemOutcome::Retry {
                    error: failure.message,
                    delay: None,
                }
            }
        }
    }

    /// Tell the queue what happened. Errors are logged, never propagated:
    /// an unacknowledged message simply comes back later.
    async fn settle(&self, queue_name: &str, msg: &QueueMessage, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::Succeeded | ItemOutcome::Skipped(_) | ItemOutcome::Failed(_) => {
                if let Err(err) = self.ctx.queue.acknowledge(queue_name, msg.message_id).await {
                    warn!(message_id = %msg.message_id, "acknowledge failed: {}", err);
                }
            }
            ItemOutcome::Retry {
                delay: Some(delay), ..
            } => self.release(queue_name, msg, *delay).await,
            ItemOutcome::Retry { delay: None, .. } | ItemOutcome::ClaimLost => {}
            ItemOutcome::Deferred => self.release(queue_name, msg, Duration::ZERO).await,
        }
    }

    async fn release(&self, queue_name: &str, msg: &QueueMessage, delay: Duration) {
        let released = if delay.is_zero() {
            self.ctx.queue.release(queue_name, msg.message_id).await
        } else {
            self.ctx
                .queue
                .release_after(queue_name, msg.message_id, delay)
                .await
        };
        if let Err(err) = released {
            warn!(message_id = %msg.message_id, "release failed: {}", err);
        }
    }
}

/// Put a `FAILED` photo back in line with a fresh attempt budget.
///
/// Returns None when the photo does not exist or is not `FAILED`.
pub async fn requeue_failed(
    ctx: &PipelineContext,
    photo_id: Uuid,
) -> Result<Option<Photo>, WorkerError> {
    let photo = ctx.photos.reset_for_retry(photo_id).await?;
    if photo.is_some() {
        let queue_name = &ctx.config.queue_name;
        // A message still in flight will pick the reset row up by itself.
        if ctx.queue.count_for_photo(queue_name, photo_id).await? == 0 {
            ctx.queue
                .enqueue(queue_name, &ProcessPhoto { photo_id })
                .await?;
        }
        info!(%photo_id, "failed photo requeued");
    }
    Ok(photo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        services::intake::{UploadFile, intake_photos},
        test_support::{CountingStore, FaultyStore, jpeg_bytes, test_context, test_context_with},
    };
    use bytes::Bytes;
    use image::GenericImageView;

    const BUDGET: Duration = Duration::from_secs(60);

    async fn upload(ctx: &PipelineContext, bytes: Vec<u8>) -> Uuid {
        let photos = intake_photos(
            ctx,
            "class-4b",
            vec![UploadFile {
                filename: "kid.jpg".into(),
                content_type: "image/jpeg".into(),
                bytes: Bytes::from(bytes),
            }],
        )
        .await
        .unwrap();
        photos[0].id
    }

    /// Starts like a JPEG, then falls apart.
    fn corrupt_jpeg() -> Vec<u8> {
        let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00];
        bytes.extend(std::iter::repeat_n(0x42, 256));
        bytes
    }

    fn worker(ctx: &PipelineContext) -> BatchWorker {
        BatchWorker::new(ctx.clone(), ctx.config.worker_settings())
    }

    async fn photo(ctx: &PipelineContext, id: Uuid) -> Photo {
        ctx.photos.get(id).await.unwrap().unwrap()
    }

    async fn derivative_dims(ctx: &PipelineContext, key: &str) -> (u32, u32) {
        let bytes = ctx
            .store
            .get_object(&object_url(&ctx.config.derivatives_bucket, key))
            .await
            .unwrap();
        image::load_from_memory(&bytes).unwrap().dimensions()
    }

    async fn queue_total(ctx: &PipelineContext) -> i64 {
        ctx.queue.metrics(&ctx.config.queue_name).await.unwrap().total
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let settings = WorkerSettings {
            backoff_base: Duration::from_secs(30),
            backoff_max: Duration::from_secs(900),
            ..crate::config::AppConfig::default().worker_settings()
        };
        assert_eq!(settings.backoff(0), Duration::from_secs(30));
        assert_eq!(settings.backoff(1), Duration::from_secs(30));
        assert_eq!(settings.backoff(2), Duration::from_secs(60));
        assert_eq!(settings.backoff(5), Duration::from_secs(480));
        assert_eq!(settings.backoff(6), Duration::from_secs(900));
        assert_eq!(settings.backoff(40), Duration::from_secs(900));
    }

    #[tokio::test]
    async fn large_upload_becomes_ready_with_bounded_derivatives() {
        let (ctx, _dir) = test_context().await;
        let id = upload(&ctx, jpeg_bytes(4000, 3000)).await;

        let stats = worker(&ctx).run_batch(&ctx.config.queue_name, BUDGET).await.unwrap();
        assert_eq!(
            stats,
            BatchStats {
                processed: 1,
                succeeded: 1,
                failed: 0,
                skipped: 0
            }
        );

        let photo = photo(&ctx, id).await;
        assert_eq!(photo.status, PhotoStatus::Ready);
        assert_eq!((photo.width, photo.height), (Some(4000), Some(3000)));
        assert_eq!(photo.attempts, 1);
        assert!(photo.last_error.is_none());

        let keys = DerivativeKeys::for_photo(id);
        assert_eq!(photo.thumbnail_key.as_deref(), Some(keys.thumbnail.as_str()));
        assert_eq!(photo.preview_key.as_deref(), Some(keys.preview.as_str()));
        assert_eq!(photo.watermarked_key.as_deref(), Some(keys.watermarked.as_str()));

        let (tw, th) = derivative_dims(&ctx, &keys.thumbnail).await;
        assert!(tw <= 300 && th <= 300);
        assert_eq!(derivative_dims(&ctx, &keys.preview).await, (1500, 1125));
        assert_eq!(derivative_dims(&ctx, &keys.watermarked).await, (4000, 3000));

        assert_eq!(queue_total(&ctx).await, 0);
    }

    #[tokio::test]
    async fn duplicate_delivery_of_a_ready_photo_changes_nothing() {
        let (ctx, _dir) = test_context().await;
        let id = upload(&ctx, jpeg_bytes(320, 240)).await;
        let worker = worker(&ctx);
        worker.run_batch(&ctx.config.queue_name, BUDGET).await.unwrap();
        let ready = photo(&ctx, id).await;

        ctx.queue
            .enqueue(&ctx.config.queue_name, &ProcessPhoto { photo_id: id })
            .await
            .unwrap();
        let stats = worker.run_batch(&ctx.config.queue_name, BUDGET).await.unwrap();
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.succeeded, 0);

        let again = photo(&ctx, id).await;
        assert_eq!(again.status, PhotoStatus::Ready);
        assert_eq!(again.attempts, ready.attempts);
        assert_eq!(again.updated_at, ready.updated_at);
        assert_eq!(again.watermarked_key, ready.watermarked_key);
        assert_eq!(queue_total(&ctx).await, 0);
    }

    #[tokio::test]
    async fn undecodable_photo_fails_after_exactly_ceiling_invocations() {
        let (ctx, _dir) = test_context().await;
        let id = upload(&ctx, corrupt_jpeg()).await;
        let worker = BatchWorker::new(
            ctx.clone(),
            WorkerSettings {
                retry_ceiling: 3,
                backoff_base: Duration::ZERO,
                ..ctx.config.worker_settings()
            },
        );

        for invocation in 1..=3 {
            let stats = worker.run_batch(&ctx.config.queue_name, BUDGET).await.unwrap();
            assert_eq!(stats.processed, 1, "invocation {invocation}");
            assert_eq!(stats.failed, 1, "invocation {invocation}");

            let photo = photo(&ctx, id).await;
            assert_eq!(photo.attempts, invocation);
            assert!(photo.last_error.is_some());
            if invocation < 3 {
                assert_eq!(photo.status, PhotoStatus::Pending);
                assert_eq!(queue_total(&ctx).await, 1);
            }
        }

        let photo = photo(&ctx, id).await;
        assert_eq!(photo.status, PhotoStatus::Failed);
        assert!(photo.thumbnail_key.is_none());
        assert_eq!(queue_total(&ctx).await, 0);

        let stats = worker.run_batch(&ctx.config.queue_name, BUDGET).await.unwrap();
        assert_eq!(stats, BatchStats::default());
    }

    #[tokio::test]
    async fn fail_fast_marks_undecodable_input_failed_at_once() {
        let (ctx, _dir) = test_context().await;
        let id = upload(&ctx, corrupt_jpeg()).await;
        let worker = BatchWorker::new(
            ctx.clone(),
            WorkerSettings {
                fail_fast_on_decode: true,
                ..ctx.config.worker_settings()
            },
        );

        let stats = worker.run_batch(&ctx.config.queue_name, BUDGET).await.unwrap();
        assert_eq!(stats.failed, 1);
        let photo = photo(&ctx, id).await;
        assert_eq!(photo.status, PhotoStatus::Failed);
        assert_eq!(photo.attempts, 1);
        assert_eq!(queue_total(&ctx).await, 0);
    }

    #[tokio::test]
    async fn crash_before_ready_is_redone_onto_the_same_keys() {
        let (ctx, _dir) = test_context().await;
        let id = upload(&ctx, jpeg_bytes(640, 480)).await;
        let worker = worker(&ctx);
        let q = &ctx.config.queue_name;

        // Derivatives written, then the process dies before the row update
        // and the acknowledgement.
        let claimed = ctx.queue.dequeue_batch(q, 1, Duration::ZERO).await.unwrap();
        assert_eq!(worker.handle(&claimed[0]).await, ItemOutcome::Succeeded);
        sqlx::query("UPDATE photos SET status = 'PROCESSING' WHERE id = ?")
            .bind(id)
            .execute(&ctx.db)
            .await
            .unwrap();

        let stats = worker.run_batch(q, BUDGET).await.unwrap();
        assert_eq!(stats.succeeded, 1);

        let photo = photo(&ctx, id).await;
        assert_eq!(photo.status, PhotoStatus::Ready);
        assert_eq!(photo.attempts, 2);
        assert_eq!(
            photo.watermarked_key,
            Some(DerivativeKeys::for_photo(id).watermarked)
        );

        let derivative_rows: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM objects WHERE bucket = ?")
                .bind(&ctx.config.derivatives_bucket)
                .fetch_one(&ctx.db)
                .await
                .unwrap();
        assert_eq!(derivative_rows, 3);
        assert_eq!(queue_total(&ctx).await, 0);
    }

    #[tokio::test]
    async fn crash_mid_transform_is_picked_up_after_the_claim_expires() {
        let (ctx, _dir) = test_context().await;
        let id = upload(&ctx, jpeg_bytes(320, 240)).await;
        let q = &ctx.config.queue_name;

        ctx.queue.dequeue_batch(q, 1, Duration::ZERO).await.unwrap();
        ctx.photos.mark_processing(id).await.unwrap();

        let stats = worker(&ctx).run_batch(q, BUDGET).await.unwrap();
        assert_eq!(stats.succeeded, 1);
        assert_eq!(photo(&ctx, id).await.status, PhotoStatus::Ready);
    }

    #[tokio::test]
    async fn transient_store_failure_is_retried_on_the_next_invocation() {
        let (ctx, store, _dir) = test_context_with(FaultyStore::new).await;
        let id = upload(&ctx, jpeg_bytes(320, 240)).await;
        let worker = worker(&ctx);
        let q = &ctx.config.queue_name;

        store.fail_next_puts(1);
        let stats = worker.run_batch(q, BUDGET).await.unwrap();
        assert_eq!(stats.failed, 1);
        let failed = photo(&ctx, id).await;
        assert_eq!(failed.status, PhotoStatus::Pending);
        assert!(failed.last_error.unwrap().contains("injected"));

        let stats = worker.run_batch(q, BUDGET).await.unwrap();
        assert_eq!(stats.succeeded, 1);
        let ready = photo(&ctx, id).await;
        assert_eq!(ready.status, PhotoStatus::Ready);
        assert_eq!(ready.attempts, 2);
        assert!(ready.last_error.is_none());
    }

    #[tokio::test]
    async fn item_timeout_counts_as_a_failed_attempt() {
        let (ctx, _dir) = test_context().await;
        let id = upload(&ctx, jpeg_bytes(2000, 1500)).await;
        let worker = BatchWorker::new(
            ctx.clone(),
            WorkerSettings {
                item_timeout: Duration::ZERO,
                ..ctx.config.worker_settings()
            },
        );

        let stats = worker.run_batch(&ctx.config.queue_name, BUDGET).await.unwrap();
        assert_eq!(stats.failed, 1);
        let photo = photo(&ctx, id).await;
        assert_eq!(photo.status, PhotoStatus::Pending);
        assert!(photo.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn overlapping_invocations_claim_disjoint_messages() {
        let (ctx, store, _dir) = test_context_with(CountingStore::new).await;
        let mut ids = Vec::new();
        for _ in 0..6 {
            ids.push(upload(&ctx, jpeg_bytes(96, 64)).await);
        }
        let settings = WorkerSettings {
            batch_size: 2,
            ..ctx.config.worker_settings()
        };
        let a = BatchWorker::new(ctx.clone(), settings.clone());
        let b = BatchWorker::new(ctx.clone(), settings);
        let q = &ctx.config.queue_name;

        let (sa, sb) = tokio::join!(a.run_batch(q, BUDGET), b.run_batch(q, BUDGET));
        let (sa, sb) = (sa.unwrap(), sb.unwrap());
        assert_eq!(sa.succeeded + sb.succeeded, 6);
        assert_eq!(sa.processed + sb.processed, 6);

        let reads = store.reads();
        assert_eq!(reads.len(), 6);
        assert!(reads.values().all(|&n| n == 1));
        for id in ids {
            assert_eq!(photo(&ctx, id).await.status, PhotoStatus::Ready);
        }
    }

    #[tokio::test]
    async fn items_queued_behind_a_slow_one_keep_their_claim() {
        let (ctx, store, _dir) = test_context_with(|inner| {
            CountingStore::with_read_delay(inner, Duration::from_millis(700))
        })
        .await;
        let first = upload(&ctx, jpeg_bytes(64, 48)).await;
        let second = upload(&ctx, jpeg_bytes(64, 48)).await;
        let settings = WorkerSettings {
            batch_size: 2,
            concurrency: 1,
            visibility_timeout: Duration::from_secs(1),
            item_timeout: Duration::from_millis(500),
            ..ctx.config.worker_settings()
        };
        let a = BatchWorker::new(ctx.clone(), settings.clone());
        let b = BatchWorker::new(ctx.clone(), settings);
        let q = &ctx.config.queue_name;

        // `b` starts after the batch-wide claim of `a` has run out, while
        // `a` is still working through its second item.
        let (sa, sb) = tokio::join!(a.run_batch(q, BUDGET), async {
            tokio::time::sleep(Duration::from_millis(1100)).await;
            b.run_batch(q, BUDGET).await
        });
        assert_eq!(sa.unwrap().succeeded, 2);
        assert_eq!(sb.unwrap(), BatchStats::default());

        assert!(store.reads().values().all(|&n| n == 1));
        for id in [first, second] {
            let photo = photo(&ctx, id).await;
            assert_eq!(photo.status, PhotoStatus::Ready);
            assert_eq!(photo.attempts, 1);
        }
    }

    #[tokio::test]
    async fn stale_claim_is_left_to_its_new_holder() {
        let (ctx, _dir) = test_context().await;
        let id = upload(&ctx, jpeg_bytes(64, 48)).await;
        let q = &ctx.config.queue_name;

        let stale = ctx.queue.dequeue_batch(q, 1, Duration::ZERO).await.unwrap().remove(0);
        ctx.queue.dequeue_batch(q, 1, BUDGET).await.unwrap();

        let outcome = worker(&ctx).start(&stale, Instant::now() + BUDGET).await;
        assert_eq!(outcome, ItemOutcome::ClaimLost);

        let photo = photo(&ctx, id).await;
        assert_eq!(photo.status, PhotoStatus::Pending);
        assert_eq!(photo.attempts, 0);
        let metrics = ctx.queue.metrics(q).await.unwrap();
        assert_eq!((metrics.total, metrics.in_flight), (1, 1));
    }

    #[tokio::test]
    async fn items_claimed_past_the_deadline_are_released_untouched() {
        let (ctx, _store, _dir) = test_context_with(|inner| {
            CountingStore::with_read_delay(inner, Duration::from_millis(600))
        })
        .await;
        let first = upload(&ctx, jpeg_bytes(64, 48)).await;
        let second = upload(&ctx, jpeg_bytes(64, 48)).await;
        let worker = BatchWorker::new(
            ctx.clone(),
            WorkerSettings {
                batch_size: 2,
                concurrency: 1,
                ..ctx.config.worker_settings()
            },
        );
        let q = &ctx.config.queue_name;

        let stats = worker.run_batch(q, Duration::from_millis(300)).await.unwrap();
        assert_eq!(
            stats,
            BatchStats {
                processed: 1,
                succeeded: 1,
                failed: 0,
                skipped: 0
            }
        );

        assert_eq!(photo(&ctx, first).await.status, PhotoStatus::Ready);
        let untouched = photo(&ctx, second).await;
        assert_eq!(untouched.status, PhotoStatus::Pending);
        assert_eq!(untouched.attempts, 0);

        let metrics = ctx.queue.metrics(q).await.unwrap();
        assert_eq!((metrics.total, metrics.visible), (1, 1));
        let next = ctx.queue.dequeue_batch(q, 10, BUDGET).await.unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].read_count, 2);
    }

    #[tokio::test]
    async fn exhausted_budget_leaves_work_queued() {
        let (ctx, _dir) = test_context().await;
        let id = upload(&ctx, jpeg_bytes(64, 48)).await;

        let stats = worker(&ctx)
            .run_batch(&ctx.config.queue_name, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(stats, BatchStats::default());

        assert_eq!(photo(&ctx, id).await.status, PhotoStatus::Pending);
        let metrics = ctx.queue.metrics(&ctx.config.queue_name).await.unwrap();
        assert_eq!((metrics.total, metrics.visible), (1, 1));
    }

    #[tokio::test]
    async fn unusable_messages_are_skipped_and_removed() {
        let (ctx, _dir) = test_context().await;
        let q = &ctx.config.queue_name;
        ctx.queue
            .enqueue(q, &serde_json::json!({ "not": "a photo" }))
            .await
            .unwrap();
        ctx.queue
            .enqueue(q, &ProcessPhoto { photo_id: Uuid::new_v4() })
            .await
            .unwrap();

        let stats = worker(&ctx).run_batch(q, BUDGET).await.unwrap();
        assert_eq!(stats.skipped, 2);
        assert_eq!(stats.processed, 2);
        assert_eq!(queue_total(&ctx).await, 0);
    }

    #[tokio::test]
    async fn requeue_failed_gives_a_fresh_attempt_budget() {
        let (ctx, _dir) = test_context().await;
        let id = upload(&ctx, corrupt_jpeg()).await;
        let worker = BatchWorker::new(
            ctx.clone(),
            WorkerSettings {
                fail_fast_on_decode: true,
                ..ctx.config.worker_settings()
            },
        );
        worker.run_batch(&ctx.config.queue_name, BUDGET).await.unwrap();

        let requeued = requeue_failed(&ctx, id).await.unwrap().unwrap();
        assert_eq!(requeued.status, PhotoStatus::Pending);
        assert_eq!(requeued.attempts, 0);
        assert_eq!(queue_total(&ctx).await, 1);

        assert!(requeue_failed(&ctx, id).await.unwrap().is_none());
        assert!(requeue_failed(&ctx, Uuid::new_v4()).await.unwrap().is_none());
    }
}
