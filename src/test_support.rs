//! Shared fixtures for unit and router tests.

use crate::{
    config::AppConfig,
    context::PipelineContext,
    db,
    models::object::Object,
    services::object_store::{LocalObjectStore, ObjectStore, StorageError, StorageResult},
};
use async_trait::async_trait;
use bytes::Bytes;
use image::{ImageFormat, Rgb, RgbImage, Rgba, RgbaImage, codecs::jpeg::JpegEncoder};
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use std::{
    collections::HashMap,
    io::Cursor,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tempfile::TempDir;
use tokio::fs::File;

pub const TRIGGER_SECRET: &str = "test-trigger-secret";

/// In-memory database with the schema applied. A single connection that
/// never recycles, so every handle sees the same database.
pub async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

/// A gradient photo encoded as JPEG.
pub fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([
            (x * 255 / width.max(1)) as u8,
            (y * 255 / height.max(1)) as u8,
            ((x ^ y) & 0xff) as u8,
        ])
    });
    let mut buf = Vec::new();
    img.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, 90))
        .unwrap();
    buf
}

/// A half-transparent PNG.
pub fn png_rgba_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_fn(width, height, |x, y| {
        Rgba([(x % 256) as u8, (y % 256) as u8, 200, 128])
    });
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

pub fn test_config(dir: &TempDir) -> AppConfig {
    AppConfig {
        storage_dir: dir.path().join("objects").display().to_string(),
        database_url: "sqlite::memory:".into(),
        trigger_secret: Some(TRIGGER_SECRET.into()),
        retry_backoff_base_secs: 0,
        ..AppConfig::default()
    }
}

/// Context over an in-memory database and a temporary object directory.
pub async fn test_context() -> (PipelineContext, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let db = memory_pool().await;
    let store = Arc::new(LocalObjectStore::new(db.clone(), &config.storage_dir));
    let ctx = PipelineContext::from_parts(config, db, store).unwrap();
    (ctx, dir)
}

/// Same as `test_context`, with the store wrapped by `wrap`.
pub async fn test_context_with<S, F>(wrap: F) -> (PipelineContext, Arc<S>, TempDir)
where
    S: ObjectStore + 'static,
    F: FnOnce(LocalObjectStore) -> S,
{
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let db = memory_pool().await;
    let store = Arc::new(wrap(LocalObjectStore::new(db.clone(), &config.storage_dir)));
    let ctx = PipelineContext::from_parts(config, db, store.clone()).unwrap();
    (ctx, store, dir)
}

/// Behaves like the inner store until armed, then fails that many puts.
pub struct FaultyStore {
    inner: LocalObjectStore,
    remaining: AtomicUsize,
}

impl FaultyStore {
    pub fn new(inner: LocalObjectStore) -> Self {
        Self {
            inner,
            remaining: AtomicUsize::new(0),
        }
    }

    pub fn fail_next_puts(&self, count: usize) {
        self.remaining.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStore for FaultyStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> StorageResult<String> {
        let failing = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StorageError::Unavailable("injected put failure".into()));
        }
        self.inner.put_object(bucket, key, bytes, content_type).await
    }

    async fn get_object(&self, url: &str) -> StorageResult<Bytes> {
        self.inner.get_object(url).await
    }

    async fn open_object(&self, url: &str) -> StorageResult<(Object, File)> {
        self.inner.open_object(url).await
    }
}

/// Counts reads per url, optionally making each read slow.
pub struct CountingStore {
    inner: LocalObjectStore,
    reads: Mutex<HashMap<String, usize>>,
    read_delay: Duration,
}

impl CountingStore {
    pub fn new(inner: LocalObjectStore) -> Self {
        Self::with_read_delay(inner, Duration::ZERO)
    }

    pub fn with_read_delay(inner: LocalObjectStore, read_delay: Duration) -> Self {
        Self {
            inner,
            reads: Mutex::new(HashMap::new()),
            read_delay,
        }
    }

    pub fn reads(&self) -> HashMap<String, usize> {
        self.reads.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStore for CountingStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> StorageResult<String> {
        self.inner.put_object(bucket, key, bytes, content_type).await
    }

    async fn get_object(&self, url: &str) -> StorageResult<Bytes> {
        *self.reads.lock().unwrap().entry(url.to_string()).or_default() += 1;
        tokio::time::sleep(self.read_delay).await;
        self.inner.get_object(url).await
    }

    async fn open_object(&self, url: &str) -> StorageResult<(Object, File)> {
        self.inner.open_object(url).await
    }
}
