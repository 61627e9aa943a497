//! Handles shared by the HTTP layer, the upload intake and the batch worker.

use crate::{
    config::AppConfig,
    db,
    services::{
        object_store::{LocalObjectStore, ObjectStore},
        photo_repository::PhotoRepository,
        queue::ProcessingQueue,
        transform::TransformEngine,
    },
};
use anyhow::Result;
use sqlx::SqlitePool;
use std::sync::Arc;

/// Everything one invocation needs, constructed once and passed explicitly.
#[derive(Clone)]
pub struct PipelineContext {
    pub config: Arc<AppConfig>,
    pub db: SqlitePool,
    pub store: Arc<dyn ObjectStore>,
    pub queue: ProcessingQueue,
    pub photos: PhotoRepository,
    pub engine: Arc<TransformEngine>,
}

impl PipelineContext {
    /// Connect to SQLite and build the local object store from `config`.
    pub async fn open(config: AppConfig) -> Result<Self> {
        let db = db::connect(&config.database_url).await?;
        let store = Arc::new(LocalObjectStore::new(db.clone(), &config.storage_dir));
        Self::from_parts(config, db, store)
    }

    /// Assemble a context around an existing pool and store.
    pub fn from_parts(
        config: AppConfig,
        db: SqlitePool,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self> {
        let engine = Arc::new(TransformEngine::new(config.transform_spec()?));
        Ok(Self {
            queue: ProcessingQueue::new(db.clone()),
            photos: PhotoRepository::new(db.clone()),
            config: Arc::new(config),
            db,
            store,
            engine,
        })
    }

    pub async fn close(&self) {
        self.db.close().await;
        tracing::info!("pipeline context closed");
    }
}
