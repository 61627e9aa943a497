//! src/services/object_store.rs
//!
//! Object storage for originals and derivatives. `LocalObjectStore` keeps
//! payloads on disk sharded beneath `base_path/{bucket}/{shard}/{shard}/{key}`
//! and object metadata in SQLite.

use crate::models::object::Object;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use md5::Context;
use sqlx::SqlitePool;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error("invalid object url `{0}`")]
    InvalidUrl(String),
    #[error("object store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Object store contract used by intake, the batch worker and the media route.
///
/// Writing the same key twice overwrites it, so callers may redo writes.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `bucket/key` and return the object's url.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> StorageResult<String>;

    /// Read a whole object back by url.
    async fn get_object(&self, url: &str) -> StorageResult<Bytes>;

    /// Open an object for streaming, returning its metadata and file handle.
    async fn open_object(&self, url: &str) -> StorageResult<(Object, File)>;
}

/// Split `"{bucket}/{key}"` into its parts.
pub fn parse_url(url: &str) -> StorageResult<(&str, &str)> {
    url.split_once('/')
        .filter(|(bucket, key)| !bucket.is_empty() && !key.is_empty())
        .ok_or_else(|| StorageError::InvalidUrl(url.to_string()))
}

pub fn object_url(bucket: &str, key: &str) -> String {
    format!("{}/{}", bucket, key)
}

/// Disk + SQLite backed object store.
#[derive(Clone)]
pub struct LocalObjectStore {
    /// Shared SQLite connection pool used for metadata operations.
    db: SqlitePool,

    /// Base directory on disk where object payloads are stored.
    base_path: PathBuf,
}

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;

impl LocalObjectStore {
    pub fn new(db: SqlitePool, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
        }
    }

    /// Rejects keys that are empty, too long, absolute, contain `..`, or
    /// carry control characters.
    fn ensure_key_safe(key: &str) -> StorageResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(StorageError::InvalidObjectKey);
        }
        if key.starts_with('/') || key.contains("..") {
            return Err(StorageError::InvalidObjectKey);
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(StorageError::InvalidObjectKey);
        }
        Ok(())
    }

    /// S3-like bucket naming: 3-63 chars of lowercase letters, digits, dots
    /// and hyphens, starting and ending alphanumeric, no `..`.
    fn ensure_bucket_name_safe(name: &str) -> StorageResult<()> {
        let invalid = |reason: &str| StorageError::InvalidBucketName {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        let len = name.len();
        if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
            return Err(invalid("must be between 3 and 63 characters"));
        }
        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
        {
            return Err(invalid(
                "allowed characters are lowercase letters, digits, dots, and hyphens",
            ));
        }
        if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
            return Err(invalid("must start and end with a lowercase letter or digit"));
        }
        if name.contains("..") || name.contains("-.") || name.contains(".-") {
            return Err(invalid(
                "cannot contain consecutive dots or dot-hyphen combinations",
            ));
        }
        Ok(())
    }

    async fn root_present(&self) -> bool {
        fs::metadata(&self.base_path)
            .await
            .is_ok_and(|meta| meta.is_dir())
    }

    fn bucket_root(&self, bucket: &str) -> PathBuf {
        self.base_path.join(bucket)
    }

    /// Two-level shard directories from MD5(bucket/key).
    fn object_shards(bucket: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(bucket, key);
        let mut path = self.bucket_root(bucket);
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    async fn fetch_object(&self, bucket: &str, key: &str) -> StorageResult<Object> {
        sqlx::query_as::<_, Object>(
            "SELECT id, bucket, key, content_type, size_bytes, etag, last_modified
             FROM objects WHERE bucket = ? AND key = ?",
        )
        .bind(bucket)
        .bind(key)
        .fetch_one(&self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
            other => StorageError::Sqlx(other),
        })
    }

    /// Write the payload to a temp file, fsync, then rename into place.
    async fn write_payload(&self, file_path: &Path, bytes: &[u8]) -> StorageResult<()> {
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let written = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }

        if let Err(err) = fs::rename(&tmp_path, file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(file_path).await?;
                fs::rename(&tmp_path, file_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    /// Upserts the metadata row after the payload is durable on disk, so a
    /// metadata row never points at a missing file.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> StorageResult<String> {
        Self::ensure_bucket_name_safe(bucket)?;
        Self::ensure_key_safe(key)?;

        let file_path = self.object_path(bucket, key);
        self.write_payload(&file_path, &bytes).await?;

        let mut digest = Context::new();
        digest.consume(&bytes);
        let etag = format!("{:x}", digest.compute());

        sqlx::query(
            r#"
            INSERT INTO objects (id, bucket, key, content_type, size_bytes, etag, last_modified)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(bucket, key) DO UPDATE SET
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                last_modified = excluded.last_modified
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(bucket)
        .bind(key)
        .bind(content_type)
        .bind(bytes.len() as i64)
        .bind(&etag)
        .bind(Utc::now())
        .execute(&self.db)
        .await?;

        debug!("stored {} bytes at {}/{}", bytes.len(), bucket, key);
        Ok(object_url(bucket, key))
    }

    async fn get_object(&self, url: &str) -> StorageResult<Bytes> {
        let (bucket, key) = parse_url(url)?;
        let (_, file) = self.open_object(url).await?;
        let bytes = read_all(file).await.map_err(|err| not_found_or_io(err, bucket, key))?;
        Ok(Bytes::from(bytes))
    }

    /// Returns ObjectNotFound if metadata exists but the physical file is
    /// missing, and Unavailable if the whole storage directory is gone.
    async fn open_object(&self, url: &str) -> StorageResult<(Object, File)> {
        let (bucket, key) = parse_url(url)?;
        Self::ensure_bucket_name_safe(bucket)?;
        Self::ensure_key_safe(key)?;
        let object = self.fetch_object(bucket, key).await?;

        let file_path = self.object_path(bucket, key);
        let file = match File::open(&file_path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound && !self.root_present().await => {
                return Err(StorageError::Unavailable(format!(
                    "storage directory {} is missing",
                    self.base_path.display()
                )));
            }
            Err(err) => return Err(not_found_or_io(err, bucket, key)),
        };

        Ok((object, file))
    }
}

async fn read_all(mut file: File) -> io::Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;
    Ok(buf)
}

fn not_found_or_io(err: io::Error, bucket: &str, key: &str) -> StorageError {
    if err.kind() == ErrorKind::NotFound {
        StorageError::ObjectNotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    } else {
        StorageError::Io(err)
    }
}
