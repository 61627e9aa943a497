use crate::services::{
    intake::IntakeLimits,
    transform::{TransformSpec, Watermark},
    worker::WorkerSettings,
};
use anyhow::{Context, Result, bail, ensure};
use clap::Parser;
use std::{
    env,
    fmt::{self, Display},
    str::FromStr,
    time::Duration,
};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,

    pub originals_bucket: String,
    pub derivatives_bucket: String,

    pub queue_name: String,
    pub visibility_timeout_secs: u64,
    pub item_timeout_secs: u64,
    pub batch_size: usize,
    pub concurrency: usize,
    pub wall_clock_budget_secs: u64,
    pub retry_ceiling: u32,
    pub retry_backoff_base_secs: u64,
    pub retry_backoff_max_secs: u64,
    pub fail_fast_on_decode: bool,

    pub max_upload_bytes: usize,
    pub max_files_per_request: usize,
    pub accepted_content_types: Vec<String>,

    /// Shared secret the scheduler presents as a bearer token.
    pub trigger_secret: Option<String>,

    pub thumbnail_max: u32,
    pub preview_max: u32,
    pub jpeg_quality: u8,
    pub watermark_opacity: f32,
    /// Optional PNG tiled as the watermark instead of the built-in pattern.
    pub watermark_image: Option<String>,
    pub max_decode_dimension: u32,
    pub max_decode_alloc_bytes: u64,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("storage_dir", &self.storage_dir)
            .field("database_url", &self.database_url)
            .field("originals_bucket", &self.originals_bucket)
            .field("derivatives_bucket", &self.derivatives_bucket)
            .field("queue_name", &self.queue_name)
            .field("visibility_timeout_secs", &self.visibility_timeout_secs)
            .field("item_timeout_secs", &self.item_timeout_secs)
            .field("batch_size", &self.batch_size)
            .field("concurrency", &self.concurrency)
            .field("wall_clock_budget_secs", &self.wall_clock_budget_secs)
            .field("retry_ceiling", &self.retry_ceiling)
            .field("retry_backoff_base_secs", &self.retry_backoff_base_secs)
            .field("retry_backoff_max_secs", &self.retry_backoff_max_secs)
            .field("fail_fast_on_decode", &self.fail_fast_on_decode)
            .field("max_upload_bytes", &self.max_upload_bytes)
            .field("max_files_per_request", &self.max_files_per_request)
            .field("accepted_content_types", &self.accepted_content_types)
            .field(
                "trigger_secret",
                &self.trigger_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("thumbnail_max", &self.thumbnail_max)
            .field("preview_max", &self.preview_max)
            .field("jpeg_quality", &self.jpeg_quality)
            .field("watermark_opacity", &self.watermark_opacity)
            .field("watermark_image", &self.watermark_image)
            .field("max_decode_dimension", &self.max_decode_dimension)
            .field("max_decode_alloc_bytes", &self.max_decode_alloc_bytes)
            .finish()
    }
}

/// What the binary does after loading configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Serve,
    Migrate,
    RunBatch,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Class photo ingestion pipeline")]
pub struct Args {
    /// Host to bind to (overrides PHOTO_PIPELINE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides PHOTO_PIPELINE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where objects are stored (overrides PHOTO_PIPELINE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides PHOTO_PIPELINE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Wall-clock budget of one worker pass (overrides PHOTO_PIPELINE_WALL_CLOCK_BUDGET_SECS)
    #[arg(long)]
    pub budget_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long, conflicts_with = "run_batch")]
    pub migrate: bool,

    /// Run one batch worker pass, print its summary as JSON, and exit
    #[arg(long)]
    pub run_batch: bool,
}

impl Args {
    pub fn mode(&self) -> Mode {
        if self.migrate {
            Mode::Migrate
        } else if self.run_batch {
            Mode::RunBatch
        } else {
            Mode::Serve
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            storage_dir: "./data/objects".into(),
            database_url: "sqlite://./data/meta/photo_pipeline.db".into(),
            originals_bucket: "originals".into(),
            derivatives_bucket: "derivatives".into(),
            queue_name: "photo-processing".into(),
            visibility_timeout_secs: 300,
            item_timeout_secs: 120,
            batch_size: 10,
            concurrency: 4,
            wall_clock_budget_secs: 50,
            retry_ceiling: 5,
            retry_backoff_base_secs: 30,
            retry_backoff_max_secs: 900,
            fail_fast_on_decode: false,
            max_upload_bytes: 25 * 1024 * 1024,
            max_files_per_request: 20,
            accepted_content_types: vec![
                "image/jpeg".into(),
                "image/png".into(),
                "image/webp".into(),
            ],
            trigger_secret: None,
            thumbnail_max: 300,
            preview_max: 1500,
            jpeg_quality: 85,
            watermark_opacity: 0.35,
            watermark_image: None,
            max_decode_dimension: 12_000,
            max_decode_alloc_bytes: 512 * 1024 * 1024,
        }
    }
}

const PREFIX: &str = "PHOTO_PIPELINE_";
const STORAGE_IO_MARGIN_SECS: u64 = 30;

/// Parse `PHOTO_PIPELINE_{name}` if present, otherwise keep `default`.
fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    let var = format!("{PREFIX}{name}");
    match lookup(&var) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{}", err))
            .with_context(|| format!("parsing {} value `{}`", var, value)),
        None => Ok(default),
    }
}

fn string_var(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(&format!("{PREFIX}{name}")).filter(|v| !v.trim().is_empty())
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and run mode.
    pub fn from_env_and_args() -> Result<(Self, Mode)> {
        let args = Args::parse();
        let mode = args.mode();
        let cfg = Self::resolve(args, |name| env::var(name).ok())?;
        Ok((cfg, mode))
    }

    /// Merge CLI args over `lookup`ed environment over defaults, then validate.
    pub fn resolve(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let d = Self::default();

        let accepted_content_types = match string_var(&lookup, "ACCEPTED_CONTENT_TYPES") {
            Some(list) => list
                .split(',')
                .map(|s| s.trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            None => d.accepted_content_types,
        };

        let cfg = Self {
            host: args
                .host
                .or_else(|| string_var(&lookup, "HOST"))
                .unwrap_or(d.host),
            port: match args.port {
                Some(port) => port,
                None => parse_var(&lookup, "PORT", d.port)?,
            },
            storage_dir: args
                .storage_dir
                .or_else(|| string_var(&lookup, "STORAGE_DIR"))
                .unwrap_or(d.storage_dir),
            database_url: args
                .database_url
                .or_else(|| string_var(&lookup, "DATABASE_URL"))
                .unwrap_or(d.database_url),
            originals_bucket: string_var(&lookup, "ORIGINALS_BUCKET").unwrap_or(d.originals_bucket),
            derivatives_bucket: string_var(&lookup, "DERIVATIVES_BUCKET")
                .unwrap_or(d.derivatives_bucket),
            queue_name: string_var(&lookup, "QUEUE_NAME").unwrap_or(d.queue_name),
            visibility_timeout_secs: parse_var(
                &lookup,
                "VISIBILITY_TIMEOUT_SECS",
                d.visibility_timeout_secs,
            )?,
            item_timeout_secs: parse_var(&lookup, "ITEM_TIMEOUT_SECS", d.item_timeout_secs)?,
            batch_size: parse_var(&lookup, "BATCH_SIZE", d.batch_size)?.clamp(1, 100),
            concurrency: parse_var(&lookup, "CONCURRENCY", d.concurrency)?.clamp(1, 32),
            wall_clock_budget_secs: match args.budget_secs {
                Some(secs) => secs,
                None => parse_var(&lookup, "WALL_CLOCK_BUDGET_SECS", d.wall_clock_budget_secs)?,
            },
            retry_ceiling: parse_var(&lookup, "RETRY_CEILING", d.retry_ceiling)?,
            retry_backoff_base_secs: parse_var(
                &lookup,
                "RETRY_BACKOFF_BASE_SECS",
                d.retry_backoff_base_secs,
            )?,
            retry_backoff_max_secs: parse_var(
                &lookup,
                "RETRY_BACKOFF_MAX_SECS",
                d.retry_backoff_max_secs,
            )?,
            fail_fast_on_decode: parse_var(&lookup, "FAIL_FAST_ON_DECODE", d.fail_fast_on_decode)?,
            max_upload_bytes: parse_var(&lookup, "MAX_UPLOAD_BYTES", d.max_upload_bytes)?,
            max_files_per_request: parse_var(
                &lookup,
                "MAX_FILES_PER_REQUEST",
                d.max_files_per_request,
            )?,
            accepted_content_types,
            trigger_secret: string_var(&lookup, "TRIGGER_SECRET"),
            thumbnail_max: parse_var(&lookup, "THUMBNAIL_MAX", d.thumbnail_max)?,
            preview_max: parse_var(&lookup, "PREVIEW_MAX", d.preview_max)?,
            jpeg_quality: parse_var(&lookup, "JPEG_QUALITY", d.jpeg_quality)?,
            watermark_opacity: parse_var(&lookup, "WATERMARK_OPACITY", d.watermark_opacity)?,
            watermark_image: string_var(&lookup, "WATERMARK_IMAGE"),
            max_decode_dimension: parse_var(
                &lookup,
                "MAX_DECODE_DIMENSION",
                d.max_decode_dimension,
            )?,
            max_decode_alloc_bytes: parse_var(
                &lookup,
                "MAX_DECODE_ALLOC_BYTES",
                d.max_decode_alloc_bytes,
            )?,
        };

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the worker cannot run safely with.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.item_timeout_secs > 0,
            "item timeout must be at least one second"
        );
        // A claim must outlive the longest pass plus one overrunning item.
        let claim_needed = self
            .wall_clock_budget_secs
            .saturating_add(self.item_timeout_secs)
            .saturating_add(STORAGE_IO_MARGIN_SECS);
        ensure!(
            self.visibility_timeout_secs > claim_needed,
            "visibility timeout ({}s) must exceed the wall-clock budget ({}s) plus the \
             per-item timeout ({}s) plus {}s for storage I/O",
            self.visibility_timeout_secs,
            self.wall_clock_budget_secs,
            self.item_timeout_secs,
            STORAGE_IO_MARGIN_SECS
        );
        ensure!(self.retry_ceiling >= 1, "retry ceiling must be at least 1");
        ensure!(
            self.retry_backoff_max_secs >= self.retry_backoff_base_secs,
            "retry backoff max must not be below the base"
        );
        ensure!(
            self.thumbnail_max > 0 && self.preview_max > 0,
            "derivative sizes must be positive"
        );
        ensure!(
            (1..=100).contains(&self.jpeg_quality),
            "jpeg quality must be within 1..=100"
        );
        ensure!(
            (0.0..=1.0).contains(&self.watermark_opacity),
            "watermark opacity must be within 0.0..=1.0"
        );
        ensure!(self.max_upload_bytes > 0, "max upload size must be positive");
        if self.accepted_content_types.is_empty() {
            bail!("at least one accepted content type is required");
        }
        if self.originals_bucket == self.derivatives_bucket {
            bail!("originals and derivatives must live in different buckets");
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn wall_clock_budget(&self) -> Duration {
        Duration::from_secs(self.wall_clock_budget_secs)
    }

    /// Largest request body the upload route accepts.
    pub fn max_request_bytes(&self) -> usize {
        self.max_upload_bytes
            .saturating_mul(self.max_files_per_request.max(1))
            .saturating_add(1024 * 1024)
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            originals_bucket: self.originals_bucket.clone(),
            derivatives_bucket: self.derivatives_bucket.clone(),
            batch_size: self.batch_size,
            concurrency: self.concurrency,
            visibility_timeout: Duration::from_secs(self.visibility_timeout_secs),
            item_timeout: Duration::from_secs(self.item_timeout_secs),
            retry_ceiling: self.retry_ceiling,
            backoff_base: Duration::from_secs(self.retry_backoff_base_secs),
            backoff_max: Duration::from_secs(self.retry_backoff_max_secs),
            fail_fast_on_decode: self.fail_fast_on_decode,
        }
    }

    pub fn intake_limits(&self) -> IntakeLimits {
        IntakeLimits {
            max_upload_bytes: self.max_upload_bytes,
            max_files_per_request: self.max_files_per_request,
            accepted_content_types: self.accepted_content_types.clone(),
        }
    }

    /// Build the transform spec, reading the watermark overlay if one is set.
    pub fn transform_spec(&self) -> Result<TransformSpec> {
        let watermark = match &self.watermark_image {
            Some(path) => {
                let bytes = std::fs::read(path)
                    .with_context(|| format!("reading watermark image `{}`", path))?;
                Watermark::from_overlay_bytes(&bytes, self.watermark_opacity)
                    .with_context(|| format!("decoding watermark image `{}`", path))?
            }
            None => Watermark::pattern(self.watermark_opacity),
        };

        Ok(TransformSpec {
            thumbnail_max: self.thumbnail_max,
            preview_max: self.preview_max,
            jpeg_quality: self.jpeg_quality,
            watermark,
            max_decode_dimension: self.max_decode_dimension,
            max_decode_alloc: self.max_decode_alloc_bytes,
        })
    }
}
