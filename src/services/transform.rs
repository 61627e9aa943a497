//! Image transform engine.
//!
//! Turns an original upload into a thumbnail, a watermarked preview and a
//! watermarked full-size image, all JPEG. No I/O happens here; the same
//! input bytes and spec always give the same output bytes.

use bytes::Bytes;
use image::{
    DynamicImage, GenericImageView, ImageError, ImageReader, Limits, Rgb, RgbImage, RgbaImage,
    codecs::jpeg::JpegEncoder, imageops::FilterType,
};
use std::{io::Cursor, sync::Arc};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("image format could not be determined")]
    UnknownFormat,
    #[error("image could not be decoded: {0}")]
    Decode(#[source] ImageError),
    #[error("image exceeds decode limits: {0}")]
    Limits(#[source] ImageError),
    #[error("derivative could not be encoded: {0}")]
    Encode(#[source] ImageError),
    #[error("watermark overlay could not be decoded: {0}")]
    Overlay(#[source] ImageError),
    #[error("transform task panicked: {0}")]
    Panicked(String),
}

impl TransformError {
    /// Failures caused by the input itself; retrying the same bytes cannot help.
    pub fn is_input_failure(&self) -> bool {
        matches!(
            self,
            TransformError::UnknownFormat | TransformError::Decode(_) | TransformError::Limits(_)
        )
    }
}

/// Tiled overlay composited onto preview and full-size derivatives.
#[derive(Clone, Debug)]
pub struct Watermark {
    /// 0.0 leaves the image untouched, 1.0 paints the mark opaque.
    pub opacity: f32,
    /// Tile image; `None` draws the built-in diagonal lattice.
    pub overlay: Option<RgbaImage>,
}

impl Watermark {
    pub fn pattern(opacity: f32) -> Self {
        Self {
            opacity: opacity.clamp(0.0, 1.0),
            overlay: None,
        }
    }

    pub fn from_overlay_bytes(bytes: &[u8], opacity: f32) -> Result<Self, TransformError> {
        let overlay = image::load_from_memory(bytes)
            .map_err(TransformError::Overlay)?
            .to_rgba8();
        Ok(Self {
            opacity: opacity.clamp(0.0, 1.0),
            overlay: Some(overlay),
        })
    }

    fn alpha(&self) -> u32 {
        (self.opacity * 255.0).round() as u32
    }

    /// Tile edge scales with the picture so the mark looks alike on every size.
    fn tile_size(width: u32, height: u32) -> u32 {
        (width.min(height) / 6).max(24)
    }

    pub fn apply(&self, img: &mut RgbImage) {
        let alpha = self.alpha();
        if alpha == 0 {
            return;
        }
        let tile = Self::tile_size(img.width(), img.height());
        match &self.overlay {
            None => apply_lattice(img, tile, alpha),
            Some(overlay) => apply_overlay(img, overlay, tile, alpha),
        }
    }
}

fn blend(base: u8, top: u8, alpha: u32) -> u8 {
    ((u32::from(base) * (255 - alpha) + u32::from(top) * alpha + 127) / 255) as u8
}

fn apply_lattice(img: &mut RgbImage, tile: u32, alpha: u32) {
    let stroke = (tile / 12).max(1);
    for (x, y, pixel) in img.enumerate_pixels_mut() {
        let rising = (x + y) % tile;
        let falling = (x + tile - y % tile) % tile;
        if rising < stroke || falling < stroke {
            for channel in pixel.0.iter_mut() {
                *channel = blend(*channel, 255, alpha);
            }
        }
    }
}

fn apply_overlay(img: &mut RgbImage, overlay: &RgbaImage, tile: u32, alpha: u32) {
    let (ow, oh) = overlay.dimensions();
    if ow == 0 || oh == 0 {
        return;
    }
    let tile_h = ((u64::from(tile) * u64::from(oh)) / u64::from(ow)).max(1) as u32;
    let scaled = image::imageops::resize(overlay, tile, tile_h, FilterType::Triangle);
    for (x, y, pixel) in img.enumerate_pixels_mut() {
        let mark = scaled.get_pixel(x % tile, y % tile_h);
        let a = u32::from(mark.0[3]) * alpha / 255;
        if a == 0 {
            continue;
        }
        for (channel, top) in pixel.0.iter_mut().zip(mark.0) {
            *channel = blend(*channel, top, a);
        }
    }
}

/// Target sizes, output quality and decode bounds.
#[derive(Clone, Debug)]
pub struct TransformSpec {
    pub thumbnail_max: u32,
    pub preview_max: u32,
    pub jpeg_quality: u8,
    pub watermark: Watermark,
    pub max_decode_dimension: u32,
    pub max_decode_alloc: u64,
}

impl Default for TransformSpec {
    fn default() -> Self {
        Self {
            thumbnail_max: 300,
            preview_max: 1500,
            jpeg_quality: 85,
            watermark: Watermark::pattern(0.35),
            max_decode_dimension: 12_000,
            max_decode_alloc: 512 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Derivatives {
    pub thumbnail: Bytes,
    pub preview: Bytes,
    pub watermarked: Bytes,
    /// Dimensions of the original.
    pub width: u32,
    pub height: u32,
}

pub struct TransformEngine {
    spec: TransformSpec,
}

/// Largest size that fits within `max` on both axes, keeping aspect ratio.
/// Never grows the image.
pub fn fit_within(width: u32, height: u32, max: u32) -> (u32, u32) {
    if width <= max && height <= max {
        return (width, height);
    }
    let long = u64::from(width.max(height));
    let scale = |d: u32| ((u64::from(d) * u64::from(max) + long / 2) / long).max(1) as u32;
    (scale(width), scale(height))
}

impl TransformEngine {
    pub fn new(spec: TransformSpec) -> Self {
        Self { spec }
    }

    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, TransformError> {
        let mut reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|_| TransformError::UnknownFormat)?;
        if reader.format().is_none() {
            return Err(TransformError::UnknownFormat);
        }

        let mut limits = Limits::default();
        limits.max_image_width = Some(self.spec.max_decode_dimension);
        limits.max_image_height = Some(self.spec.max_decode_dimension);
        limits.max_alloc = Some(self.spec.max_decode_alloc);
        reader.limits(limits);

        reader.decode().map_err(|err| match err {
            ImageError::Limits(_) => TransformError::Limits(err),
            other => TransformError::Decode(other),
        })
    }

    fn encode_jpeg(&self, img: &RgbImage) -> Result<Bytes, TransformError> {
        let mut buf = Vec::new();
        let encoder = JpegEncoder::new_with_quality(&mut buf, self.spec.jpeg_quality);
        img.write_with_encoder(encoder)
            .map_err(TransformError::Encode)?;
        Ok(Bytes::from(buf))
    }

    /// Run the full transform synchronously. CPU bound; call through
    /// `transform_blocking` from async code.
    pub fn transform(&self, original: &[u8]) -> Result<Derivatives, TransformError> {
        let img = self.decode(original)?;
        let (width, height) = img.dimensions();
        debug!(width, height, "decoded original");

        let full = flatten(&img);

        let (pw, ph) = fit_within(width, height, self.spec.preview_max);
        let preview_base = if (pw, ph) == (width, height) {
            full.clone()
        } else {
            image::imageops::resize(&full, pw, ph, FilterType::Lanczos3)
        };

        // Thumbnail comes from the already-shrunk preview when it can.
        let thumb_source = if self.spec.thumbnail_max <= self.spec.preview_max {
            &preview_base
        } else {
            &full
        };
        let (tw, th) = fit_within(
            thumb_source.width(),
            thumb_source.height(),
            self.spec.thumbnail_max,
        );
        let thumbnail = if (tw, th) == thumb_source.dimensions() {
            thumb_source.clone()
        } else {
            image::imageops::resize(thumb_source, tw, th, FilterType::Triangle)
        };

        let mut preview = preview_base;
        self.spec.watermark.apply(&mut preview);
        let mut watermarked = full;
        self.spec.watermark.apply(&mut watermarked);

        Ok(Derivatives {
            thumbnail: self.encode_jpeg(&thumbnail)?,
            preview: self.encode_jpeg(&preview)?,
            watermarked: self.encode_jpeg(&watermarked)?,
            width,
            height,
        })
    }

    /// Offload `transform` to the blocking thread pool.
    pub async fn transform_blocking(
        self: Arc<Self>,
        original: Bytes,
    ) -> Result<Derivatives, TransformError> {
        tokio::task::spawn_blocking(move || self.transform(&original))
            .await
            .map_err(|e| TransformError::Panicked(e.to_string()))?
    }
}

/// Drop alpha by compositing onto white; JPEG has no transparency.
fn flatten(img: &DynamicImage) -> RgbImage {
    if !img.color().has_alpha() {
        return img.to_rgb8();
    }
    let rgba = img.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let a = u32::from(a);
        Rgb([blend(255, r, a), blend(255, g, a), blend(255, b, a)])
    })
}
