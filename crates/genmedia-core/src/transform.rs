//! Local pixel transform behind resize requests.
//!
//! The orchestrator only knows the [`Transform`] seam: bytes plus shape
//! parameters in, artifact out. [`ImageResizer`] is the default
//! implementation on the `image` crate. Decoding and encoding are
//! CPU-bound, so they run on the blocking pool.

use std::collections::BTreeMap;
use std::io::Cursor;

use async_trait::async_trait;
use bytes::Bytes;
use genmedia_types::{Artifact, ShapeValue, mime, shape};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use tracing::debug;

use crate::error::{ErrorContext, MediaError};

#[async_trait]
pub trait Transform: Send + Sync {
    async fn apply(
        &self,
        source: Bytes,
        params: &BTreeMap<String, ShapeValue>,
    ) -> Result<Artifact, MediaError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Jpeg,
    Png,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fit {
    /// Scale to fit inside the box, keeping the aspect ratio.
    Contain,
    /// Stretch to exactly the requested box.
    Exact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ResizeSpec {
    width: Option<u32>,
    height: Option<u32>,
    format: Option<OutputFormat>,
    quality: u8,
    fit: Fit,
}

impl ResizeSpec {
    fn from_shape(params: &BTreeMap<String, ShapeValue>) -> Result<Self, MediaError> {
        let get = |name: &str| params.get(name).filter(|v| !matches!(v, ShapeValue::Null));
        let dimension = |name: &str| -> Result<Option<u32>, MediaError> {
            match get(name) {
                None => Ok(None),
                Some(v) => v
                    .as_i64()
                    .and_then(|n| u32::try_from(n).ok())
                    .filter(|n| (1..=16_384).contains(n))
                    .map(Some)
                    .ok_or_else(|| MediaError::validation(format!("{name} must be 1..=16384"))),
            }
        };

        let width = dimension(shape::WIDTH)?;
        let height = dimension(shape::HEIGHT)?;
        if width.is_none() && height.is_none() {
            return Err(MediaError::validation("resize needs a width or a height"));
        }

        let format = match get(shape::FORMAT).and_then(ShapeValue::as_text).as_deref() {
            None => None,
            Some("jpeg" | "jpg") => Some(OutputFormat::Jpeg),
            Some("png") => Some(OutputFormat::Png),
            Some(other) => {
                return Err(MediaError::validation(format!(
                    "unsupported output format {other}"
                )));
            }
        };
        let quality = match get(shape::QUALITY) {
            None => 85,
            Some(v) => v
                .as_i64()
                .and_then(|q| u8::try_from(q).ok())
                .filter(|q| (1..=100).contains(q))
                .ok_or_else(|| MediaError::validation("quality must be 1..=100"))?,
        };
        let fit = match get(shape::FIT).and_then(ShapeValue::as_text).as_deref() {
            None | Some("contain") => Fit::Contain,
            Some("exact") => Fit::Exact,
            Some(other) => return Err(MediaError::validation(format!("unsupported fit {other}"))),
        };

        Ok(Self {
            width,
            height,
            format,
            quality,
            fit,
        })
    }

    /// Target box; a missing side follows the source aspect ratio.
    fn target(&self, src_w: u32, src_h: u32) -> (u32, u32) {
        let scale = |num: u32, a: u32, b: u32| -> u32 {
            ((u64::from(num) * u64::from(a) + u64::from(b) / 2) / u64::from(b.max(1))).max(1) as u32
        };
        match (self.width, self.height) {
            (Some(w), Some(h)) => (w, h),
            (Some(w), None) => (w, scale(w, src_h, src_w)),
            (None, Some(h)) => (scale(h, src_w, src_h), h),
            (None, None) => (src_w, src_h),
        }
    }
}

/// Default [`Transform`]: decode, resize, re-encode as JPEG or PNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageResizer;

impl ImageResizer {
    pub fn new() -> Self {
        Self
    }

    fn run(source: &[u8], spec: ResizeSpec) -> Result<Artifact, MediaError> {
        let decoded = image::load_from_memory(source)
            .map_err(|e| MediaError::validation(format!("source is not a decodable image: {e}")))?;

        let (w, h) = spec.target(decoded.width(), decoded.height());
        let resized = match spec.fit {
            Fit::Contain => decoded.resize(w, h, FilterType::Lanczos3),
            Fit::Exact => decoded.resize_exact(w, h, FilterType::Lanczos3),
        };

        let format = spec.format.unwrap_or(match image::guess_format(source) {
            Ok(ImageFormat::Png) => OutputFormat::Png,
            _ => OutputFormat::Jpeg,
        });
        let bytes = encode(&resized, format, spec.quality)?;
        debug!(
            width = resized.width(),
            height = resized.height(),
            ?format,
            bytes = bytes.len(),
            "image resized"
        );

        let mime_type = match format {
            OutputFormat::Jpeg => mime::IMAGE_JPEG,
            OutputFormat::Png => mime::IMAGE_PNG,
        };
        Ok(Artifact::new(bytes, mime_type))
    }
}

fn encode(img: &DynamicImage, format: OutputFormat, quality: u8) -> Result<Vec<u8>, MediaError> {
    let mut out = Vec::new();
    let result = match format {
        OutputFormat::Jpeg => {
            let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality);
            encoder.encode_image(&img.to_rgb8())
        }
        OutputFormat::Png => img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png),
    };
    result.map_err(|e| MediaError::Internal {
        message: format!("failed to encode resized image: {e}"),
        context: ErrorContext::default(),
    })?;
    Ok(out)
}

#[async_trait]
impl Transform for ImageResizer {
    async fn apply(
        &self,
        source: Bytes,
        params: &BTreeMap<String, ShapeValue>,
    ) -> Result<Artifact, MediaError> {
        let spec = ResizeSpec::from_shape(params)?;
        tokio::task::spawn_blocking(move || Self::run(&source, spec))
            .await
            .map_err(|e| MediaError::Internal {
                message: format!("resize task failed: {e}"),
                context: ErrorContext::default(),
            })?
    }
}
