use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;

/// Well-known output-shape parameter names.
///
/// Names are matched after trimming and ASCII-lowercasing, so callers may
/// pass `Width` or ` width` and still hit these.
pub mod shape {
    pub const ASPECT_RATIO: &str = "aspect_ratio";
    pub const SILENT: &str = "silent";
    pub const WIDTH: &str = "width";
    pub const HEIGHT: &str = "height";
    pub const FORMAT: &str = "format";
    pub const QUALITY: &str = "quality";
    pub const FIT: &str = "fit";
}

/// What kind of derived artifact a request asks for.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MediaKind {
    /// Image-to-video generation through a long-running provider job.
    Video,
    /// Image-to-image generation; the provider usually answers synchronously.
    Image,
    /// Local pixel transform of a single source image.
    Resize,
}

/// Where a source image lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "location", rename_all = "snake_case")]
pub enum SourceRef {
    Local(PathBuf),
    Remote(String),
}

impl SourceRef {
    /// Interpret `s` as a remote URL when it carries an `http`/`https`
    /// scheme, otherwise as a local path.
    pub fn parse(s: &str) -> Self {
        let trimmed = s.trim();
        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            SourceRef::Remote(trimmed.to_owned())
        } else {
            SourceRef::Local(PathBuf::from(trimmed))
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, SourceRef::Remote(_))
    }

    /// Canonical textual form used for cache-key derivation.
    pub fn canonical(&self) -> String {
        match self {
            SourceRef::Local(path) => format!("file:{}", path.to_string_lossy()),
            SourceRef::Remote(url) => format!("url:{url}"),
        }
    }
}

impl FromStr for SourceRef {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(SourceRef::parse(s))
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceRef::Local(path) => write!(f, "{}", path.display()),
            SourceRef::Remote(url) => f.write_str(url),
        }
    }
}

/// A single output-shape parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ShapeValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ShapeValue {
    /// Render the value in its one canonical textual form.
    ///
    /// Returns `None` for `Null` (absent values take no part in the key).
    /// Integral floats render like integers so `320` and `320.0` agree, and
    /// text is trimmed and lowercased since shape values are enum-like.
    pub fn canonical(&self) -> Option<String> {
        match self {
            ShapeValue::Null => None,
            ShapeValue::Bool(b) => Some(b.to_string()),
            ShapeValue::Int(i) => Some(i.to_string()),
            ShapeValue::Float(f) => Some(canonical_float(*f)),
            ShapeValue::Text(s) => Some(s.trim().to_lowercase()),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ShapeValue::Bool(b) => Some(*b),
            ShapeValue::Int(i) => Some(*i != 0),
            ShapeValue::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Some(true),
                "false" | "0" | "no" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ShapeValue::Int(i) => Some(*i),
            ShapeValue::Float(f) if f.is_finite() && f.fract() == 0.0 => Some(*f as i64),
            ShapeValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<String> {
        match self {
            ShapeValue::Null => None,
            other => other.canonical(),
        }
    }

    fn is_finite(&self) -> bool {
        !matches!(self, ShapeValue::Float(f) if !f.is_finite())
    }
}

fn canonical_float(f: f64) -> String {
    if f == 0.0 {
        // Folds -0.0 into 0.
        return "0".to_owned();
    }
    if f.fract() == 0.0 && f.abs() < 1e15 {
        return format!("{}", f as i64);
    }
    format!("{f}")
}

impl From<bool> for ShapeValue {
    fn from(v: bool) -> Self {
        ShapeValue::Bool(v)
    }
}

impl From<i64> for ShapeValue {
    fn from(v: i64) -> Self {
        ShapeValue::Int(v)
    }
}

impl From<i32> for ShapeValue {
    fn from(v: i32) -> Self {
        ShapeValue::Int(v.into())
    }
}

impl From<u32> for ShapeValue {
    fn from(v: u32) -> Self {
        ShapeValue::Int(v.into())
    }
}

impl From<f64> for ShapeValue {
    fn from(v: f64) -> Self {
        ShapeValue::Float(v)
    }
}

impl From<&str> for ShapeValue {
    fn from(v: &str) -> Self {
        ShapeValue::Text(v.to_owned())
    }
}

impl From<String> for ShapeValue {
    fn from(v: String) -> Self {
        ShapeValue::Text(v)
    }
}

impl<T: Into<ShapeValue>> From<Option<T>> for ShapeValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(ShapeValue::Null)
    }
}

/// Reasons a request is rejected before any I/O happens.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("request is not authorized")]
    Unauthorized,

    #[error("{kind} requests take {expected} source(s), got {actual}")]
    SourceCount {
        kind: MediaKind,
        expected: &'static str,
        actual: usize,
    },

    #[error("source reference is empty")]
    EmptySource,

    #[error("{kind} requests need a non-empty instruction")]
    MissingInstruction { kind: MediaKind },

    #[error("shape parameter '{name}' is invalid: {reason}")]
    InvalidShape { name: String, reason: String },
}

/// One inbound derived-media request, as delivered by the ingress layer.
///
/// `shape` is a `BTreeMap` so iteration is ordered by parameter name no
/// matter how the caller built it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub kind: MediaKind,
    pub sources: Vec<SourceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    #[serde(default)]
    pub shape: BTreeMap<String, ShapeValue>,
    /// Resolved by the ingress layer; trusted as-is.
    #[serde(default)]
    pub authorized: bool,
}

impl GenerationRequest {
    pub fn new(kind: MediaKind) -> Self {
        Self {
            kind,
            sources: Vec::new(),
            instruction: None,
            shape: BTreeMap::new(),
            authorized: false,
        }
    }

    pub fn video(source: impl Into<SourceRef>, instruction: impl Into<String>) -> Self {
        Self::new(MediaKind::Video)
            .with_source(source)
            .with_instruction(instruction)
    }

    pub fn image(source: impl Into<SourceRef>, instruction: impl Into<String>) -> Self {
        Self::new(MediaKind::Image)
            .with_source(source)
            .with_instruction(instruction)
    }

    pub fn resize(source: impl Into<SourceRef>) -> Self {
        Self::new(MediaKind::Resize).with_source(source)
    }

    pub fn with_source(mut self, source: impl Into<SourceRef>) -> Self {
        self.sources.push(source.into());
        self
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = Some(instruction.into());
        self
    }

    /// Set a shape parameter. The name is trimmed and ASCII-lowercased.
    pub fn with_shape(mut self, name: &str, value: impl Into<ShapeValue>) -> Self {
        self.shape.insert(normalize_name(name), value.into());
        self
    }

    pub fn authorized(mut self, authorized: bool) -> Self {
        self.authorized = authorized;
        self
    }

    /// Look up a shape parameter, treating `Null` as absent.
    pub fn shape_value(&self, name: &str) -> Option<&ShapeValue> {
        self.shape
            .get(&normalize_name(name))
            .filter(|v| !matches!(v, ShapeValue::Null))
    }

    pub fn shape_text(&self, name: &str) -> Option<String> {
        self.shape_value(name).and_then(ShapeValue::as_text)
    }

    pub fn shape_bool(&self, name: &str) -> bool {
        self.shape_value(name)
            .and_then(ShapeValue::as_bool)
            .unwrap_or(false)
    }

    pub fn shape_i64(&self, name: &str) -> Option<i64> {
        self.shape_value(name).and_then(ShapeValue::as_i64)
    }

    /// Fail-fast checks run before any cache lookup or network call.
    pub fn validate(&self) -> Result<(), RequestError> {
        if !self.authorized {
            return Err(RequestError::Unauthorized);
        }

        let (min, max, expected) = match self.kind {
            MediaKind::Video | MediaKind::Image => (1, 2, "1 or 2"),
            MediaKind::Resize => (1, 1, "exactly 1"),
        };
        if self.sources.len() < min || self.sources.len() > max {
            return Err(RequestError::SourceCount {
                kind: self.kind,
                expected,
                actual: self.sources.len(),
            });
        }
        for source in &self.sources {
            let empty = match source {
                SourceRef::Local(path) => path.as_os_str().is_empty(),
                SourceRef::Remote(url) => url.trim().is_empty(),
            };
            if empty {
                return Err(RequestError::EmptySource);
            }
        }

        for (name, value) in &self.shape {
            if !value.is_finite() {
                return Err(RequestError::InvalidShape {
                    name: name.clone(),
                    reason: "number must be finite".to_owned(),
                });
            }
        }

        match self.kind {
            MediaKind::Video | MediaKind::Image => {
                let has_instruction = self
                    .instruction
                    .as_deref()
                    .is_some_and(|s| !s.trim().is_empty());
                if !has_instruction {
                    return Err(RequestError::MissingInstruction { kind: self.kind });
                }
            }
            MediaKind::Resize => self.validate_resize_shape()?,
        }
        Ok(())
    }

    fn validate_resize_shape(&self) -> Result<(), RequestError> {
        let invalid = |name: &str, reason: &str| RequestError::InvalidShape {
            name: name.to_owned(),
            reason: reason.to_owned(),
        };

        let mut any_dimension = false;
        for name in [shape::WIDTH, shape::HEIGHT] {
            if let Some(value) = self.shape_value(name) {
                match value.as_i64() {
                    Some(v) if (1..=16_384).contains(&v) => any_dimension = true,
                    _ => return Err(invalid(name, "must be an integer between 1 and 16384")),
                }
            }
        }
        if !any_dimension {
            return Err(invalid(shape::WIDTH, "width or height is required"));
        }

        if let Some(format) = self.shape_text(shape::FORMAT) {
            if !matches!(format.as_str(), "jpeg" | "jpg" | "png") {
                return Err(invalid(shape::FORMAT, "must be jpeg or png"));
            }
        }
        if let Some(value) = self.shape_value(shape::QUALITY) {
            if !value.as_i64().is_some_and(|q| (1..=100).contains(&q)) {
                return Err(invalid(shape::QUALITY, "must be an integer between 1 and 100"));
            }
        }
        if let Some(fit) = self.shape_text(shape::FIT) {
            if !matches!(fit.as_str(), "contain" | "exact") {
                return Err(invalid(shape::FIT, "must be contain or exact"));
            }
        }
        Ok(())
    }
}

impl From<&str> for SourceRef {
    fn from(s: &str) -> Self {
        SourceRef::parse(s)
    }
}

impl From<String> for SourceRef {
    fn from(s: String) -> Self {
        SourceRef::parse(&s)
    }
}

impl From<PathBuf> for SourceRef {
    fn from(p: PathBuf) -> Self {
        SourceRef::Local(p)
    }
}

pub fn normalize_name(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}
