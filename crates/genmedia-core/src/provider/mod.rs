//! External generation provider: job submission and status checks.
//!
//! [`GenerationProvider`] is the seam between the core and a concrete
//! provider API. [`GeminiProvider`] speaks the Gemini/Veo REST dialect;
//! tests substitute their own implementations.

mod gemini;
pub mod response;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use genmedia_types::{GenerationRequest, MediaKind, ShapeValue, shape};
use serde_json::{Map, Value};
use tracing::info;

use crate::error::MediaError;
use crate::source::{SourceImage, SourceLoader};

pub use gemini::GeminiProvider;
pub(crate) use gemini::API_KEY_HEADER;

/// Opaque identifier of an in-progress provider operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle(String);

impl JobHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a completed job's artifact lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactRef {
    /// Base64-encoded bytes carried in the response itself.
    Inline {
        encoded: String,
        mime_type: Option<String>,
    },
    /// A URI to download, possibly through redirects.
    Remote {
        uri: String,
        mime_type: Option<String>,
    },
}

impl ArtifactRef {
    pub fn mime_type(&self) -> Option<&str> {
        match self {
            ArtifactRef::Inline { mime_type, .. } | ArtifactRef::Remote { mime_type, .. } => {
                mime_type.as_deref()
            }
        }
    }
}

/// Outcome of a successful submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// The provider accepted a long-running job.
    Pending(JobHandle),
    /// The provider answered synchronously.
    Completed(ArtifactRef),
}

/// One status check of a job.
///
/// `Failed` and `Blocked` carry the raw provider payload; the poller hands
/// it to the classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Running,
    Completed(ArtifactRef),
    Failed { raw: String },
    /// Provider-side safety/policy rejection.
    Blocked { raw: String },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Running)
    }
}

/// Provider-ready form of a request.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub kind: MediaKind,
    /// Final instruction text, after the silent-video suffix.
    pub prompt: String,
    pub sources: Vec<SourceImage>,
    /// Shape parameters in provider (camelCase) naming.
    pub parameters: Map<String, Value>,
}

impl JobRequest {
    pub fn aspect_ratio(&self) -> Option<&str> {
        self.parameters.get("aspectRatio").and_then(Value::as_str)
    }
}

#[async_trait]
pub trait GenerationProvider: Send + Sync {
    async fn submit(&self, job: &JobRequest) -> Result<Submission, MediaError>;

    async fn status(&self, handle: &JobHandle) -> Result<JobState, MediaError>;
}

// ── submitter ────────────────────────────────────────────────────────────────

/// Turns a validated request into a provider job.
pub struct JobSubmitter {
    provider: Arc<dyn GenerationProvider>,
    sources: SourceLoader,
}

impl JobSubmitter {
    pub fn new(provider: Arc<dyn GenerationProvider>, sources: SourceLoader) -> Self {
        Self { provider, sources }
    }

    pub fn provider(&self) -> &Arc<dyn GenerationProvider> {
        &self.provider
    }

    pub async fn submit(&self, request: &GenerationRequest) -> Result<Submission, MediaError> {
        let job = self.prepare(request).await?;
        let submission = self.provider.submit(&job).await?;
        match &submission {
            Submission::Pending(handle) => {
                info!(job = %handle, kind = %job.kind, "generation job submitted");
            }
            Submission::Completed(_) => {
                info!(kind = %job.kind, "generation completed synchronously");
            }
        }
        Ok(submission)
    }

    /// Load sources and build the provider payload inputs.
    pub async fn prepare(&self, request: &GenerationRequest) -> Result<JobRequest, MediaError> {
        if request.kind == MediaKind::Resize {
            return Err(MediaError::validation(
                "resize requests are not provider jobs",
            ));
        }

        let mut sources = Vec::with_capacity(request.sources.len());
        for source in &request.sources {
            sources.push(self.sources.load(source).await?);
        }

        Ok(JobRequest {
            kind: request.kind,
            prompt: final_prompt(request),
            sources,
            parameters: provider_parameters(request),
        })
    }
}

/// Trimmed instruction, with `" silent video"` appended when requested.
pub fn final_prompt(request: &GenerationRequest) -> String {
    let base = request.instruction.as_deref().unwrap_or("").trim();
    if request.shape_bool(shape::SILENT) {
        format!("{base} silent video")
    } else {
        base.to_owned()
    }
}

/// Shape parameters renamed to the provider's camelCase. The silent flag is
/// folded into the prompt and not sent. Text goes out in the same canonical
/// form the cache key hashes, so two requests sharing a key share a payload.
fn provider_parameters(request: &GenerationRequest) -> Map<String, Value> {
    let mut parameters = Map::new();
    for (name, value) in &request.shape {
        if name == shape::SILENT {
            continue;
        }
        let json = match value {
            ShapeValue::Text(_) => value.as_text().map(Value::from),
            other => serde_json::to_value(other).ok(),
        };
        let Some(json) = json else {
            continue;
        };
        if json.is_null() {
            continue;
        }
        parameters.insert(camel_case(name), json);
    }
    parameters
}

fn camel_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = false;
    for c in name.chars() {
        if c == '_' || c == '-' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}
