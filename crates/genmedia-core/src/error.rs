//! The single error type returned by every core operation.
//!
//! Each variant is one class of the closed taxonomy in
//! [`genmedia_types::ErrorKind`]. Provider and network variants carry an
//! [`ErrorContext`] so the caller sees the job handle, elapsed time and raw
//! provider payload alongside the message.

use std::time::Duration;

use genmedia_types::{ErrorKind, ErrorRecord, RequestError};
use thiserror::Error;

/// Diagnostic context attached to provider and network failures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub job_handle: Option<String>,
    pub elapsed: Option<Duration>,
    pub http_status: Option<u16>,
    pub raw: Option<String>,
}

impl ErrorContext {
    pub fn with_raw(raw: impl Into<String>) -> Self {
        Self {
            raw: Some(raw.into()),
            ..Self::default()
        }
    }

    pub fn with_status(http_status: u16) -> Self {
        Self {
            http_status: Some(http_status),
            ..Self::default()
        }
    }
}

/// All errors that can occur while fulfilling a derived-media request.
#[derive(Debug, Clone, Error)]
pub enum MediaError {
    /// Missing or malformed request field.
    #[error("invalid request: {message}")]
    Validation { message: String },

    /// The dedup lock was not obtained and the policy is fail-closed.
    #[error("dedup lock unavailable for key {key}: {message}")]
    LockUnavailable { key: String, message: String },

    #[error("provider rejected the request as invalid: {message}")]
    InvalidInput {
        message: String,
        context: ErrorContext,
    },

    #[error("provider quota exceeded: {message}")]
    QuotaExceeded {
        message: String,
        context: ErrorContext,
    },

    #[error("generation was blocked by safety filters: {message}")]
    SafetyBlocked {
        reasons: Vec<String>,
        message: String,
        context: ErrorContext,
    },

    /// Provider-side fault. The failed job cannot be resumed, only resubmitted.
    #[error("provider internal error: {message}")]
    Internal {
        message: String,
        context: ErrorContext,
    },

    #[error("timed out: {message}")]
    Timeout {
        message: String,
        context: ErrorContext,
    },

    #[error("cancelled by caller")]
    Cancelled { context: ErrorContext },

    #[error("download failed: {message}")]
    DownloadFailure {
        message: String,
        context: ErrorContext,
    },

    #[error("artifact storage failed: {message}")]
    StorageFailure { message: String },

    /// Unrecognised provider response shape or status.
    #[error("unrecognised provider response: {message}")]
    Unknown {
        message: String,
        context: ErrorContext,
    },
}

impl MediaError {
    pub fn validation(message: impl Into<String>) -> Self {
        MediaError::Validation {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        MediaError::StorageFailure {
            message: message.into(),
        }
    }

    pub fn download(message: impl Into<String>, context: ErrorContext) -> Self {
        MediaError::DownloadFailure {
            message: message.into(),
            context,
        }
    }

    pub fn cancelled() -> Self {
        MediaError::Cancelled {
            context: ErrorContext::default(),
        }
    }

    pub fn unknown(message: impl Into<String>, raw: impl Into<String>) -> Self {
        MediaError::Unknown {
            message: message.into(),
            context: ErrorContext::with_raw(raw),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            MediaError::Validation { .. } => ErrorKind::Validation,
            MediaError::LockUnavailable { .. } => ErrorKind::LockUnavailable,
            MediaError::InvalidInput { .. } => ErrorKind::InvalidInput,
            MediaError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            MediaError::SafetyBlocked { .. } => ErrorKind::SafetyBlocked,
            MediaError::Internal { .. } => ErrorKind::Internal,
            MediaError::Timeout { .. } => ErrorKind::Timeout,
            MediaError::Cancelled { .. } => ErrorKind::Cancelled,
            MediaError::DownloadFailure { .. } => ErrorKind::DownloadFailure,
            MediaError::StorageFailure { .. } => ErrorKind::StorageFailure,
            MediaError::Unknown { .. } => ErrorKind::Unknown,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            MediaError::InvalidInput { context, .. }
            | MediaError::QuotaExceeded { context, .. }
            | MediaError::SafetyBlocked { context, .. }
            | MediaError::Internal { context, .. }
            | MediaError::Timeout { context, .. }
            | MediaError::Cancelled { context }
            | MediaError::DownloadFailure { context, .. }
            | MediaError::Unknown { context, .. } => Some(context),
            MediaError::Validation { .. }
            | MediaError::LockUnavailable { .. }
            | MediaError::StorageFailure { .. } => None,
        }
    }

    fn context_mut(&mut self) -> Option<&mut ErrorContext> {
        match self {
            MediaError::InvalidInput { context, .. }
            | MediaError::QuotaExceeded { context, .. }
            | MediaError::SafetyBlocked { context, .. }
            | MediaError::Internal { context, .. }
            | MediaError::Timeout { context, .. }
            | MediaError::Cancelled { context }
            | MediaError::DownloadFailure { context, .. }
            | MediaError::Unknown { context, .. } => Some(context),
            MediaError::Validation { .. }
            | MediaError::LockUnavailable { .. }
            | MediaError::StorageFailure { .. } => None,
        }
    }

    /// Attach the job handle unless one is already recorded.
    pub fn with_job(mut self, job_handle: &str) -> Self {
        if let Some(ctx) = self.context_mut() {
            ctx.job_handle.get_or_insert_with(|| job_handle.to_owned());
        }
        self
    }

    /// Attach the elapsed time unless one is already recorded.
    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        if let Some(ctx) = self.context_mut() {
            ctx.elapsed.get_or_insert(elapsed);
        }
        self
    }

    /// Project onto the serialisable record returned to callers.
    pub fn record(&self) -> ErrorRecord {
        let context = self.context().cloned().unwrap_or_default();
        ErrorRecord {
            kind: self.kind(),
            message: self.to_string(),
            retryable: self.is_retryable(),
            job_handle: context.job_handle,
            elapsed_ms: context.elapsed.map(|d| d.as_millis() as u64),
            http_status: context.http_status,
            raw: context.raw,
        }
    }
}

impl From<RequestError> for MediaError {
    fn from(e: RequestError) -> Self {
        MediaError::validation(e.to_string())
    }
}

impl From<MediaError> for ErrorRecord {
    fn from(e: MediaError) -> Self {
        e.record()
    }
}

/// Map a transport-level reqwest failure (no response at all).
pub(crate) fn from_transport(err: &reqwest::Error, what: &str) -> MediaError {
    if err.is_timeout() {
        MediaError::Timeout {
            message: format!("{what} timed out: {err}"),
            context: ErrorContext::default(),
        }
    } else {
        MediaError::Internal {
            message: format!("{what} failed: {err}"),
            context: ErrorContext::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_carries_context() {
        let err = MediaError::Internal {
            message: "backend exploded".into(),
            context: ErrorContext::with_raw("{\"error\":{}}"),
        }
        .with_job("operations/abc")
        .with_elapsed(Duration::from_millis(1500));

        let record = err.record();
        assert_eq!(record.kind, ErrorKind::Internal);
        assert!(record.retryable);
        assert_eq!(record.job_handle.as_deref(), Some("operations/abc"));
        assert_eq!(record.elapsed_ms, Some(1500));
        assert_eq!(record.raw.as_deref(), Some("{\"error\":{}}"));
        assert!(record.message.contains("backend exploded"));
    }

    #[test]
    fn with_job_keeps_first_handle() {
        let err = MediaError::Timeout {
            message: "slow".into(),
            context: ErrorContext::default(),
        }
        .with_job("operations/first")
        .with_job("operations/second");
        assert_eq!(
            err.context().and_then(|c| c.job_handle.as_deref()),
            Some("operations/first")
        );
    }

    #[test]
    fn request_errors_become_validation() {
        let err: MediaError = RequestError::Unauthorized.into();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!err.is_retryable());
    }
}
