use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Closed classification of every failure a caller can observe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// Missing or malformed request field; nothing was sent anywhere.
    Validation,
    /// The dedup lock could not be taken and the policy is fail-closed.
    LockUnavailable,
    /// The provider rejected the request as malformed.
    InvalidInput,
    /// Rate or quota limit at the provider.
    QuotaExceeded,
    /// Provider-side policy/safety rejection.
    SafetyBlocked,
    /// Provider-side fault; the job itself cannot be resumed.
    Internal,
    /// A wall-clock budget was exhausted.
    Timeout,
    /// The caller went away before the work finished.
    Cancelled,
    /// Non-success status, empty body or bad payload after redirects.
    DownloadFailure,
    /// The artifact store could not be written or read.
    StorageFailure,
    /// Unrecognised provider response; `raw` carries the payload.
    Unknown,
}

impl ErrorKind {
    /// Whether resubmitting the same request can succeed.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::LockUnavailable
                | ErrorKind::QuotaExceeded
                | ErrorKind::Internal
                | ErrorKind::Timeout
                | ErrorKind::DownloadFailure
                | ErrorKind::StorageFailure
        )
    }
}

/// Structured failure report handed back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}
