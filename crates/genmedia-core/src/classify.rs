//! Maps provider status codes and error bodies onto [`MediaError`].
//!
//! Consulted on submission failure and on terminal-failure job states. Both
//! HTTP-level codes (`{"error":{"code":429}}`) and operation-level gRPC codes
//! (`{"error":{"code":8}}`) are understood.

use serde_json::Value;

use crate::error::{ErrorContext, MediaError};

/// Raw payloads larger than this are truncated in error context.
const RAW_LIMIT: usize = 8 * 1024;

/// Classify a provider failure from its HTTP status (if any) and body.
pub fn classify(http_status: Option<u16>, body: &str) -> MediaError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let context = ErrorContext {
        http_status,
        raw: Some(truncate(body)),
        ..ErrorContext::default()
    };

    if let Some(value) = &parsed {
        if let Some(reasons) = safety_reasons(value) {
            return safety_blocked(reasons, context);
        }
        if let Some(error) = value.get("error") {
            return classify_error_object(error, http_status, context);
        }
    }

    match http_status {
        Some(status) => classify_http(status, format!("provider returned HTTP {status}"), context),
        None => MediaError::Unknown {
            message: "provider reported failure without a recognised error".to_owned(),
            context,
        },
    }
}

/// Classify a parsed `{ code, status, message }` error object.
pub fn classify_error_object(
    error: &Value,
    http_status: Option<u16>,
    context: ErrorContext,
) -> MediaError {
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .unwrap_or("no message")
        .to_owned();
    let status = error.get("status").and_then(Value::as_str).unwrap_or("");
    let code = error.get("code").and_then(Value::as_i64);

    match status {
        "INVALID_ARGUMENT" | "FAILED_PRECONDITION" | "OUT_OF_RANGE" | "NOT_FOUND"
        | "PERMISSION_DENIED" | "UNAUTHENTICATED" => {
            return MediaError::InvalidInput { message, context };
        }
        "RESOURCE_EXHAUSTED" => return MediaError::QuotaExceeded { message, context },
        "DEADLINE_EXCEEDED" => return MediaError::Timeout { message, context },
        "INTERNAL" | "UNAVAILABLE" | "UNKNOWN" | "ABORTED" | "DATA_LOSS" => {
            return MediaError::Internal { message, context };
        }
        _ => {}
    }

    match code {
        // Operation-level gRPC codes.
        Some(3 | 5 | 7 | 9 | 11 | 16) => MediaError::InvalidInput { message, context },
        Some(4) => MediaError::Timeout { message, context },
        Some(8) => MediaError::QuotaExceeded { message, context },
        Some(2 | 10 | 13 | 14 | 15) => MediaError::Internal { message, context },
        Some(c) if (100..600).contains(&c) => classify_http(c as u16, message, context),
        _ => match http_status {
            Some(s) => classify_http(s, message, context),
            None => MediaError::Unknown { message, context },
        },
    }
}

fn classify_http(status: u16, message: String, context: ErrorContext) -> MediaError {
    match status {
        408 | 504 => MediaError::Timeout { message, context },
        429 => MediaError::QuotaExceeded { message, context },
        400..=499 => MediaError::InvalidInput { message, context },
        500..=599 => MediaError::Internal { message, context },
        _ => MediaError::Unknown { message, context },
    }
}

// ── safety signals ───────────────────────────────────────────────────────────

const BLOCKING_FINISH_REASONS: &[&str] = &[
    "SAFETY",
    "PROHIBITED_CONTENT",
    "IMAGE_SAFETY",
    "BLOCKLIST",
    "SPII",
];

/// Collect safety-filter reasons from a provider payload, if it reports any.
///
/// Looks at the payload root, under `response`, and under the video/image
/// response wrappers.
pub fn safety_reasons(value: &Value) -> Option<Vec<String>> {
    let response = value.get("response");
    let roots = [
        Some(value),
        response,
        response.and_then(|r| r.get("generateVideoResponse")),
        response.and_then(|r| r.get("generateImageResponse")),
        value.get("generateVideoResponse"),
    ];

    let mut reasons: Vec<String> = Vec::new();
    let mut flagged = false;
    for root in roots.into_iter().flatten() {
        if let Some(filtered) = root.get("raiMediaFilteredReasons") {
            flagged = true;
            match filtered {
                Value::Array(items) => reasons.extend(items.iter().map(value_text)),
                other => reasons.push(value_text(other)),
            }
        } else if root
            .get("raiMediaFilteredCount")
            .and_then(Value::as_u64)
            .is_some_and(|n| n > 0)
        {
            flagged = true;
        }

        if let Some(reason) = root
            .get("promptFeedback")
            .and_then(|f| f.get("blockReason"))
            .and_then(Value::as_str)
        {
            flagged = true;
            reasons.push(reason.to_owned());
        }

        if let Some(candidates) = root.get("candidates").and_then(Value::as_array) {
            for reason in candidates
                .iter()
                .filter_map(|c| c.get("finishReason").and_then(Value::as_str))
                .filter(|r| BLOCKING_FINISH_REASONS.contains(r))
            {
                flagged = true;
                reasons.push(reason.to_owned());
            }
        }
    }

    if !flagged {
        return None;
    }
    reasons.retain(|r| !r.is_empty());
    reasons.dedup();
    Some(reasons)
}

/// Build the actionable safety-block error.
pub fn safety_blocked(reasons: Vec<String>, context: ErrorContext) -> MediaError {
    let listed = if reasons.is_empty() {
        "unspecified".to_owned()
    } else {
        reasons.join(", ")
    };
    let message = format!(
        "reason(s): {listed}. Suggestions: 1) simplify the instruction (remove brand names, \
         celebrities or copyrighted content); 2) if audio is the issue, retry with the silent \
         flag; 3) check that the source image has no restricted content. This attempt was not \
         charged."
    );
    MediaError::SafetyBlocked {
        reasons,
        message,
        context,
    }
}

fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn truncate(raw: &str) -> String {
    if raw.len() <= RAW_LIMIT {
        return raw.to_owned();
    }
    let mut end = RAW_LIMIT;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…[truncated {} bytes]", &raw[..end], raw.len() - end)
}
