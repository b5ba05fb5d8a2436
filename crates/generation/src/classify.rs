//! Failure classification for backend errors
//!
//! Structured fields (transport failure, block reason, error-info reason,
//! backend status code, HTTP status) are checked first. Only when none of them
//! is conclusive does classification fall back to case-insensitive substring
//! matching on the error message. The message heuristic depends on backend
//! wording and is kept as a last resort.

use crate::{BackendError, FailureKind};

/// Message fragments that indicate quota or rate-limit exhaustion.
const QUOTA_PATTERNS: &[&str] = &["QUOTA", "RATE LIMIT", "RESOURCE_EXHAUSTED"];

/// Error-info reasons that mean the key itself is unusable.
const INVALID_KEY_REASONS: &[&str] = &[
    "API_KEY_INVALID",
    "API_KEY_EXPIRED",
    "API_KEY_SERVICE_BLOCKED",
    "API_KEY_HTTP_REFERRER_BLOCKED",
];

/// Error-info reasons that mean the key is over quota.
const QUOTA_REASONS: &[&str] = &["RATE_LIMIT_EXCEEDED", "RESOURCE_EXHAUSTED"];

/// Classify a backend error: structured fields first, message heuristic last.
pub fn classify(error: &BackendError) -> FailureKind {
    classify_structured(error).unwrap_or_else(|| classify_message(&error.message))
}

/// Classify using structured fields only. Returns `None` when nothing
/// conclusive is present.
pub fn classify_structured(error: &BackendError) -> Option<FailureKind> {
    if error.transport.is_some() {
        return Some(FailureKind::Unavailable);
    }
    if error.block_reason.is_some() {
        return Some(FailureKind::SafetyBlocked);
    }

    if let Some(reason) = error.reason.as_deref() {
        let reason = reason.to_ascii_uppercase();
        if INVALID_KEY_REASONS.contains(&reason.as_str()) {
            return Some(FailureKind::InvalidCredential);
        }
        if QUOTA_REASONS.contains(&reason.as_str()) {
            return Some(FailureKind::QuotaExceeded);
        }
    }

    if let Some(code) = error.code.as_deref() {
        match code.to_ascii_uppercase().as_str() {
            "RESOURCE_EXHAUSTED" => return Some(FailureKind::QuotaExceeded),
            "UNAUTHENTICATED" | "PERMISSION_DENIED" => {
                return Some(FailureKind::InvalidCredential);
            }
            "NOT_FOUND" if mentions_model(&error.message) => {
                return Some(FailureKind::ModelUnavailable);
            }
            "UNAVAILABLE" | "DEADLINE_EXCEEDED" | "INTERNAL" => {
                return Some(FailureKind::Unavailable);
            }
            _ => {}
        }
    }

    match error.status {
        Some(429) => Some(FailureKind::QuotaExceeded),
        Some(401 | 403) => Some(FailureKind::InvalidCredential),
        Some(404) if mentions_model(&error.message) => Some(FailureKind::ModelUnavailable),
        Some(408 | 500 | 502 | 503 | 504) => Some(FailureKind::Unavailable),
        _ => None,
    }
}

/// Last-resort classification from the error message text.
///
/// Order matters: quota is checked before the other patterns, matching how
/// backends phrase combined messages ("quota exceeded for API key ...").
pub fn classify_message(message: &str) -> FailureKind {
    let upper = message.to_uppercase();
    if QUOTA_PATTERNS.iter().any(|p| upper.contains(p)) {
        FailureKind::QuotaExceeded
    } else if upper.contains("SAFETY") {
        FailureKind::SafetyBlocked
    } else if upper.contains("API KEY") {
        FailureKind::InvalidCredential
    } else if upper.contains("404") && upper.contains("MODEL") {
        FailureKind::ModelUnavailable
    } else {
        FailureKind::Failed
    }
}

fn mentions_model(message: &str) -> bool {
    message.to_ascii_lowercase().contains("model")
}
