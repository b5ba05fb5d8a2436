//! Ask endpoint
//!
//! Validates the inbound JSON body, runs the question through the failover
//! executor and maps the outcome to an HTTP response. Every response carries
//! the request id, and every request is counted and timed.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use key_pool::{ExecuteError, FailoverExecutor};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::metrics;
use crate::service::{InFlight, ServiceMetrics};

pub const NOT_JSON: &str = "Request must be JSON";
pub const PROMPT_REQUIRED: &str = "Prompt is required in the request body.";
pub const KEYS_EXHAUSTED: &str = "All API keys have exhausted their quotas. Please try again later.";

/// Shared state for the ask handler
#[derive(Clone)]
pub struct RelayState {
    pub executor: Arc<FailoverExecutor>,
    pub metrics: ServiceMetrics,
    /// Fired when the drain deadline expires
    pub cancel: CancellationToken,
}

#[derive(Debug, Deserialize)]
struct AskRequest {
    #[serde(default)]
    prompt: Option<serde_json::Value>,
}

/// JSON error response: {"error":{"type":"...","message":"...","request_id":"req_..."}}
fn error_response(status: StatusCode, kind: &str, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": kind,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|mime| {
            let mime = mime.trim().to_ascii_lowercase();
            mime == "application/json"
                || (mime.starts_with("application/") && mime.ends_with("+json"))
        })
        .unwrap_or(false)
}

/// HTTP status and customer-facing message for a terminal executor error.
fn error_status(err: &ExecuteError) -> (StatusCode, String) {
    match err {
        ExecuteError::InvalidInput => (StatusCode::BAD_REQUEST, PROMPT_REQUIRED.to_string()),
        ExecuteError::PoolEmpty => (
            StatusCode::SERVICE_UNAVAILABLE,
            "No API keys are configured. Please contact support.".to_string(),
        ),
        ExecuteError::AllKeysExhausted { .. } => (StatusCode::OK, KEYS_EXHAUSTED.to_string()),
        ExecuteError::SafetyBlocked { .. } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            "I can't answer this question for safety reasons. Please try rephrasing it."
                .to_string(),
        ),
        ExecuteError::InvalidCredential { .. } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Invalid or expired API key. Please check the configured API keys.".to_string(),
        ),
        ExecuteError::ModelUnavailable { model, .. } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!(
                "The selected AI model ({model}) is not found or supported for your API key. Please choose an available model."
            ),
        ),
        ExecuteError::Unavailable { timed_out: true, .. } => (
            StatusCode::GATEWAY_TIMEOUT,
            "The AI service took too long to respond. Please try again.".to_string(),
        ),
        ExecuteError::Unavailable { .. } => (
            StatusCode::BAD_GATEWAY,
            "The AI service is temporarily unavailable. Please try again.".to_string(),
        ),
        ExecuteError::Failed { .. } => (
            StatusCode::BAD_GATEWAY,
            "AI could not answer this query. Please try again.".to_string(),
        ),
        ExecuteError::Cancelled => (
            StatusCode::SERVICE_UNAVAILABLE,
            "The server is shutting down. Please try again.".to_string(),
        ),
    }
}

/// Answer one ask request.
#[instrument(skip_all, fields(request_id = %request_id))]
pub async fn ask(
    state: &RelayState,
    headers: &HeaderMap,
    body: Bytes,
    request_id: String,
) -> Response {
    let start = Instant::now();
    let _in_flight = InFlight::enter(&state.metrics);
    state.metrics.requests_total.fetch_add(1, Ordering::Relaxed);

    let (response, outcome) = answer(state, headers, &body, &request_id).await;

    let status = response.status();
    if !status.is_success() {
        state.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
    }
    metrics::record_request(status.as_u16(), outcome, start.elapsed().as_secs_f64());
    response
}

async fn answer(
    state: &RelayState,
    headers: &HeaderMap,
    body: &[u8],
    request_id: &str,
) -> (Response, &'static str) {
    if !is_json(headers) {
        return (
            error_response(StatusCode::BAD_REQUEST, "invalid_request", NOT_JSON, request_id),
            "rejected",
        );
    }

    let request: AskRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "malformed JSON body");
            return (
                error_response(
                    StatusCode::BAD_REQUEST,
                    "invalid_request",
                    &format!("Malformed JSON body: {e}"),
                    request_id,
                ),
                "rejected",
            );
        }
    };

    let question = match request.prompt {
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => s,
        _ => {
            return (
                error_response(
                    StatusCode::BAD_REQUEST,
                    "invalid_request",
                    PROMPT_REQUIRED,
                    request_id,
                ),
                "rejected",
            );
        }
    };

    match state
        .executor
        .execute_cancellable(&question, state.cancel.clone())
        .await
    {
        Ok(answer) => {
            info!(
                key = answer.key_index + 1,
                attempts = answer.attempts,
                rotations = answer.rotations,
                fallback = answer.fallback,
                "question answered"
            );
            let outcome = if answer.fallback { "fallback" } else { "answered" };
            (
                json_response(StatusCode::OK, serde_json::json!({ "answer": answer.text })),
                outcome,
            )
        }
        Err(ExecuteError::AllKeysExhausted { retry_after, .. }) => {
            let retry_secs = retry_after.as_secs().max(1);
            warn!(retry_after_secs = retry_secs, "all API keys exhausted, answering degraded");
            let mut response = json_response(
                StatusCode::OK,
                serde_json::json!({
                    "answer": KEYS_EXHAUSTED,
                    "degraded": true,
                    "retry_after_secs": retry_secs,
                }),
            );
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_secs));
            (response, "degraded")
        }
        Err(err) => {
            let (status, message) = error_status(&err);
            warn!(kind = err.kind(), error = %err, status = status.as_u16(), "ask failed");
            (
                error_response(status, err.kind(), &message, request_id),
                err.kind(),
            )
        }
    }
}
