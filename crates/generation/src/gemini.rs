//! Gemini `generateContent` backend
//!
//! Sends the rendered prompt as a single user turn and concatenates the text
//! parts of the first candidate. Error responses are parsed from the Google
//! error envelope so the classifier sees the status code and error-info reason
//! rather than only the message:
//!
//! ```json
//! {"error":{"code":429,"message":"...","status":"RESOURCE_EXHAUSTED",
//!           "details":[{"@type":"...ErrorInfo","reason":"..."}]}}
//! ```

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::{BackendError, Credential, Generation, Generator, Result, TransportFailure};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

/// Header carrying the API key (keeps the key out of URLs and access logs).
const API_KEY_HEADER: &str = "x-goog-api-key";

/// Finish reason reported when a candidate was withheld for safety.
const SAFETY_FINISH_REASON: &str = "SAFETY";

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: [RequestContent<'a>; 1],
}

#[derive(Serialize)]
struct RequestContent<'a> {
    role: &'static str,
    parts: [RequestPart<'a>; 1],
}

#[derive(Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<ResponseContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    status: Option<String>,
    #[serde(default)]
    details: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    reason: Option<String>,
}

/// Gemini REST client implementing `Generator`.
pub struct GeminiGenerator {
    client: reqwest::Client,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl GeminiGenerator {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            model: model.into(),
            timeout,
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        )
    }

    #[instrument(skip_all, fields(model = %self.model))]
    async fn call(&self, credential: &Credential, prompt: &str) -> Result<Generation> {
        let body = GenerateRequest {
            contents: [RequestContent {
                role: "user",
                parts: [RequestPart { text: prompt }],
            }],
        };

        let response = self
            .client
            .post(self.endpoint())
            .header(API_KEY_HEADER, credential.expose())
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            debug!(status = status.as_u16(), "generateContent returned an error");
            return Err(parse_error(status.as_u16(), &body));
        }

        let parsed = response.json::<GenerateResponse>().await.map_err(|e| {
            if e.is_timeout() {
                transport_error(e)
            } else {
                BackendError::new(format!("invalid generateContent response: {e}"))
            }
        })?;

        extract_generation(parsed)
    }
}

impl Generator for GeminiGenerator {
    fn id(&self) -> &str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn generate<'a>(
        &'a self,
        credential: &'a Credential,
        prompt: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Generation>> + Send + 'a>> {
        Box::pin(self.call(credential, prompt))
    }
}

fn transport_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::transport(TransportFailure::Timeout, format!("request timed out: {e}"))
    } else {
        BackendError::transport(TransportFailure::Connect, format!("request failed: {e}"))
    }
}

/// Build a `BackendError` from a non-2xx response body.
fn parse_error(status: u16, body: &str) -> BackendError {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => {
            let mut err = BackendError::new(envelope.error.message).with_status(status);
            err.code = envelope.error.status;
            err.reason = envelope
                .error
                .details
                .into_iter()
                .find_map(|detail| detail.reason);
            err
        }
        Err(_) => BackendError::new(format!("generateContent returned {status}: {body}"))
            .with_status(status),
    }
}

/// Turn a successful response into a `Generation`, surfacing safety blocks
/// as errors.
fn extract_generation(response: GenerateResponse) -> Result<Generation> {
    if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(BackendError::blocked(reason));
    }

    let Some(candidate) = response.candidates.into_iter().next() else {
        return Ok(Generation::default());
    };

    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    if text.is_empty() {
        if candidate.finish_reason.as_deref() == Some(SAFETY_FINISH_REASON) {
            return Err(BackendError::blocked(SAFETY_FINISH_REASON));
        }
        return Ok(Generation::default());
    }

    Ok(Generation { text: Some(text) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FailureKind, classify};
    use axum::http::{HeaderMap, StatusCode};
    use tokio::net::TcpListener;

    fn parse(json: &str) -> GenerateResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn extracts_and_joins_text_parts() {
        let response = parse(
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Grass plan "},{"text":"costs ₹100/month."}]},"finishReason":"STOP"}]}"#,
        );
        let generation = extract_generation(response).unwrap();
        assert_eq!(
            generation.text.as_deref(),
            Some("Grass plan costs ₹100/month.")
        );
    }

    #[test]
    fn empty_candidates_yield_no_text() {
        let generation = extract_generation(parse(r#"{"candidates":[]}"#)).unwrap();
        assert_eq!(generation.text, None);
    }

    #[test]
    fn prompt_block_reason_is_safety_error() {
        let err = extract_generation(parse(
            r#"{"promptFeedback":{"blockReason":"SAFETY","safetyRatings":[]}}"#,
        ))
        .unwrap_err();
        assert_eq!(classify(&err), FailureKind::SafetyBlocked);
    }

    #[test]
    fn safety_finish_without_text_is_safety_error() {
        let err = extract_generation(parse(r#"{"candidates":[{"finishReason":"SAFETY"}]}"#))
            .unwrap_err();
        assert_eq!(err.block_reason.as_deref(), Some("SAFETY"));
    }

    #[test]
    fn max_tokens_without_text_is_empty_generation() {
        let generation =
            extract_generation(parse(r#"{"candidates":[{"finishReason":"MAX_TOKENS"}]}"#))
                .unwrap();
        assert_eq!(generation.text, None);
    }

    #[test]
    fn parses_quota_error_envelope() {
        let body = r#"{"error":{"code":429,"message":"You exceeded your current quota, please check your plan and billing details.","status":"RESOURCE_EXHAUSTED","details":[{"@type":"type.googleapis.com/google.rpc.QuotaFailure","violations":[]}]}}"#;
        let err = parse_error(429, body);
        assert_eq!(err.status, Some(429));
        assert_eq!(err.code.as_deref(), Some("RESOURCE_EXHAUSTED"));
        assert_eq!(err.reason, None);
        assert_eq!(classify(&err), FailureKind::QuotaExceeded);
    }

    #[test]
    fn parses_invalid_key_reason() {
        let body = r#"{"error":{"code":400,"message":"API key not valid. Please pass a valid API key.","status":"INVALID_ARGUMENT","details":[{"@type":"type.googleapis.com/google.rpc.ErrorInfo","reason":"API_KEY_INVALID","domain":"googleapis.com"}]}}"#;
        let err = parse_error(400, body);
        assert_eq!(err.reason.as_deref(), Some("API_KEY_INVALID"));
        assert_eq!(classify(&err), FailureKind::InvalidCredential);
    }

    #[test]
    fn non_json_error_body_keeps_status_and_text() {
        let err = parse_error(502, "<html>bad gateway</html>");
        assert_eq!(err.status, Some(502));
        assert!(err.message.contains("bad gateway"));
        assert_eq!(classify(&err), FailureKind::Unavailable);
    }

    #[test]
    fn endpoint_joins_base_and_model() {
        let generator = GeminiGenerator::new(
            reqwest::Client::new(),
            "http://localhost:1234/",
            "gemini-2.5-flash",
            Duration::from_secs(5),
        );
        assert_eq!(
            generator.endpoint(),
            "http://localhost:1234/v1beta/models/gemini-2.5-flash:generateContent"
        );
    }

    /// Start a mock Gemini server. Answers for key "good", 429 for anything else.
    async fn start_mock_backend() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let app = axum::Router::new().route(
                "/v1beta/models/{model}",
                axum::routing::post(
                    |headers: HeaderMap, axum::Json(body): axum::Json<serde_json::Value>| async move {
                        let key = headers
                            .get(API_KEY_HEADER)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        if key != "good" {
                            return (
                                StatusCode::TOO_MANY_REQUESTS,
                                axum::Json(serde_json::json!({
                                    "error": {
                                        "code": 429,
                                        "message": "Resource has been exhausted (e.g. check quota).",
                                        "status": "RESOURCE_EXHAUSTED"
                                    }
                                })),
                            );
                        }
                        let prompt = body["contents"][0]["parts"][0]["text"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string();
                        (
                            StatusCode::OK,
                            axum::Json(serde_json::json!({
                                "candidates": [{
                                    "content": {"parts": [{"text": format!("echo: {prompt}")}]},
                                    "finishReason": "STOP"
                                }]
                            })),
                        )
                    },
                ),
            );
            axum::serve(listener, app).await.unwrap();
        });

        format!("http://{addr}")
    }

    #[tokio::test]
    async fn generate_sends_key_header_and_prompt() {
        let base_url = start_mock_backend().await;
        let generator = GeminiGenerator::new(
            reqwest::Client::new(),
            base_url,
            "gemini-2.5-flash",
            Duration::from_secs(5),
        );

        let generation = generator
            .generate(&Credential::new("good"), "hello")
            .await
            .unwrap();
        assert_eq!(generation.text.as_deref(), Some("echo: hello"));
    }

    #[tokio::test]
    async fn generate_maps_429_to_structured_error() {
        let base_url = start_mock_backend().await;
        let generator = GeminiGenerator::new(
            reqwest::Client::new(),
            base_url,
            "gemini-2.5-flash",
            Duration::from_secs(5),
        );

        let err = generator
            .generate(&Credential::new("spent"), "hello")
            .await
            .unwrap_err();
        assert_eq!(err.status, Some(429));
        assert_eq!(err.code.as_deref(), Some("RESOURCE_EXHAUSTED"));
        assert_eq!(generator.classify(&err), FailureKind::QuotaExceeded);
    }

    #[tokio::test]
    async fn generate_times_out_on_silent_backend() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    drop(socket);
                });
            }
        });

        let generator = GeminiGenerator::new(
            reqwest::Client::new(),
            format!("http://{addr}"),
            "gemini-2.5-flash",
            Duration::from_millis(50),
        );
        let err = generator
            .generate(&Credential::new("good"), "hello")
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "expected timeout, got: {err:?}");
        assert_eq!(generator.classify(&err), FailureKind::Unavailable);
    }

    #[tokio::test]
    async fn generate_reports_connection_failure() {
        let generator = GeminiGenerator::new(
            reqwest::Client::new(),
            "http://127.0.0.1:1",
            "gemini-2.5-flash",
            Duration::from_secs(5),
        );
        let err = generator
            .generate(&Credential::new("good"), "hello")
            .await
            .unwrap_err();
        assert_eq!(err.transport, Some(TransportFailure::Connect));
    }
}
