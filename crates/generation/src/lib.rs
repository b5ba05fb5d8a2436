//! Generation backend abstraction
//!
//! Defines the outbound contract the failover executor depends on: a
//! `Generator` takes one API key and a rendered prompt and returns generated
//! text or a `BackendError`. The error carries the structured fields needed to
//! classify it (`FailureKind`) without string-matching on messages.
//! `GeminiGenerator` implements the contract over the Gemini REST API; tests
//! and alternative backends implement the same trait.

pub mod classify;
pub mod gemini;
pub mod prompt;

pub use classify::{classify, classify_message, classify_structured};
pub use gemini::GeminiGenerator;
pub use prompt::{PromptTemplate, QUESTION_PLACEHOLDER};

use common::Secret;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// A single backend API key. Immutable once loaded, redacted when formatted.
#[derive(Clone)]
pub struct Credential(Secret<String>);

impl Credential {
    pub fn new(key: impl Into<String>) -> Self {
        Self(Secret::new(key.into()))
    }

    /// Raw key value for the outbound request.
    pub fn expose(&self) -> &str {
        self.0.expose()
    }
}

impl From<Secret<String>> for Credential {
    fn from(secret: Secret<String>) -> Self {
        Self(secret)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential({})", self.0)
    }
}

/// Successful backend response. `text` is `None` when the backend answered
/// without any usable text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Generation {
    pub text: Option<String>,
}

/// Transport-level failure that happened before a response was received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailure {
    Timeout,
    Connect,
}

/// Error returned by a backend call.
///
/// Fields are optional because backends expose different subsets; the
/// classifier checks whichever are present before falling back to `message`.
#[derive(Debug, Clone, Default, thiserror::Error)]
#[error("{message}")]
pub struct BackendError {
    /// HTTP status of the backend response
    pub status: Option<u16>,
    /// Backend status code, e.g. `RESOURCE_EXHAUSTED`
    pub code: Option<String>,
    /// Machine-readable reason, e.g. `API_KEY_INVALID`
    pub reason: Option<String>,
    /// Set when the backend refused the prompt on content-safety grounds
    pub block_reason: Option<String>,
    pub transport: Option<TransportFailure>,
    pub message: String,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Safety refusal with the backend's block reason.
    pub fn blocked(block_reason: impl Into<String>) -> Self {
        let block_reason = block_reason.into();
        Self {
            message: format!("prompt blocked by safety filter ({block_reason})"),
            block_reason: Some(block_reason),
            ..Self::default()
        }
    }

    pub fn transport(failure: TransportFailure, message: impl Into<String>) -> Self {
        Self {
            transport: Some(failure),
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.transport == Some(TransportFailure::Timeout)
    }
}

/// Classification of a backend failure, decided once where the error is
/// received. Only `QuotaExceeded` leads to key rotation; every other kind is
/// terminal for the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Key is over quota or rate limited, rotate to the next key
    QuotaExceeded,
    /// Backend refused the content
    SafetyBlocked,
    /// Key itself was rejected, retries are futile
    InvalidCredential,
    /// Configured model is unknown or unsupported
    ModelUnavailable,
    /// Timeout, transport failure or backend 5xx
    Unavailable,
    /// Anything else the backend rejected
    Failed,
}

impl FailureKind {
    /// Label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::QuotaExceeded => "quota_exceeded",
            FailureKind::SafetyBlocked => "safety_blocked",
            FailureKind::InvalidCredential => "invalid_credential",
            FailureKind::ModelUnavailable => "model_unavailable",
            FailureKind::Unavailable => "unavailable",
            FailureKind::Failed => "failed",
        }
    }
}

/// Result alias for backend calls.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Capability contract of a generation backend.
///
/// Uses `Pin<Box<dyn Future>>` return types so the executor can hold an
/// `Arc<dyn Generator>`.
pub trait Generator: Send + Sync {
    /// Identifier for logging (e.g. "gemini")
    fn id(&self) -> &str;

    /// Model name, reported when the backend says the model is unavailable.
    fn model(&self) -> &str;

    /// Generate a completion for `prompt` authenticated with `credential`.
    fn generate<'a>(
        &'a self,
        credential: &'a Credential,
        prompt: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Generation>> + Send + 'a>>;

    /// Classify a failure returned by `generate`.
    fn classify(&self, error: &BackendError) -> FailureKind {
        classify::classify(error)
    }
}
