//! Error types for pool and executor operations

use std::time::Duration;

/// Errors from pool operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("key pool is empty: no API keys configured")]
    PoolEmpty,
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Terminal outcome of a failed `FailoverExecutor::execute`.
///
/// Quota exhaustion of a single key never appears here; it is handled by
/// rotation and only surfaces as `AllKeysExhausted` once no key is left.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecuteError {
    #[error("question is empty")]
    InvalidInput,

    #[error("key pool is empty: no API keys configured")]
    PoolEmpty,

    #[error("all {keys} API keys are exhausted, retry in {}s", .retry_after.as_secs())]
    AllKeysExhausted { keys: usize, retry_after: Duration },

    #[error("blocked by safety filter: {message}")]
    SafetyBlocked { message: String },

    /// `key` is the 1-based pool position of the rejected key.
    #[error("API key #{key} rejected: {message}")]
    InvalidCredential { key: usize, message: String },

    #[error("model {model} unavailable: {message}")]
    ModelUnavailable { model: String, message: String },

    #[error("generation backend unavailable: {message}")]
    Unavailable { timed_out: bool, message: String },

    #[error("generation failed: {message}")]
    Failed { message: String },

    #[error("generation cancelled")]
    Cancelled,
}

impl ExecuteError {
    /// Label for metrics, logs and error responses.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecuteError::InvalidInput => "invalid_input",
            ExecuteError::PoolEmpty => "pool_empty",
            ExecuteError::AllKeysExhausted { .. } => "all_keys_exhausted",
            ExecuteError::SafetyBlocked { .. } => "safety_blocked",
            ExecuteError::InvalidCredential { .. } => "invalid_credential",
            ExecuteError::ModelUnavailable { .. } => "model_unavailable",
            ExecuteError::Unavailable { .. } => "unavailable",
            ExecuteError::Failed { .. } => "failed",
            ExecuteError::Cancelled => "cancelled",
        }
    }
}

impl From<Error> for ExecuteError {
    fn from(err: Error) -> Self {
        match err {
            Error::PoolEmpty => ExecuteError::PoolEmpty,
        }
    }
}
