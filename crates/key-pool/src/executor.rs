//! Failover request executor
//!
//! Drives one question to an answer. Each attempt uses the pool's active key;
//! a quota failure rotates to the next key and retries, any other failure ends
//! the operation with its classified error. Attempts are bounded by the pool
//! size, so a request never loops longer than one pass over the keys.

use std::sync::Arc;

use generation::{FailureKind, Generator, PromptTemplate};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::ExecuteError;
use crate::pool::{KeyPool, Rotation};

/// Answer returned when the backend responds without any usable text.
pub const FALLBACK_ANSWER: &str = "AI could not generate a complete response. \
Please try asking something else or rephrase your query.";

/// Successful outcome of `FailoverExecutor::execute`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub text: String,
    /// 0-based pool index of the key that produced the answer
    pub key_index: usize,
    pub attempts: usize,
    pub rotations: usize,
    /// True when the backend returned no text and `text` is the fallback
    pub fallback: bool,
}

pub struct FailoverExecutor {
    pool: Arc<KeyPool>,
    generator: Arc<dyn Generator>,
    template: PromptTemplate,
    fallback_answer: String,
}

impl FailoverExecutor {
    pub fn new(pool: Arc<KeyPool>, generator: Arc<dyn Generator>, template: PromptTemplate) -> Self {
        Self {
            pool,
            generator,
            template,
            fallback_answer: FALLBACK_ANSWER.to_string(),
        }
    }

    /// Replace the text returned when the backend answers with nothing.
    pub fn with_fallback_answer(mut self, text: impl Into<String>) -> Self {
        self.fallback_answer = text.into();
        self
    }

    pub fn pool(&self) -> &Arc<KeyPool> {
        &self.pool
    }

    /// Answer `question`, rotating keys on quota exhaustion.
    ///
    /// Pool state only changes after a backend call has returned, so dropping
    /// the returned future mid-call leaves the pool untouched.
    #[instrument(skip_all, fields(backend = %self.generator.id()))]
    pub async fn execute(&self, question: &str) -> Result<Answer, ExecuteError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(ExecuteError::InvalidInput);
        }
        if self.pool.is_empty() {
            return Err(ExecuteError::PoolEmpty);
        }

        self.pool.maybe_reset_exhausted(Instant::now()).await;
        if self.pool.all_exhausted().await {
            debug!("every key exhausted, skipping backend call");
            return Err(self.exhausted().await);
        }

        let prompt = self.template.render(question);
        let mut key = self.pool.current().await?;
        let mut rotations = 0;

        for attempt in 1..=self.pool.len() {
            debug!(key = key.index + 1, attempt, "calling generation backend");

            let err = match self.generator.generate(&key.credential, &prompt).await {
                Ok(generation) => {
                    let (text, fallback) = match generation.text {
                        Some(text) if !text.trim().is_empty() => (text, false),
                        _ => {
                            warn!(key = key.index + 1, "backend returned no text, using fallback");
                            (self.fallback_answer.clone(), true)
                        }
                    };
                    info!(key = key.index + 1, attempt, rotations, "answer generated");
                    return Ok(Answer {
                        text,
                        key_index: key.index,
                        attempts: attempt,
                        rotations,
                        fallback,
                    });
                }
                Err(err) => err,
            };

            let kind = self.generator.classify(&err);
            metrics::counter!("relay_backend_errors_total", "kind" => kind.label()).increment(1);
            warn!(
                key = key.index + 1,
                attempt,
                kind = kind.label(),
                error = %err,
                "generation attempt failed"
            );

            match kind {
                FailureKind::QuotaExceeded => match self.pool.rotate_from(key.index).await? {
                    Rotation::Advanced(next) => {
                        rotations += 1;
                        key = next;
                    }
                    Rotation::AllExhausted => return Err(self.exhausted().await),
                },
                FailureKind::SafetyBlocked => {
                    return Err(ExecuteError::SafetyBlocked {
                        message: err.message,
                    });
                }
                FailureKind::InvalidCredential => {
                    return Err(ExecuteError::InvalidCredential {
                        key: key.index + 1,
                        message: err.message,
                    });
                }
                FailureKind::ModelUnavailable => {
                    return Err(ExecuteError::ModelUnavailable {
                        model: self.generator.model().to_string(),
                        message: err.message,
                    });
                }
                FailureKind::Unavailable => {
                    return Err(ExecuteError::Unavailable {
                        timed_out: err.is_timeout(),
                        message: err.message,
                    });
                }
                FailureKind::Failed => {
                    return Err(ExecuteError::Failed {
                        message: err.message,
                    });
                }
            }
        }

        // Every attempt hit a quota error and rotation kept finding keys that
        // concurrent requests had not yet marked.
        Err(self.exhausted().await)
    }

    /// `execute` that gives up with `Cancelled` as soon as `cancel` fires.
    pub async fn execute_cancellable(
        &self,
        question: &str,
        cancel: CancellationToken,
    ) -> Result<Answer, ExecuteError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("generation cancelled");
                Err(ExecuteError::Cancelled)
            }
            result = self.execute(question) => result,
        }
    }

    async fn exhausted(&self) -> ExecuteError {
        ExecuteError::AllKeysExhausted {
            keys: self.pool.len(),
            retry_after: self.pool.retry_after(Instant::now()).await,
        }
    }
}
