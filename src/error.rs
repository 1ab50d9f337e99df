//! Kind-tagged pipeline errors.
//!
//! Components recover locally from `ProviderEmpty` and `Timeout`, retry
//! `TransientNetwork`, and surface `Cancelled` and `Fatal` upward. Rate
//! limiting never appears here at all: the limiter suspends callers instead
//! of failing them.

use std::time::Duration;
use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Retryable network-level failure (connect reset, 5xx, 429).
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Provider answered with a valid shape but no data for this token.
    /// Not retried; the caller fails over to the next provider.
    #[error("provider returned no data")]
    ProviderEmpty,

    /// A bounded wait elapsed. Not a cancellation; the caller invokes its
    /// documented fallback.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Shutdown propagation. Cleanup paths must re-raise this, never absorb
    /// it.
    #[error("cancelled")]
    Cancelled,

    /// Invariant violation or repeated failure past the breaker threshold.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl PipelineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::TransientNetwork(_))
    }

    /// Classify a reqwest failure into the taxonomy.
    pub fn from_http(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            return PipelineError::TransientNetwork(err.to_string());
        }
        if let Some(status) = err.status() {
            if status.is_server_error() || status.as_u16() == 429 {
                return PipelineError::TransientNetwork(format!("http {}", status));
            }
        }
        PipelineError::TransientNetwork(err.to_string())
    }
}
