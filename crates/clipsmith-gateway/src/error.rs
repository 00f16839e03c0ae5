//! Per-call errors.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallError {
    #[error("{provider}: timed out after {after_ms} ms")]
    Timeout { provider: String, after_ms: u64 },

    #[error("{provider}: rate limited")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("{provider}: server error {status}: {message}")]
    Server {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("{provider}: network error: {message}")]
    Network { provider: String, message: String },

    /// Auth failures, malformed requests, unknown models.
    #[error("{provider}: rejected ({status:?}): {message}")]
    Rejected {
        provider: String,
        status: Option<u16>,
        message: String,
    },

    #[error("{provider}: response failed schema after {attempts} attempts: {detail}")]
    SchemaViolation {
        provider: String,
        attempts: u32,
        detail: String,
    },
}

impl CallError {
    /// Retry with backoff: rate limits, timeouts, 5xx, dropped connections.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CallError::Timeout { .. }
                | CallError::RateLimited { .. }
                | CallError::Server { .. }
                | CallError::Network { .. }
        )
    }

    /// Server-suggested wait before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CallError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn provider(&self) -> &str {
        match self {
            CallError::Timeout { provider, .. }
            | CallError::RateLimited { provider, .. }
            | CallError::Server { provider, .. }
            | CallError::Network { provider, .. }
            | CallError::Rejected { provider, .. }
            | CallError::SchemaViolation { provider, .. } => provider,
        }
    }
}

impl From<CallError> for clipsmith_core::Error {
    fn from(err: CallError) -> Self {
        match err {
            CallError::SchemaViolation {
                provider,
                attempts,
                detail,
            } => clipsmith_core::Error::SchemaViolation {
                provider,
                attempts,
                detail,
            },
            CallError::Rejected { .. } => clipsmith_core::Error::ProviderRejected {
                provider: err.provider().to_string(),
                message: err.to_string(),
            },
            other => clipsmith_core::Error::TransientProvider {
                provider: other.provider().to_string(),
                message: other.to_string(),
            },
        }
    }
}
