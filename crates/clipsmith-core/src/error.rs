//! Error types for Clipsmith.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Transient provider error ({provider}): {message}")]
    TransientProvider { provider: String, message: String },

    #[error("Provider rejected request ({provider}): {message}")]
    ProviderRejected { provider: String, message: String },

    #[error("Schema violation from {provider} after {attempts} attempts: {detail}")]
    SchemaViolation {
        provider: String,
        attempts: u32,
        detail: String,
    },

    #[error("Quorum not met: {received} of {required} required votes")]
    QuorumNotMet { received: usize, required: usize },

    #[error("Stage timeout: {0}")]
    StageTimeout(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Cache corruption: {0}")]
    CacheCorruption(String),

    #[error("Budget exhausted: spent ${spent:.4} of ${cap:.4}")]
    BudgetExhausted { spent: f64, cap: f64 },

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the failure is confined to a single item and must never abort
    /// the batch it belongs to.
    pub fn is_per_item(&self) -> bool {
        matches!(
            self,
            Error::SchemaViolation { .. }
                | Error::InvariantViolation(_)
                | Error::StageTimeout(_)
                | Error::QuorumNotMet { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
