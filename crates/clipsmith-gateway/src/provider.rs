//! Provider abstraction: one prompt in, one completion out.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use clipsmith_core::ProviderKind;

use crate::error::CallError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    #[serde(default)]
    pub system: Option<String>,
    pub prompt: String,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Ask the provider for a JSON object response where supported.
    #[serde(default)]
    pub json_mode: bool,
}

impl ModelRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            temperature: 0.2,
            max_tokens: 2048,
            json_mode: false,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelReply {
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// A single model endpoint. Implementations do no retrying of their own.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    fn model(&self) -> &str;

    async fn complete(&self, request: &ModelRequest) -> Result<ModelReply, CallError>;
}

/// Rough token count used when a provider does not report usage.
pub fn estimate_tokens(text: &str) -> u64 {
    ((text.chars().count() as u64) / 4).max(1)
}
