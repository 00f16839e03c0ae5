//! The single path every model call takes: timeout, transient retry with
//! exponential backoff, schema validation with corrective retries, and cost
//! recording for every attempt.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use clipsmith_core::PipelineConfig;

use crate::budget::{BudgetTracker, CallRecord};
use crate::error::CallError;
use crate::pricing::estimate_cost;
use crate::provider::{estimate_tokens, ModelProvider, ModelReply, ModelRequest};
use crate::schema::{extract_json, ResponseSchema};

/// Upper bound on a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Validated output of one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Payload {
    Structured(serde_json::Value),
    Text(String),
}

impl Payload {
    pub fn as_structured(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Structured(v) => Some(v),
            Payload::Text(_) => None,
        }
    }
}

/// Totals over every attempt of one logical call.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Usage {
    pub attempts: u32,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub wall_time: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GatewaySettings {
    pub timeout: Duration,
    /// Corrective retries after a schema violation.
    pub max_retries: u32,
    pub max_transient_retries: u32,
    pub backoff_base: Duration,
}

impl GatewaySettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            timeout: config.call_timeout(),
            max_retries: config.max_retries,
            max_transient_retries: config.max_transient_retries,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
        }
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_retries: 2,
            max_transient_retries: 3,
            backoff_base: Duration::from_millis(500),
        }
    }
}

pub struct ModelGateway {
    budget: Arc<BudgetTracker>,
    settings: GatewaySettings,
}

impl ModelGateway {
    pub fn new(budget: Arc<BudgetTracker>, settings: GatewaySettings) -> Self {
        Self { budget, settings }
    }

    pub fn budget(&self) -> &Arc<BudgetTracker> {
        &self.budget
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    /// Call `provider` and return a validated payload.
    ///
    /// With a schema, the reply must contain JSON satisfying it; otherwise
    /// the raw text is returned.
    pub async fn invoke(
        &self,
        provider: &dyn ModelProvider,
        stage: &str,
        request: &ModelRequest,
        schema: Option<&ResponseSchema>,
    ) -> Result<Payload, CallError> {
        let mut usage = Usage::default();
        self.invoke_with_usage(provider, stage, request, schema, &mut usage)
            .await
    }

    /// Like [`invoke`](Self::invoke), also accumulating what the call cost
    /// across all its attempts into `usage`.
    pub async fn invoke_with_usage(
        &self,
        provider: &dyn ModelProvider,
        stage: &str,
        request: &ModelRequest,
        schema: Option<&ResponseSchema>,
        usage: &mut Usage,
    ) -> Result<Payload, CallError> {
        let Some(schema) = schema else {
            let reply = self
                .call_with_backoff(provider, stage, request, usage)
                .await?;
            return Ok(Payload::Text(reply.text));
        };

        let base_prompt = format!("{}\n\n{}", request.prompt, schema.instruction());
        let mut attempt_request = ModelRequest {
            prompt: base_prompt.clone(),
            json_mode: true,
            ..request.clone()
        };
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let reply = self
                .call_with_backoff(provider, stage, &attempt_request, usage)
                .await?;
            let detail = match extract_json(&reply.text) {
                Some(value) => match schema.validate(&value) {
                    Ok(()) => return Ok(Payload::Structured(value)),
                    Err(detail) => detail,
                },
                None => "reply contained no JSON".to_string(),
            };

            if attempts > self.settings.max_retries {
                warn!(
                    stage,
                    provider = provider.id(),
                    "Schema violation after {} attempts: {}",
                    attempts,
                    detail
                );
                return Err(CallError::SchemaViolation {
                    provider: provider.id().to_string(),
                    attempts,
                    detail,
                });
            }
            debug!(
                stage,
                provider = provider.id(),
                "Schema violation on attempt {}, retrying with correction: {}",
                attempts,
                detail
            );
            attempt_request.prompt = format!(
                "{}\n\nYour previous reply was invalid: {}. Reply again with only valid JSON matching the schema.",
                base_prompt, detail
            );
        }
    }

    async fn call_with_backoff(
        &self,
        provider: &dyn ModelProvider,
        stage: &str,
        request: &ModelRequest,
        usage: &mut Usage,
    ) -> Result<ModelReply, CallError> {
        let mut retries = 0u32;
        loop {
            match self.call_once(provider, stage, request, usage).await {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_transient() && retries < self.settings.max_transient_retries => {
                    let delay = e
                        .retry_after()
                        .unwrap_or_else(|| self.settings.backoff_base * 2u32.saturating_pow(retries))
                        .min(MAX_BACKOFF);
                    retries += 1;
                    warn!(
                        stage,
                        provider = provider.id(),
                        "Transient error ({}), retry {} in {:?}",
                        e,
                        retries,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One attempt under the call timeout, recorded to the budget either way.
    async fn call_once(
        &self,
        provider: &dyn ModelProvider,
        stage: &str,
        request: &ModelRequest,
        usage: &mut Usage,
    ) -> Result<ModelReply, CallError> {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.settings.timeout, provider.complete(request))
            .await
            .unwrap_or_else(|_| {
                Err(CallError::Timeout {
                    provider: provider.id().to_string(),
                    after_ms: self.settings.timeout.as_millis() as u64,
                })
            });
        let wall_time = started.elapsed();

        let (tokens_in, tokens_out) = match &outcome {
            Ok(reply) => (reply.tokens_in, reply.tokens_out),
            Err(_) => (estimate_tokens(&request.prompt), 0),
        };
        let cost_usd = estimate_cost(provider.kind(), provider.model(), tokens_in, tokens_out);
        self.budget.record(&CallRecord {
            stage,
            provider: provider.id(),
            tokens_in,
            tokens_out,
            wall_time,
            cost_usd,
            success: outcome.is_ok(),
        });
        usage.attempts += 1;
        usage.tokens_in += tokens_in;
        usage.tokens_out += tokens_out;
        usage.cost_usd += cost_usd;
        usage.wall_time += wall_time;
        debug!(
            stage,
            provider = provider.id(),
            ok = outcome.is_ok(),
            "Model call took {} ms",
            wall_time.as_millis()
        );
        outcome
    }
}
