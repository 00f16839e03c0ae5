//! HTTP providers.
//!
//! OpenAI, Groq, xAI, DeepSeek, and Google all speak the OpenAI chat
//! completions format. Anthropic uses its Messages API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::json;
use tracing::debug;

use clipsmith_core::ProviderKind;

use crate::error::CallError;
use crate::provider::{estimate_tokens, ModelProvider, ModelReply, ModelRequest};

const ANTHROPIC_URL: &str = "https://api.anthropic.com/v1/messages";

/// Chat completions base URL for OpenAI-compatible providers.
pub fn default_base_url(kind: ProviderKind) -> Option<&'static str> {
    match kind {
        ProviderKind::OpenAI => Some("https://api.openai.com/v1"),
        ProviderKind::Groq => Some("https://api.groq.com/openai/v1"),
        ProviderKind::Xai => Some("https://api.x.ai/v1"),
        ProviderKind::DeepSeek => Some("https://api.deepseek.com"),
        ProviderKind::Google => Some("https://generativelanguage.googleapis.com/v1beta/openai"),
        ProviderKind::Anthropic | ProviderKind::Scripted => None,
    }
}

pub struct HttpProvider {
    id: String,
    kind: ProviderKind,
    model: String,
    api_key: String,
    base_url: Option<String>,
    client: Client,
}

impl HttpProvider {
    pub fn new(
        client: Client,
        id: impl Into<String>,
        kind: ProviderKind,
        model: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            model: model.into(),
            api_key: api_key.into(),
            base_url: default_base_url(kind).map(String::from),
            client,
        }
    }

    /// Point an OpenAI-compatible provider at a different host.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    async fn complete_openai_compat(
        &self,
        base_url: &str,
        request: &ModelRequest,
    ) -> Result<ModelReply, CallError> {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });
        if request.json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }

        let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
        debug!("Calling {} with model {}", url, self.model);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let parsed = self.read_success(response).await?;
        let text = parsed["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        Ok(ModelReply {
            tokens_in: parsed["usage"]["prompt_tokens"]
                .as_u64()
                .unwrap_or_else(|| estimate_tokens(&request.prompt)),
            tokens_out: parsed["usage"]["completion_tokens"]
                .as_u64()
                .unwrap_or_else(|| estimate_tokens(&text)),
            text,
        })
    }

    async fn complete_anthropic(&self, request: &ModelRequest) -> Result<ModelReply, CallError> {
        let mut body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": request.prompt}],
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });
        if let Some(system) = &request.system {
            body["system"] = json!(system);
        }

        debug!("Calling Anthropic with model {}", self.model);
        let response = self
            .client
            .post(ANTHROPIC_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let parsed = self.read_success(response).await?;
        let text = parsed["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| b["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        Ok(ModelReply {
            tokens_in: parsed["usage"]["input_tokens"]
                .as_u64()
                .unwrap_or_else(|| estimate_tokens(&request.prompt)),
            tokens_out: parsed["usage"]["output_tokens"]
                .as_u64()
                .unwrap_or_else(|| estimate_tokens(&text)),
            text,
        })
    }

    async fn read_success(
        &self,
        response: reqwest::Response,
    ) -> Result<serde_json::Value, CallError> {
        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(&self.id, status, retry_after, body));
        }
        response.json().await.map_err(|e| CallError::Network {
            provider: self.id.clone(),
            message: format!("invalid response body: {}", e),
        })
    }

    fn transport_error(&self, e: reqwest::Error) -> CallError {
        if e.is_timeout() {
            CallError::Timeout {
                provider: self.id.clone(),
                after_ms: 0,
            }
        } else if e.is_builder() {
            CallError::Rejected {
                provider: self.id.clone(),
                status: None,
                message: e.to_string(),
            }
        } else {
            CallError::Network {
                provider: self.id.clone(),
                message: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl ModelProvider for HttpProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelReply, CallError> {
        match (self.kind, &self.base_url) {
            (ProviderKind::Anthropic, _) => self.complete_anthropic(request).await,
            (_, Some(base)) => self.complete_openai_compat(base, request).await,
            (kind, None) => Err(CallError::Rejected {
                provider: self.id.clone(),
                status: None,
                message: format!("no HTTP endpoint for provider kind {}", kind),
            }),
        }
    }
}

/// `Retry-After` in seconds (the only form providers send in practice).
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|s| s.is_finite() && *s >= 0.0)
        .map(Duration::from_secs_f64)
}

fn classify_status(
    provider: &str,
    status: StatusCode,
    retry_after: Option<Duration>,
    body: String,
) -> CallError {
    let provider = provider.to_string();
    if status == StatusCode::TOO_MANY_REQUESTS {
        CallError::RateLimited {
            provider,
            retry_after,
        }
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        CallError::Server {
            provider,
            status: status.as_u16(),
            message: body,
        }
    } else {
        CallError::Rejected {
            provider,
            status: Some(status.as_u16()),
            message: body,
        }
    }
}
