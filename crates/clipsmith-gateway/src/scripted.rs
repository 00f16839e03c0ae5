//! Deterministic in-process provider for dry runs and tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use clipsmith_core::ProviderKind;

use crate::error::CallError;
use crate::provider::{estimate_tokens, ModelProvider, ModelReply, ModelRequest};

type Handler = dyn Fn(&ModelRequest, u32) -> Result<String, CallError> + Send + Sync;

/// Replies via a closure of `(request, call_number)`. Call numbers start at 0.
pub struct ScriptedProvider {
    id: String,
    model: String,
    handler: Arc<Handler>,
    delay: Option<Duration>,
    calls: AtomicU32,
}

impl ScriptedProvider {
    pub fn new(
        id: impl Into<String>,
        handler: impl Fn(&ModelRequest, u32) -> Result<String, CallError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            model: "scripted".into(),
            handler: Arc::new(handler),
            delay: None,
            calls: AtomicU32::new(0),
        }
    }

    /// Always the same reply.
    pub fn replying(id: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(id, move |_, _| Ok(text.clone()))
    }

    /// Always the same error.
    pub fn failing(id: impl Into<String>, error: CallError) -> Self {
        Self::new(id, move |_, _| Err(error.clone()))
    }

    /// Replies in order; the last one repeats once the queue is drained.
    pub fn sequence(id: impl Into<String>, replies: Vec<Result<String, CallError>>) -> Self {
        let queue = Mutex::new(VecDeque::from(replies));
        let id = id.into();
        let empty_id = id.clone();
        Self::new(id, move |_, _| {
            let mut queue = queue.lock();
            if queue.len() > 1 {
                if let Some(next) = queue.pop_front() {
                    return next;
                }
            }
            queue.front().cloned().unwrap_or_else(|| {
                Err(CallError::Rejected {
                    provider: empty_id.clone(),
                    status: None,
                    message: "script exhausted".into(),
                })
            })
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Sleep before answering, to exercise timeouts and concurrency.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Scripted
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelReply, CallError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let text = (self.handler)(request, call)?;
        Ok(ModelReply {
            tokens_in: estimate_tokens(&request.prompt),
            tokens_out: estimate_tokens(&text),
            text,
        })
    }
}
