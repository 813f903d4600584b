// src/provider/mod.rs
// C5: uniform streaming interface over N language-model back-ends with a
// fallback chain, mirroring the teacher's `llm::provider` module (one trait,
// several concrete adapters, a stream-event decoder shared across them).

pub mod anthropic_style;
pub mod mock;
pub mod openai_style;
pub mod stream;

pub use stream::StreamEvent;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }
}

/// One text delta callback invoked per streamed chunk.
pub type ChunkSink<'a> = Box<dyn FnMut(&str) + Send + 'a>;

/// Uniform streaming call over a single concrete model.
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    /// Streams `messages` against `model`, invoking `on_chunk` per text delta,
    /// and returns the full concatenated content.
    async fn stream(&self, model: &str, messages: &[Message], on_chunk: ChunkSink<'_>) -> AppResult<String>;
}

/// A logical provider: a primary model plus an ordered fallback chain, all
/// served by the same adapter (spec §4.5).
pub struct LogicalProvider {
    pub name: String,
    pub adapter: Arc<dyn ModelAdapter>,
    pub primary_model: String,
    pub fallback_models: Vec<String>,
    pub timeout: Duration,
    pub max_attempts: u32,
}

impl LogicalProvider {
    /// Streams against the primary model, retrying against fallback models on
    /// model-unavailable failures, up to `max_attempts` across the whole chain.
    pub async fn stream(&self, messages: &[Message], mut on_chunk: ChunkSink<'_>) -> AppResult<String> {
        let mut models = vec![self.primary_model.clone()];
        models.extend(self.fallback_models.clone());

        let mut attempts = 0u32;
        let mut last_err = AppError::ProviderUnavailable("no models configured".to_string());

        for model in models {
            if attempts >= self.max_attempts {
                break;
            }
            attempts += 1;

            let call = self.adapter.stream(&model, messages, Box::new(&mut on_chunk));
            match tokio::time::timeout(self.timeout, call).await {
                Ok(Ok(text)) => return Ok(text),
                Ok(Err(e)) if is_model_unavailable(&e) => {
                    tracing::warn!(provider = %self.name, model = %model, "model unavailable, trying next in chain");
                    crate::metrics::record_provider_fallback(&self.name, &model);
                    last_err = e;
                    continue;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(AppError::Transient(format!("provider {} timed out after {:?}", self.name, self.timeout))),
            }
        }

        Err(AppError::ProviderUnavailable(format!(
            "all models exhausted for provider {}: {}",
            self.name, last_err
        )))
    }
}

fn is_model_unavailable(err: &AppError) -> bool {
    matches!(err, AppError::ProviderUnavailable(msg) if msg.contains("model"))
}

/// Registry mapping a logical provider name to its configuration, built at startup.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<LogicalProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self { providers: HashMap::new() }
    }

    pub fn register(&mut self, provider: LogicalProvider) {
        self.providers.insert(provider.name.clone(), Arc::new(provider));
    }

    pub fn get(&self, name: &str) -> AppResult<Arc<LogicalProvider>> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::Internal(format!("unknown provider: {name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::MockAdapter;

    #[tokio::test]
    async fn fallback_consumed_silently_on_model_unavailable() {
        let adapter = Arc::new(MockAdapter::fails_then_succeeds(2, "hello world"));
        let provider = LogicalProvider {
            name: "test".into(),
            adapter: adapter.clone(),
            primary_model: "bad-model".into(),
            fallback_models: vec!["also-bad".into(), "good-model".into()],
            timeout: Duration::from_secs(5),
            max_attempts: 5,
        };

        let mut chunks = Vec::new();
        let result = provider
            .stream(&[Message::user("hi")], Box::new(|c| chunks.push(c.to_string())))
            .await
            .unwrap();

        assert_eq!(result, "hello world");
        assert_eq!(adapter.calls(), 3);
    }

    #[tokio::test]
    async fn exhausting_chain_surfaces_provider_unavailable() {
        let adapter = Arc::new(MockAdapter::always_unavailable());
        let provider = LogicalProvider {
            name: "test".into(),
            adapter,
            primary_model: "bad-1".into(),
            fallback_models: vec!["bad-2".into(), "bad-3".into(), "bad-4".into(), "bad-5".into()],
            timeout: Duration::from_secs(5),
            max_attempts: 5,
        };

        let err = provider.stream(&[Message::user("hi")], Box::new(|_| {})).await.unwrap_err();
        assert!(matches!(err, AppError::ProviderUnavailable(_)));
    }

    #[tokio::test]
    async fn non_retryable_error_surfaces_immediately() {
        let adapter = Arc::new(MockAdapter::invalid_credentials());
        let provider = LogicalProvider {
            name: "test".into(),
            adapter: adapter.clone(),
            primary_model: "m".into(),
            fallback_models: vec!["m2".into()],
            timeout: Duration::from_secs(5),
            max_attempts: 5,
        };

        let err = provider.stream(&[Message::user("hi")], Box::new(|_| {})).await.unwrap_err();
        assert!(matches!(err, AppError::Auth(_)));
        assert_eq!(adapter.calls(), 1, "must not retry non-model-unavailable errors");
    }
}
