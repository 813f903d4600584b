// src/provider/mock.rs
// Test double for `ModelAdapter`, used by the fallback-chain tests in
// `provider::mod` and by scheduler/assembler tests elsewhere.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{ChunkSink, Message, ModelAdapter};
use crate::error::{AppError, AppResult};

enum Behavior {
    FailsThenSucceeds { fail_count: usize, text: String },
    AlwaysUnavailable,
    InvalidCredentials,
    Echo,
}

pub struct MockAdapter {
    behavior: Behavior,
    calls: AtomicUsize,
    seen: Mutex<Vec<String>>,
}

impl MockAdapter {
    /// Returns `AppError::ProviderUnavailable("model ...")` on the first `fail_count`
    /// calls, then succeeds with `text` on the call after that.
    pub fn fails_then_succeeds(fail_count: usize, text: &str) -> Self {
        Self {
            behavior: Behavior::FailsThenSucceeds { fail_count, text: text.to_string() },
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn always_unavailable() -> Self {
        Self { behavior: Behavior::AlwaysUnavailable, calls: AtomicUsize::new(0), seen: Mutex::new(Vec::new()) }
    }

    pub fn invalid_credentials() -> Self {
        Self { behavior: Behavior::InvalidCredentials, calls: AtomicUsize::new(0), seen: Mutex::new(Vec::new()) }
    }

    /// Stands in for a real provider when no API key is configured, so the
    /// binary can still come up for local smoke testing (spec §4.5 needs a
    /// real provider in production; this is a deliberate non-production gap).
    pub fn echo() -> Self {
        Self { behavior: Behavior::Echo, calls: AtomicUsize::new(0), seen: Mutex::new(Vec::new()) }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Models requested, in call order — useful for asserting fallback order.
    pub fn models_seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelAdapter for MockAdapter {
    async fn stream(&self, model: &str, messages: &[Message], mut on_chunk: ChunkSink<'_>) -> AppResult<String> {
        let call_index = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(model.to_string());

        match &self.behavior {
            Behavior::FailsThenSucceeds { fail_count, text } => {
                if call_index < *fail_count {
                    Err(AppError::ProviderUnavailable(format!("model {model} unavailable")))
                } else {
                    on_chunk(text);
                    Ok(text.clone())
                }
            }
            Behavior::AlwaysUnavailable => Err(AppError::ProviderUnavailable(format!("model {model} unavailable"))),
            Behavior::InvalidCredentials => Err(AppError::Auth("invalid api key".to_string())),
            Behavior::Echo => {
                let text = messages.last().map(|m| m.content.clone()).unwrap_or_default();
                on_chunk(&text);
                Ok(text)
            }
        }
    }
}
