// src/provider/openai_style.rs
// Adapter for OpenAI-compatible chat-completions streaming endpoints, built
// the way the teacher's reqwest-based streaming clients are: a byte stream
// chunked into lines, each line handed to the shared SSE decoder.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::json;

use super::stream::StreamEvent;
use super::{ChunkSink, Message, ModelAdapter};
use crate::error::{AppError, AppResult};

pub struct OpenAiStyleAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiStyleAdapter {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), base_url: base_url.into(), api_key: api_key.into() }
    }
}

#[async_trait]
impl ModelAdapter for OpenAiStyleAdapter {
    async fn stream(&self, model: &str, messages: &[Message], mut on_chunk: ChunkSink<'_>) -> AppResult<String> {
        let body = json!({
            "model": model,
            "stream": true,
            "messages": messages.iter().map(|m| json!({"role": m.role, "content": m.content})).collect::<Vec<_>>(),
        });

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::Transient(format!("request to {model} failed: {e}")))?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(AppError::Auth(format!("provider rejected credentials for {model}")));
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(AppError::ProviderUnavailable(format!("model {model} not found")));
        }
        if status.as_u16() == 429 {
            return Err(AppError::RateLimited { retry_after_secs: 60 });
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AppError::ProviderUnavailable(format!("{model} returned {status}: {text}")));
        }

        let mut full = String::new();
        let mut buf = String::new();
        let mut byte_stream = resp.bytes_stream();

        while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk.map_err(|e| AppError::Transient(format!("stream read failed: {e}")))?;
            buf.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buf.find('\n') {
                let line = buf[..pos].trim_end_matches('\r').to_string();
                buf.drain(..=pos);
                if line.is_empty() {
                    continue;
                }
                match StreamEvent::from_openai_sse_line(&line) {
                    Some(StreamEvent::TextDelta { delta }) => {
                        on_chunk(&delta);
                        full.push_str(&delta);
                    }
                    Some(StreamEvent::Done { .. }) => return Ok(full),
                    Some(StreamEvent::Error { message }) => {
                        return Err(AppError::ProviderUnavailable(format!("{model} stream error: {message}")));
                    }
                    None => {}
                }
            }
        }

        Ok(full)
    }
}
