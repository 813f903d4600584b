// src/provider/stream.rs
// Stream event types for SSE-based provider streaming, adapted from the
// teacher's `llm/provider/stream.rs` line-parsing approach.

use serde_json::Value;

#[derive(Debug, Clone)]
pub enum StreamEvent {
    TextDelta { delta: String },
    Done { final_text: Option<String> },
    Error { message: String },
}

impl StreamEvent {
    /// Parses one `data: {...}` SSE line in an OpenAI Responses-API-style
    /// event stream. Returns `None` for lines that carry no actionable event
    /// (keep-alive comments, the `[DONE]` sentinel already handled upstream).
    pub fn from_openai_sse_line(line: &str) -> Option<Self> {
        let data = line.strip_prefix("data: ")?;
        if data == "[DONE]" {
            return Some(StreamEvent::Done { final_text: None });
        }

        let json: Value = serde_json::from_str(data).ok()?;

        if let Some(error) = json.get("error") {
            return Some(StreamEvent::Error {
                message: error["message"].as_str().unwrap_or("unknown error").to_string(),
            });
        }

        if let Some(delta) = json.pointer("/choices/0/delta/content").and_then(|d| d.as_str()) {
            return Some(StreamEvent::TextDelta { delta: delta.to_string() });
        }

        if json.get("choices").and_then(|c| c.get(0)).and_then(|c| c.get("finish_reason")).and_then(|f| f.as_str()).is_some() {
            return Some(StreamEvent::Done { final_text: None });
        }

        None
    }

    /// Parses one `data: {...}` SSE line in an Anthropic Messages-API-style
    /// event stream.
    pub fn from_anthropic_sse_line(line: &str) -> Option<Self> {
        let data = line.strip_prefix("data: ")?;
        let json: Value = serde_json::from_str(data).ok()?;

        match json.get("type").and_then(|t| t.as_str()) {
            Some("content_block_delta") => {
                let delta = json.pointer("/delta/text")?.as_str()?.to_string();
                Some(StreamEvent::TextDelta { delta })
            }
            Some("message_stop") => Some(StreamEvent::Done { final_text: None }),
            Some("error") => Some(StreamEvent::Error {
                message: json.pointer("/error/message").and_then(|m| m.as_str()).unwrap_or("unknown error").to_string(),
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_text_delta() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#;
        match StreamEvent::from_openai_sse_line(line) {
            Some(StreamEvent::TextDelta { delta }) => assert_eq!(delta, "Hello"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn openai_done_sentinel() {
        assert!(matches!(StreamEvent::from_openai_sse_line("data: [DONE]"), Some(StreamEvent::Done { .. })));
    }

    #[test]
    fn anthropic_text_delta() {
        let line = r#"data: {"type":"content_block_delta","delta":{"text":"Hi"}}"#;
        match StreamEvent::from_anthropic_sse_line(line) {
            Some(StreamEvent::TextDelta { delta }) => assert_eq!(delta, "Hi"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn non_data_lines_are_ignored() {
        assert!(StreamEvent::from_openai_sse_line(": keep-alive").is_none());
        assert!(StreamEvent::from_anthropic_sse_line("event: ping").is_none());
    }
}
