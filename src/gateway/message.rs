// src/gateway/message.rs
// Wire types for the duplex gateway protocol (spec §4.9, §6). Inbound/outbound
// shapes are tagged enums the way the teacher's `api/ws/message.rs` models
// `WsClientMessage`/`WsServerMessage`, generalized from open chat events to
// the fixed start/proceed/generate-questions/submit-answers surface.

use std::collections::HashMap;
use uuid::Uuid;

use serde::{Deserialize, Serialize};

use crate::model::{FileAttachment, QuestionSet, Round, Summary};
use crate::scheduler::OutboundEvent;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum WsClientMessage {
    StartDialogue {
        topic: String,
        #[serde(default)]
        files: Vec<FileAttachment>,
        /// Only honored when the session has no identity from the bearer
        /// shim (spec §9's thin auth edge); an authenticated session's own
        /// id always wins, so a client cannot spoof another user's id.
        #[serde(default)]
        user_id: Option<String>,
        #[serde(default)]
        request_id: Option<String>,
    },
    ProceedDialogue {
        discussion_id: Uuid,
        #[serde(default)]
        request_id: Option<String>,
    },
    GenerateQuestions {
        discussion_id: Uuid,
        #[serde(default)]
        round_number: Option<i64>,
        #[serde(default)]
        request_id: Option<String>,
    },
    SubmitAnswers {
        discussion_id: Uuid,
        round_number: i64,
        answers: HashMap<String, Vec<String>>,
        #[serde(default)]
        request_id: Option<String>,
    },
}

impl WsClientMessage {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            WsClientMessage::StartDialogue { request_id, .. }
            | WsClientMessage::ProceedDialogue { request_id, .. }
            | WsClientMessage::GenerateQuestions { request_id, .. }
            | WsClientMessage::SubmitAnswers { request_id, .. } => request_id.as_deref(),
        }
    }

    pub fn discussion_id(&self) -> Option<Uuid> {
        match self {
            WsClientMessage::StartDialogue { .. } => None,
            WsClientMessage::ProceedDialogue { discussion_id, .. }
            | WsClientMessage::GenerateQuestions { discussion_id, .. }
            | WsClientMessage::SubmitAnswers { discussion_id, .. } => Some(*discussion_id),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum WsServerMessage {
    Ack { request_id: String },
    DiscussionStarted { discussion_id: Uuid },
    MessageStart { discussion_id: Uuid, persona: crate::model::Persona, turn: i64 },
    MessageChunk { discussion_id: Uuid, chunk: String },
    MessageComplete { discussion_id: Uuid, message: crate::model::Response },
    RoundComplete { discussion_id: Uuid, round: Round },
    QuestionsGenerated { discussion_id: Uuid, question_set: QuestionSet },
    SummaryCreated { discussion_id: Uuid, summary: Summary },
    ConversationResolved {
        discussion_id: Uuid,
        solution: Option<String>,
        confidence: f64,
        reason: Option<String>,
    },
    Error { code: String, message: String, discussion_id: Option<Uuid> },
}

impl WsServerMessage {
    /// Lifts a scheduler `OutboundEvent` into its wire form (spec §9's
    /// Scheduler/Event-Bus seam — the gateway is the only thing that knows
    /// about the wire).
    pub fn from_event(discussion_id: Uuid, event: OutboundEvent) -> Self {
        match event {
            OutboundEvent::DiscussionStarted { discussion_id } => WsServerMessage::DiscussionStarted { discussion_id },
            OutboundEvent::MessageStart { persona, turn } => WsServerMessage::MessageStart { discussion_id, persona, turn },
            OutboundEvent::MessageChunk { chunk } => WsServerMessage::MessageChunk { discussion_id, chunk },
            OutboundEvent::MessageComplete { response } => WsServerMessage::MessageComplete { discussion_id, message: response },
            OutboundEvent::RoundComplete { round } => WsServerMessage::RoundComplete { discussion_id, round },
            OutboundEvent::QuestionsGenerated { question_set } => WsServerMessage::QuestionsGenerated { discussion_id, question_set },
            OutboundEvent::SummaryCreated { summary } => WsServerMessage::SummaryCreated { discussion_id, summary },
            OutboundEvent::ConversationResolved { solution, confidence, reason } => {
                WsServerMessage::ConversationResolved { discussion_id, solution, confidence, reason }
            }
            OutboundEvent::Error { code, message, discussion_id: did } => {
                WsServerMessage::Error { code, message, discussion_id: did.or(Some(discussion_id)) }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_start_dialogue_without_optional_fields() {
        let raw = r#"{"type":"start-dialogue","topic":"Design a cache eviction policy"}"#;
        let msg: WsClientMessage = serde_json::from_str(raw).unwrap();
        match msg {
            WsClientMessage::StartDialogue { topic, files, user_id, request_id } => {
                assert_eq!(topic, "Design a cache eviction policy");
                assert!(files.is_empty());
                assert!(user_id.is_none());
                assert!(request_id.is_none());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_submit_answers_with_camel_case_fields_and_request_id() {
        let raw = r#"{"type":"submit-answers","discussionId":"00000000-0000-0000-0000-000000000000","roundNumber":1,"answers":{"Q1":["A"]},"requestId":"r1"}"#;
        let msg: WsClientMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.request_id(), Some("r1"));
        assert_eq!(msg.discussion_id(), Some(Uuid::nil()));
    }

    #[test]
    fn server_event_serializes_with_kebab_case_tag_and_camel_case_fields() {
        let msg = WsServerMessage::MessageStart { discussion_id: Uuid::nil(), persona: crate::model::Persona::Analyzer, turn: 1 };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "message-start");
        assert_eq!(json["discussionId"], "00000000-0000-0000-0000-000000000000");
    }
}
