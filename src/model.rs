// src/model.rs
// Core data model: Discussion, Round, Response, Summary, QuestionSet.
// Wire representation is camelCase to match the journal schema (spec §6);
// Rust field names stay snake_case.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// The three personas, in their canonical execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Persona {
    Analyzer,
    Solver,
    Moderator,
}

impl Persona {
    /// 1/2/3 position within a round, used for turn numbering.
    pub fn position(self) -> i64 {
        match self {
            Persona::Analyzer => 1,
            Persona::Solver => 2,
            Persona::Moderator => 3,
        }
    }

    pub fn next(self) -> Option<Persona> {
        match self {
            Persona::Analyzer => Some(Persona::Solver),
            Persona::Solver => Some(Persona::Moderator),
            Persona::Moderator => None,
        }
    }
}

/// `turn = (round_number - 1) * 3 + position`
pub fn turn_for(round_number: i64, persona: Persona) -> i64 {
    (round_number - 1) * 3 + persona.position()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub persona: Persona,
    pub content: String,
    pub turn: i64,
    pub timestamp: i64,
}

/// A single round: three response slots in canonical order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Round {
    pub round_number: i64,
    pub timestamp: i64,
    pub analyzer_response: Option<Response>,
    pub solver_response: Option<Response>,
    pub moderator_response: Option<Response>,
    pub question_set_round: Option<i64>,
}

impl Round {
    pub fn new(round_number: i64, timestamp: i64) -> Self {
        Self {
            round_number,
            timestamp,
            analyzer_response: None,
            solver_response: None,
            moderator_response: None,
            question_set_round: None,
        }
    }

    /// Complete iff all three slots are non-empty after trimming.
    pub fn is_complete(&self) -> bool {
        [&self.analyzer_response, &self.solver_response, &self.moderator_response]
            .iter()
            .all(|slot| slot.as_ref().is_some_and(|r| !r.content.trim().is_empty()))
    }

    /// Empty iff none of the three slots are populated.
    pub fn is_empty(&self) -> bool {
        self.analyzer_response.is_none() && self.solver_response.is_none() && self.moderator_response.is_none()
    }

    pub fn slot(&self, persona: Persona) -> Option<&Response> {
        match persona {
            Persona::Analyzer => self.analyzer_response.as_ref(),
            Persona::Solver => self.solver_response.as_ref(),
            Persona::Moderator => self.moderator_response.as_ref(),
        }
    }

    pub fn set_slot(&mut self, persona: Persona, response: Response) {
        match persona {
            Persona::Analyzer => self.analyzer_response = Some(response),
            Persona::Solver => self.solver_response = Some(response),
            Persona::Moderator => self.moderator_response = Some(response),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub round_number: i64,
    pub replaces_rounds: Vec<i64>,
    pub summary: String,
    pub token_count_before: i64,
    pub token_count_after: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Option_ {
    pub id: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub id: String,
    pub prompt: String,
    pub options: Vec<Option_>,
    #[serde(default)]
    pub selected: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionSet {
    pub round_number: i64,
    pub questions: Vec<Question>,
}

impl QuestionSet {
    pub fn record_answers(&mut self, answers: &HashMap<String, Vec<String>>) -> Result<(), String> {
        for key in answers.keys() {
            if !self.questions.iter().any(|q| &q.id == key) {
                return Err(format!("unknown question_id: {key}"));
            }
        }
        for q in &mut self.questions {
            if let Some(sel) = answers.get(&q.id) {
                q.selected = Some(sel.clone());
            }
        }
        Ok(())
    }
}

/// A file attached to a discussion at `start-dialogue` time. Only name/type/size
/// participate in the assembled context manifest (spec §4.4); `extracted_text`
/// is filled in by the external PDF extractor (out of scope per spec §1) and is
/// otherwise `None`, in which case non-PDF files fall back to the manifest form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAttachment {
    pub name: String,
    pub content_type: String,
    pub size: u64,
    #[serde(default)]
    pub extracted_text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Discussion {
    pub id: Uuid,
    pub topic: String,
    pub user_id: String,
    pub rounds: Vec<Round>,
    pub summaries: Vec<Summary>,
    pub questions: Vec<QuestionSet>,
    #[serde(default)]
    pub files: Vec<FileAttachment>,
    pub current_round: i64,
    pub is_resolved: bool,
    pub created_at: i64,
    pub updated_at: i64,
    pub token_budget: i64,
    pub last_token_count: i64,
    /// Legacy fields kept for schema compatibility with spec §6.
    #[serde(default)]
    pub messages: Vec<serde_json::Value>,
    #[serde(default)]
    pub legacy_summary: Option<String>,
}

impl Discussion {
    pub fn new(id: Uuid, user_id: String, topic: String, token_budget: i64, now: i64) -> Self {
        Self {
            id,
            topic,
            user_id,
            rounds: Vec::new(),
            summaries: Vec::new(),
            questions: Vec::new(),
            files: Vec::new(),
            current_round: 0,
            is_resolved: false,
            created_at: now,
            updated_at: now,
            token_budget,
            last_token_count: 0,
            messages: Vec::new(),
            legacy_summary: None,
        }
    }

    pub fn round(&self, round_number: i64) -> Option<&Round> {
        self.rounds.iter().find(|r| r.round_number == round_number)
    }

    pub fn round_mut(&mut self, round_number: i64) -> Option<&mut Round> {
        self.rounds.iter_mut().find(|r| r.round_number == round_number)
    }

    pub fn current_summary(&self) -> Option<&Summary> {
        self.summaries.last()
    }

    pub fn latest_complete_round(&self) -> Option<&Round> {
        self.rounds.iter().rev().find(|r| r.is_complete())
    }

    /// Recompute turn numbers for every response in order; returns true if any drifted.
    pub fn repair_turn_numbers(&mut self) -> bool {
        let mut drifted = false;
        for round in &mut self.rounds {
            for persona in [Persona::Analyzer, Persona::Solver, Persona::Moderator] {
                let expected = turn_for(round.round_number, persona);
                if let Some(resp) = match persona {
                    Persona::Analyzer => round.analyzer_response.as_mut(),
                    Persona::Solver => round.solver_response.as_mut(),
                    Persona::Moderator => round.moderator_response.as_mut(),
                } {
                    if resp.turn != expected {
                        resp.turn = expected;
                        drifted = true;
                    }
                }
            }
        }
        drifted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_completeness() {
        let mut round = Round::new(1, 0);
        assert!(round.is_empty());
        assert!(!round.is_complete());

        round.set_slot(Persona::Analyzer, Response {
            persona: Persona::Analyzer,
            content: "a".into(),
            turn: 1,
            timestamp: 0,
        });
        assert!(!round.is_empty());
        assert!(!round.is_complete());

        round.set_slot(Persona::Solver, Response { persona: Persona::Solver, content: "b".into(), turn: 2, timestamp: 0 });
        round.set_slot(Persona::Moderator, Response { persona: Persona::Moderator, content: "  ".into(), turn: 3, timestamp: 0 });
        assert!(!round.is_complete(), "whitespace-only moderator slot should not count as complete");
    }

    #[test]
    fn turn_numbering() {
        assert_eq!(turn_for(1, Persona::Analyzer), 1);
        assert_eq!(turn_for(1, Persona::Moderator), 3);
        assert_eq!(turn_for(2, Persona::Analyzer), 4);
        assert_eq!(turn_for(6, Persona::Moderator), 18);
    }

    #[test]
    fn question_set_rejects_unknown_ids() {
        let mut qs = QuestionSet {
            round_number: 1,
            questions: vec![Question {
                id: "Q1".into(),
                prompt: "p".into(),
                options: vec![Option_ { id: "A".into(), text: "a".into() }],
                selected: None,
            }],
        };
        let mut answers = HashMap::new();
        answers.insert("Q2".to_string(), vec!["A".to_string()]);
        assert!(qs.record_answers(&answers).is_err());

        let mut ok = HashMap::new();
        ok.insert("Q1".to_string(), vec!["A".to_string()]);
        assert!(qs.record_answers(&ok).is_ok());
        assert_eq!(qs.questions[0].selected.as_ref().unwrap(), &vec!["A".to_string()]);
    }
}
