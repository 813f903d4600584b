// src/questions/mod.rs
// C8: Question Engine. Generates a structured multi-select QuestionSet for a
// completed round via the same LogicalProvider used for persona turns,
// asking it to emit a small JSON schema rather than free text — grounded in
// the teacher's `tools/core/experts/plan.rs::parse_json_with_retry` (ask the
// model for JSON matching a described shape, parse, retry the call on
// failure), generalized from research-plan/review JSON to a question-set
// JSON shape.

use serde::Deserialize;

use crate::error::{AppError, AppResult};
use crate::model::{Option_, Question, QuestionSet, Round};
use crate::provider::{LogicalProvider, Message};

const MIN_OPTIONS: usize = 2;
const MAX_OPTIONS: usize = 6;

#[derive(Debug, Deserialize)]
struct RawQuestion {
    prompt: String,
    options: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawQuestionList {
    questions: Vec<RawQuestion>,
}

fn render_round(round: &Round) -> String {
    let mut out = format!("Round {}\n", round.round_number);
    for (label, slot) in [
        ("Analyzer", &round.analyzer_response),
        ("Solver", &round.solver_response),
        ("Moderator", &round.moderator_response),
    ] {
        if let Some(resp) = slot {
            out.push_str(&format!("{label}: {}\n", resp.content));
        }
    }
    out
}

fn build_prompt(round: &Round) -> Vec<Message> {
    let system = Message::system(
        "You generate steering questions for a human observing a multi-persona discussion. \
         Respond with JSON only, matching exactly: \
         {\"questions\":[{\"prompt\":\"...\",\"options\":[\"...\", \"...\"]}]}. \
         Produce 1-4 questions. Each question needs 2 to 6 short options. Each question's \
         prompt must reference specific content from the round below, not generic phrasing.",
    );
    let user = Message::user(format!("{}\nEmit the JSON now, nothing else.", render_round(round)));
    vec![system, user]
}

fn parse_and_validate(raw: &str, round_number: i64) -> AppResult<QuestionSet> {
    let parsed: RawQuestionList = serde_json::from_str(raw.trim())
        .map_err(|e| AppError::Internal(format!("question engine returned unparseable JSON: {e}")))?;

    if parsed.questions.is_empty() {
        return Err(AppError::Internal("question engine returned zero questions".to_string()));
    }

    let questions = parsed
        .questions
        .into_iter()
        .enumerate()
        .map(|(i, raw)| {
            if raw.options.len() < MIN_OPTIONS || raw.options.len() > MAX_OPTIONS {
                return Err(AppError::Internal(format!(
                    "question {} has {} options, must be {MIN_OPTIONS}-{MAX_OPTIONS}",
                    i + 1,
                    raw.options.len()
                )));
            }
            let options = raw
                .options
                .into_iter()
                .enumerate()
                .map(|(j, text)| Option_ { id: option_id(i, j), text })
                .collect();
            Ok(Question { id: format!("Q{}", i + 1), prompt: raw.prompt, options, selected: None })
        })
        .collect::<AppResult<Vec<_>>>()?;

    Ok(QuestionSet { round_number, questions })
}

fn option_id(question_index: usize, option_index: usize) -> String {
    let letter = (b'A' + option_index as u8) as char;
    format!("Q{}-{}", question_index + 1, letter)
}

/// Generates a QuestionSet for `round` (expected to be the most recent
/// complete round; callers pick which round). Retries the generation call
/// once on a malformed response before giving up.
pub async fn generate(round: &Round, provider: &LogicalProvider) -> AppResult<QuestionSet> {
    if !round.is_complete() {
        return Err(AppError::Input(format!("round {} is not complete, cannot generate questions", round.round_number)));
    }

    let messages = build_prompt(round);

    let mut last_err = None;
    for _ in 0..2 {
        let raw = provider.stream(&messages, Box::new(|_| {})).await?;
        match parse_and_validate(&raw, round.round_number) {
            Ok(set) => return Ok(set),
            Err(e) => {
                tracing::warn!(error = %e, "question engine response failed validation, retrying once");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| AppError::Internal("question engine exhausted retries".to_string())))
}
