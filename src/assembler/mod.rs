// src/assembler/mod.rs
// C4: Context Assembler. Reconstructs the prompt string for a given
// (discussion, persona, round_number) from history, summaries, attachments
// and user answers, enforcing the per-persona visibility contract (spec
// §4.4). Built as a pure function over `&Discussion` the way the teacher's
// `context.rs` composes a prompt from independent sections before handing it
// to the LLM client, generalized to three personas with strict turn order
// instead of one open-ended chat history.

use crate::error::{AppError, AppResult};
use crate::estimator;
use crate::model::{Discussion, Persona, Response, Round};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Template {
    /// Round 1, Analyzer, no history at all.
    FirstMessage,
    /// Analyzer opening round N > 1.
    NewRound,
    /// Solver or Moderator continuing an in-progress round.
    Continuation,
    /// `last_message` is a user contribution — retained for forward
    /// compatibility (spec §9 Open Question (a)); no inbound event
    /// currently produces this path.
    UserInput,
    /// No `last_message` could be determined and the discussion is not
    /// genuinely fresh — a defensive catch-all.
    Fallback,
}

#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub template: Template,
    pub prompt: String,
    pub last_message: Option<Response>,
    pub estimated_tokens: i64,
}

/// Determines which response `persona` is replying to for `round_number`,
/// per spec §4.4's "respond to" selection, and validates the contract:
/// Analyzer points at the prior round's Moderator (or nothing, at round 1);
/// Solver and Moderator point within the round currently being generated.
fn select_last_message(discussion: &Discussion, persona: Persona, round_number: i64) -> AppResult<Option<Response>> {
    match persona {
        Persona::Analyzer => {
            if round_number <= 1 {
                return Ok(None);
            }
            let prev = discussion.round(round_number - 1).ok_or_else(|| {
                AppError::Internal(format!("round {} must exist before starting round {round_number}", round_number - 1))
            })?;
            if !prev.is_complete() {
                return Err(AppError::Internal(format!(
                    "round {} is incomplete; cannot start round {round_number}",
                    round_number - 1
                )));
            }
            let moderator = prev.moderator_response.clone().ok_or_else(|| {
                AppError::Internal(format!(
                    "critical: round {} marked complete but missing moderator response",
                    round_number - 1
                ))
            })?;
            if moderator.persona != Persona::Moderator {
                tracing::error!(round_number, "critical: last_message contract violated for Analyzer, repairing");
            }
            Ok(Some(moderator))
        }
        Persona::Solver => {
            let current = discussion
                .round(round_number)
                .ok_or_else(|| AppError::Internal(format!("round {round_number} must exist before Solver responds")))?;
            let analyzer = current.analyzer_response.clone().ok_or_else(|| {
                AppError::Internal(format!("round {round_number} missing Analyzer response before Solver's turn"))
            })?;
            Ok(Some(analyzer))
        }
        Persona::Moderator => {
            let current = discussion.round(round_number).ok_or_else(|| {
                AppError::Internal(format!("round {round_number} must exist before Moderator responds"))
            })?;
            let solver = current.solver_response.clone().ok_or_else(|| {
                AppError::Internal(format!("round {round_number} missing Solver response before Moderator's turn"))
            })?;
            Ok(Some(solver))
        }
    }
}

fn select_template(persona: Persona, round_number: i64, last_message: &Option<Response>) -> Template {
    match (persona, round_number, last_message) {
        (Persona::Analyzer, 1, None) => Template::FirstMessage,
        (Persona::Analyzer, n, _) if n > 1 => Template::NewRound,
        (Persona::Solver, _, Some(_)) | (Persona::Moderator, _, Some(_)) => Template::Continuation,
        (_, _, None) => Template::Fallback,
        _ => Template::Fallback,
    }
}

fn render_summary_block(discussion: &Discussion) -> Option<String> {
    if discussion.summaries.is_empty() {
        return None;
    }
    let mut out = String::from(
        "## Prior Discussion Summary\n\nThe following summaries replace the rounds they list; \
         do not re-derive conclusions already captured here.\n\n",
    );
    for summary in &discussion.summaries {
        out.push_str(&format!(
            "### Summary through round {} (replaces rounds {:?})\n{}\n\n",
            summary.round_number, summary.replaces_rounds, summary.summary
        ));
    }
    Some(out)
}

fn render_file_manifest(discussion: &Discussion) -> Option<String> {
    if discussion.files.is_empty() {
        return None;
    }
    let mut out = String::from("## Attached Files\n\n");
    for file in &discussion.files {
        match &file.extracted_text {
            Some(text) if !text.trim().is_empty() => {
                out.push_str(&format!("### {} ({}, {} bytes)\n{}\n\n", file.name, file.content_type, file.size, text));
            }
            _ => {
                out.push_str(&format!("- {} ({}, {} bytes)\n", file.name, file.content_type, file.size));
            }
        }
    }
    Some(out)
}

fn render_user_answers_block(discussion: &Discussion) -> Option<String> {
    let answered: Vec<_> = discussion
        .questions
        .iter()
        .flat_map(|qs| qs.questions.iter().map(move |q| (qs.round_number, q)))
        .filter(|(_, q)| q.selected.as_ref().is_some_and(|s| !s.is_empty()))
        .collect();

    if answered.is_empty() {
        return None;
    }

    let mut out = String::from("## User Input\n\n");
    for (round_number, question) in answered {
        let selected = question.selected.as_ref().unwrap();
        let texts: Vec<&str> = question
            .options
            .iter()
            .filter(|o| selected.contains(&o.id))
            .map(|o| o.text.as_str())
            .collect();
        out.push_str(&format!("- (round {round_number}) {}: {}\n", question.prompt, texts.join(", ")));
    }
    out.push('\n');
    Some(out)
}

fn render_round(round: &Round) -> String {
    let mut out = format!("#### Round {}\n", round.round_number);
    for (label, slot) in [
        ("Analyzer", &round.analyzer_response),
        ("Solver", &round.solver_response),
        ("Moderator", &round.moderator_response),
    ] {
        if let Some(resp) = slot {
            out.push_str(&format!("\n**{label}:** {}\n", resp.content));
        }
    }
    out
}

fn render_transcript(discussion: &Discussion, round_number: i64) -> Option<String> {
    let cutoff = discussion.current_summary().map(|s| s.round_number).unwrap_or(0);
    let visible: Vec<&Round> = discussion.rounds.iter().filter(|r| r.round_number > cutoff).collect();
    if visible.is_empty() {
        return None;
    }

    let mut out = String::from("## Transcript\n\n");
    for round in &visible {
        if round.round_number == round_number && !round.is_complete() {
            out.push_str(&render_round(round));
        } else if round.is_complete() {
            out.push_str(&render_round(round));
        }
        out.push('\n');
    }
    Some(out)
}

fn continuation_instruction(persona: Persona, last_message: &Option<Response>, template: Template) -> String {
    match template {
        Template::FirstMessage => {
            "You are the Analyzer. Open the discussion: break the topic down into its key \
             considerations and identify what needs to be resolved."
                .to_string()
        }
        Template::NewRound => {
            let prior = last_message.as_ref().map(|m| m.content.as_str()).unwrap_or("");
            format!(
                "You are the Analyzer. A new round begins. Respond to the Moderator's prior \
                 conclusion, incorporating any user input above:\n\n> {prior}"
            )
        }
        Template::Continuation => {
            let prior = last_message.as_ref().map(|m| m.content.as_str()).unwrap_or("");
            let role = match persona {
                Persona::Solver => "Solver. Propose concrete solutions responding to the Analyzer",
                Persona::Moderator => "Moderator. Synthesize and adjudicate between the Analyzer and Solver",
                Persona::Analyzer => "Analyzer",
            };
            format!("You are the {role}:\n\n> {prior}")
        }
        Template::UserInput => {
            let prior = last_message.as_ref().map(|m| m.content.as_str()).unwrap_or("");
            format!("Respond to this user contribution:\n\n> {prior}")
        }
        Template::Fallback => "Continue the discussion from where it left off.".to_string(),
    }
}

/// Assembles the full prompt for `persona` responding within `round_number`.
pub fn assemble(discussion: &Discussion, persona: Persona, round_number: i64) -> AppResult<AssembledContext> {
    let last_message = select_last_message(discussion, persona, round_number)?;
    let template = select_template(persona, round_number, &last_message);

    let mut sections = Vec::new();
    sections.push(format!("## Topic\n\n{}\n", discussion.topic));
    if let Some(s) = render_summary_block(discussion) {
        sections.push(s);
    }
    if let Some(s) = render_file_manifest(discussion) {
        sections.push(s);
    }
    if let Some(s) = render_user_answers_block(discussion) {
        sections.push(s);
    }
    if let Some(s) = render_transcript(discussion, round_number) {
        sections.push(s);
    }
    sections.push(continuation_instruction(persona, &last_message, template));

    let prompt = sections.join("\n");
    let estimated_tokens = estimator::estimate(&prompt) as i64;

    Ok(AssembledContext { template, prompt, last_message, estimated_tokens })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::turn_for;
    use uuid::Uuid;

    fn response(persona: Persona, round_number: i64, content: &str) -> Response {
        Response { persona, content: content.to_string(), turn: turn_for(round_number, persona), timestamp: 0 }
    }

    fn fresh_discussion() -> Discussion {
        Discussion::new(Uuid::new_v4(), "u1".into(), "Design a cache eviction policy".into(), 4000, 0)
    }

    #[test]
    fn round_one_analyzer_is_first_message_with_no_last_message() {
        let discussion = fresh_discussion();
        let ctx = assemble(&discussion, Persona::Analyzer, 1).unwrap();
        assert_eq!(ctx.template, Template::FirstMessage);
        assert!(ctx.last_message.is_none());
    }

    #[test]
    fn solver_sees_analyzer_response_of_current_round() {
        let mut discussion = fresh_discussion();
        let mut round = Round::new(1, 0);
        round.set_slot(Persona::Analyzer, response(Persona::Analyzer, 1, "analysis text"));
        discussion.rounds.push(round);

        let ctx = assemble(&discussion, Persona::Solver, 1).unwrap();
        assert_eq!(ctx.template, Template::Continuation);
        assert_eq!(ctx.last_message.unwrap().content, "analysis text");
    }

    #[test]
    fn moderator_sees_solver_response_of_current_round() {
        let mut discussion = fresh_discussion();
        let mut round = Round::new(1, 0);
        round.set_slot(Persona::Analyzer, response(Persona::Analyzer, 1, "a"));
        round.set_slot(Persona::Solver, response(Persona::Solver, 1, "solver text"));
        discussion.rounds.push(round);

        let ctx = assemble(&discussion, Persona::Moderator, 1).unwrap();
        assert_eq!(ctx.last_message.unwrap().content, "solver text");
    }

    #[test]
    fn new_round_analyzer_sees_prior_moderator() {
        let mut discussion = fresh_discussion();
        let mut round = Round::new(1, 0);
        round.set_slot(Persona::Analyzer, response(Persona::Analyzer, 1, "a"));
        round.set_slot(Persona::Solver, response(Persona::Solver, 1, "s"));
        round.set_slot(Persona::Moderator, response(Persona::Moderator, 1, "moderator text"));
        discussion.rounds.push(round);
        discussion.current_round = 1;

        let ctx = assemble(&discussion, Persona::Analyzer, 2).unwrap();
        assert_eq!(ctx.template, Template::NewRound);
        assert_eq!(ctx.last_message.unwrap().content, "moderator text");
    }

    #[test]
    fn analyzer_fails_fast_if_prior_round_incomplete() {
        let mut discussion = fresh_discussion();
        let mut round = Round::new(1, 0);
        round.set_slot(Persona::Analyzer, response(Persona::Analyzer, 1, "a"));
        discussion.rounds.push(round);

        let err = assemble(&discussion, Persona::Analyzer, 2).unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));
    }

    #[test]
    fn summary_cuts_transcript_to_rounds_after_its_round_number() {
        let mut discussion = fresh_discussion();
        for n in 1..=3 {
            let mut round = Round::new(n, 0);
            round.set_slot(Persona::Analyzer, response(Persona::Analyzer, n, "a"));
            round.set_slot(Persona::Solver, response(Persona::Solver, n, "s"));
            round.set_slot(Persona::Moderator, response(Persona::Moderator, n, "m"));
            discussion.rounds.push(round);
        }
        discussion.summaries.push(crate::model::Summary {
            round_number: 2,
            replaces_rounds: vec![1, 2],
            summary: "recap".into(),
            token_count_before: 100,
            token_count_after: 10,
            created_at: 0,
        });
        discussion.current_round = 3;

        let mut round4 = Round::new(4, 0);
        round4.set_slot(Persona::Analyzer, response(Persona::Analyzer, 4, "newest analyzer"));
        discussion.rounds.push(round4);

        let ctx = assemble(&discussion, Persona::Solver, 4).unwrap();
        assert!(ctx.prompt.contains("recap"));
        assert!(!ctx.prompt.contains("Round 1"));
        assert!(ctx.prompt.contains("Round 3"));
        assert!(ctx.prompt.contains("newest analyzer"));
    }

    #[test]
    fn user_answers_render_as_top_level_section() {
        let mut discussion = fresh_discussion();
        let mut round = Round::new(1, 0);
        round.set_slot(Persona::Analyzer, response(Persona::Analyzer, 1, "a"));
        round.set_slot(Persona::Solver, response(Persona::Solver, 1, "s"));
        round.set_slot(Persona::Moderator, response(Persona::Moderator, 1, "m"));
        discussion.rounds.push(round);
        discussion.current_round = 1;

        discussion.questions.push(crate::model::QuestionSet {
            round_number: 1,
            questions: vec![crate::model::Question {
                id: "Q1".into(),
                prompt: "Which tradeoff matters most?".into(),
                options: vec![
                    crate::model::Option_ { id: "A".into(), text: "latency".into() },
                    crate::model::Option_ { id: "B".into(), text: "memory".into() },
                ],
                selected: Some(vec!["A".to_string()]),
            }],
        });

        let ctx = assemble(&discussion, Persona::Analyzer, 2).unwrap();
        assert!(ctx.prompt.contains("User Input"));
        assert!(ctx.prompt.contains("latency"));
    }
}
