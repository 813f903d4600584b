// src/summarizer/mod.rs
// C7: Summarizer. Monitors the token budget and, once crossed, compacts the
// currently-visible rounds into a single prose Summary via the same
// LogicalProvider used for persona turns — grounded in the teacher's
// `web/chat/summarization.rs` rolling summarization (threshold-triggered,
// prompt-driven compaction of older turns) and `session/summary_generator.rs`
// (LLM-backed summary generation over a completed unit of conversation),
// generalized from a rolling message window to round-numbered,
// chain-invariant Summaries (spec §3, §4.6).

use crate::error::AppResult;
use crate::estimator;
use crate::model::{Discussion, Round, Summary};
use crate::provider::{LogicalProvider, Message};

/// Whether a summarization pass should run before the next action is
/// accepted, given the token count just recorded after a completed round.
pub fn should_summarize(current_token_count: i64, budget: i64) -> bool {
    estimator::threshold_reached(current_token_count, budget)
}

/// The rounds a summarization pass should fold in: every round visible to
/// the assembler (spec §4.4's inclusion rule) that is complete. Incomplete
/// rounds never participate — summarization only ever follows a complete
/// round append.
fn rounds_to_fold(discussion: &Discussion) -> Vec<&Round> {
    let cutoff = discussion.current_summary().map(|s| s.round_number).unwrap_or(0);
    discussion.rounds.iter().filter(|r| r.round_number > cutoff && r.is_complete()).collect()
}

fn render_round_block(round: &Round) -> String {
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

fn render_user_answers(discussion: &Discussion, round_numbers: &[i64]) -> Option<String> {
    let lines: Vec<String> = discussion
        .questions
        .iter()
        .filter(|qs| round_numbers.contains(&qs.round_number))
        .flat_map(|qs| qs.questions.iter())
        .filter_map(|q| {
            let selected = q.selected.as_ref()?;
            if selected.is_empty() {
                return None;
            }
            let texts: Vec<&str> =
                q.options.iter().filter(|o| selected.contains(&o.id)).map(|o| o.text.as_str()).collect();
            Some(format!("{}: {}", q.prompt, texts.join(", ")))
        })
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

fn build_compaction_prompt(discussion: &Discussion, rounds: &[&Round]) -> Vec<Message> {
    let round_numbers: Vec<i64> = rounds.iter().map(|r| r.round_number).collect();

    let mut body = String::new();
    if let Some(prior) = discussion.current_summary() {
        body.push_str(&format!("Prior summary (through round {}):\n{}\n\n", prior.round_number, prior.summary));
    }
    for round in rounds {
        body.push_str(&render_round_block(round));
        body.push('\n');
    }
    if let Some(answers) = render_user_answers(discussion, &round_numbers) {
        body.push_str("User steering so far:\n");
        body.push_str(&answers);
        body.push('\n');
    }

    let system = Message::system(
        "You compact a multi-persona deliberation transcript into a self-contained recap. \
         Preserve every decision, open question, and piece of user steering — verbatim or with \
         explicit attribution, never silently dropped. Do not invent content not present above.",
    );
    let user = Message::user(format!(
        "Topic: {}\n\n{body}\nWrite the recap now. It must stand alone: a reader with no access \
         to the rounds above must be able to follow the discussion from it.",
        discussion.topic
    ));
    vec![system, user]
}

/// Runs a compaction pass and returns the Summary to install. Does not
/// mutate `discussion` or touch the store — the scheduler is responsible for
/// calling `DiscussionStore::append_summary` and updating the token count
/// from the returned `token_count_after`.
pub async fn summarize(discussion: &Discussion, provider: &LogicalProvider, now: i64) -> AppResult<Summary> {
    let rounds = rounds_to_fold(discussion);
    let replaces_rounds: Vec<i64> = rounds.iter().map(|r| r.round_number).collect();
    let round_number = replaces_rounds.iter().copied().max().unwrap_or(discussion.current_round);

    let messages = build_compaction_prompt(discussion, &rounds);
    let summary_text = provider.stream(&messages, Box::new(|_| {})).await?;

    let token_count_before = discussion.last_token_count;
    let token_count_after = estimator::estimate(&summary_text) as i64;

    Ok(Summary {
        round_number,
        replaces_rounds,
        summary: summary_text,
        token_count_before,
        token_count_after,
        created_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Persona, Response};
    use crate::provider::mock::MockAdapter;
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    fn response(persona: Persona, round_number: i64, content: &str) -> Response {
        Response { persona, content: content.to_string(), turn: crate::model::turn_for(round_number, persona), timestamp: 0 }
    }

    fn complete_round(round_number: i64) -> Round {
        let mut round = Round::new(round_number, 0);
        round.set_slot(Persona::Analyzer, response(Persona::Analyzer, round_number, "analysis"));
        round.set_slot(Persona::Solver, response(Persona::Solver, round_number, "solution"));
        round.set_slot(Persona::Moderator, response(Persona::Moderator, round_number, "verdict"));
        round
    }

    fn mock_provider(reply: &str) -> LogicalProvider {
        LogicalProvider {
            name: "test".into(),
            adapter: Arc::new(MockAdapter::fails_then_succeeds(0, reply)),
            primary_model: "m".into(),
            fallback_models: vec![],
            timeout: Duration::from_secs(5),
            max_attempts: 1,
        }
    }

    #[test]
    fn threshold_matches_estimator() {
        assert!(!should_summarize(3999, 4000));
        assert!(should_summarize(4000, 4000));
    }

    #[tokio::test]
    async fn folds_all_complete_rounds_since_last_summary() {
        let mut discussion = Discussion::new(Uuid::new_v4(), "u1".into(), "topic".into(), 4000, 0);
        for n in 1..=3 {
            discussion.rounds.push(complete_round(n));
        }
        discussion.last_token_count = 4500;

        let provider = mock_provider("a compact recap");
        let summary = summarize(&discussion, &provider, 1000).await.unwrap();

        assert_eq!(summary.replaces_rounds, vec![1, 2, 3]);
        assert_eq!(summary.round_number, 3);
        assert_eq!(summary.summary, "a compact recap");
        assert_eq!(summary.token_count_before, 4500);
        assert!(summary.token_count_after > 0);
    }

    #[tokio::test]
    async fn excludes_rounds_already_folded_into_prior_summary() {
        let mut discussion = Discussion::new(Uuid::new_v4(), "u1".into(), "topic".into(), 4000, 0);
        for n in 1..=4 {
            discussion.rounds.push(complete_round(n));
        }
        discussion.summaries.push(Summary {
            round_number: 2,
            replaces_rounds: vec![1, 2],
            summary: "recap 1-2".into(),
            token_count_before: 1000,
            token_count_after: 50,
            created_at: 0,
        });

        let provider = mock_provider("recap 3-4");
        let summary = summarize(&discussion, &provider, 2000).await.unwrap();

        assert_eq!(summary.replaces_rounds, vec![3, 4]);
        assert_eq!(summary.round_number, 4);
    }

    #[tokio::test]
    async fn incomplete_trailing_round_is_not_folded() {
        let mut discussion = Discussion::new(Uuid::new_v4(), "u1".into(), "topic".into(), 4000, 0);
        discussion.rounds.push(complete_round(1));
        let mut partial = Round::new(2, 0);
        partial.set_slot(Persona::Analyzer, response(Persona::Analyzer, 2, "a"));
        discussion.rounds.push(partial);

        let provider = mock_provider("recap");
        let summary = summarize(&discussion, &provider, 0).await.unwrap();

        assert_eq!(summary.replaces_rounds, vec![1]);
    }
}
