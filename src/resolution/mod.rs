// src/resolution/mod.rs
// C10: Resolution Detector. A deterministic rule-based analyzer over the
// Moderator's response of the most recent complete round (spec §9 Open
// Question (b) resolves to rule-based, not a second LLM call, to keep this a
// pure testable function) — grounded in the teacher's fixed keyword-list
// classifier (`hooks/precompact/extract.rs`'s `DECISION_KEYWORDS`/
// `matches_any`), generalized from decision/task/issue phrase matching over
// a transcript to a resolved/unresolved verdict with a confidence score.

use crate::error::{AppError, AppResult};
use crate::model::Round;

const RESOLVED_MARKERS: &[&str] =
    &["in conclusion", "final decision", "we recommend", "consensus", "resolved:", "solution:", "recommendation:"];

const UNRESOLVED_MARKERS: &[&str] = &[
    "further discussion",
    "more analysis",
    "remains open",
    "no consensus",
    "unresolved",
    "need more information",
    "disagree",
];

const SOLUTION_MARKERS: &[&str] = &["solution:", "recommendation:", "final decision:"];

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Unresolved,
    Resolved { solution: Option<String>, confidence: f64 },
}

fn count_hits(haystack: &str, markers: &[&str]) -> usize {
    markers.iter().filter(|m| haystack.contains(*m)).count()
}

fn extract_solution(content: &str) -> Option<String> {
    let lower = content.to_lowercase();
    for marker in SOLUTION_MARKERS {
        if let Some(idx) = lower.find(marker) {
            let after = &content[idx + marker.len()..];
            let text = after.trim();
            if !text.is_empty() {
                return Some(text.lines().next().unwrap_or(text).trim().to_string());
            }
        }
    }
    None
}

/// Classifies the given completed round as resolved or unresolved,
/// per the Moderator's response content.
pub fn detect(round: &Round) -> AppResult<Resolution> {
    if !round.is_complete() {
        return Err(AppError::Internal(format!("round {} is not complete, cannot classify resolution", round.round_number)));
    }
    let moderator = round
        .moderator_response
        .as_ref()
        .ok_or_else(|| AppError::Internal(format!("round {} missing moderator response", round.round_number)))?;

    let lower = moderator.content.to_lowercase();
    let resolved_hits = count_hits(&lower, RESOLVED_MARKERS);
    let unresolved_hits = count_hits(&lower, UNRESOLVED_MARKERS);

    if unresolved_hits > 0 && unresolved_hits >= resolved_hits {
        return Ok(Resolution::Unresolved);
    }
    if resolved_hits == 0 {
        return Ok(Resolution::Unresolved);
    }

    let confidence = (0.5 + 0.15 * resolved_hits as f64).min(1.0);
    let solution = extract_solution(&moderator.content);
    Ok(Resolution::Resolved { solution, confidence })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Persona, Response};

    fn round_with_moderator(content: &str) -> Round {
        let mut round = Round::new(1, 0);
        round.set_slot(Persona::Analyzer, Response { persona: Persona::Analyzer, content: "a".into(), turn: 1, timestamp: 0 });
        round.set_slot(Persona::Solver, Response { persona: Persona::Solver, content: "s".into(), turn: 2, timestamp: 0 });
        round.set_slot(
            Persona::Moderator,
            Response { persona: Persona::Moderator, content: content.into(), turn: 3, timestamp: 0 },
        );
        round
    }

    #[test]
    fn plain_continuation_is_unresolved() {
        let round = round_with_moderator("Let's keep exploring the tradeoffs next round.");
        assert_eq!(detect(&round).unwrap(), Resolution::Unresolved);
    }

    #[test]
    fn explicit_markers_resolve_with_confidence() {
        let round = round_with_moderator("In conclusion, we recommend an LRU policy with a small probationary segment.");
        match detect(&round).unwrap() {
            Resolution::Resolved { confidence, .. } => assert!(confidence >= 0.5),
            other => panic!("expected resolved, got {other:?}"),
        }
    }

    #[test]
    fn solution_marker_extracts_text() {
        let round = round_with_moderator("We have reviewed all options. Solution: use LRU with a 10% probation segment.");
        match detect(&round).unwrap() {
            Resolution::Resolved { solution, .. } => {
                assert_eq!(solution.as_deref(), Some("use LRU with a 10% probation segment."));
            }
            other => panic!("expected resolved, got {other:?}"),
        }
    }

    #[test]
    fn unresolved_markers_override_weak_resolved_signal() {
        let round = round_with_moderator("We reached some consensus but the team still needs more information before a final decision can stand; this remains open.");
        assert_eq!(detect(&round).unwrap(), Resolution::Unresolved);
    }

    #[test]
    fn incomplete_round_is_rejected() {
        let mut round = Round::new(1, 0);
        round.set_slot(Persona::Analyzer, Response { persona: Persona::Analyzer, content: "a".into(), turn: 1, timestamp: 0 });
        let err = detect(&round).unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));
    }
}
