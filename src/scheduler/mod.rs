// src/scheduler/mod.rs
// C6: Round Scheduler, the state machine driving a discussion through the
// three personas under the processing lock, invoking the Assembler, Provider,
// Summarizer, Question Engine and Resolution Detector between rounds —
// grounded in the teacher's `chat::orchestrator` turn-taking loop, generalized
// from open-ended chat to fixed three-persona rounds with a resolution exit.
// The Scheduler only ever calls a small `emit(event)` sink (spec §9's design
// note on breaking the Scheduler/Event-Bus cycle); it never reaches into the
// gateway directly.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::assembler;
use crate::error::{AppError, AppResult};
use crate::lock::{LockScope, LockService};
use crate::model::{Discussion, FileAttachment, Persona, QuestionSet, Response, Round, Summary};
use crate::provider::ProviderRegistry;
use crate::questions;
use crate::resolution::{self, Resolution};
use crate::store::DiscussionStore;
use crate::summarizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    GeneratingResponse(Persona),
    RoundClosing,
    AwaitingUserAction,
    Summarizing,
    GeneratingQuestions,
    Resolved,
}

/// Derives the externally-observable state from discussion content alone —
/// there is no separate state record, since the journal is authoritative and
/// a crash mid-round must resume from exactly what's on disk.
pub fn state_of(discussion: &Discussion) -> SchedulerState {
    if discussion.is_resolved {
        return SchedulerState::Resolved;
    }
    match discussion.rounds.last() {
        None => SchedulerState::Idle,
        Some(round) if !round.is_complete() => {
            let next_persona = [Persona::Analyzer, Persona::Solver, Persona::Moderator]
                .into_iter()
                .find(|p| round.slot(*p).is_none())
                .unwrap_or(Persona::Moderator);
            SchedulerState::GeneratingResponse(next_persona)
        }
        Some(_) => SchedulerState::AwaitingUserAction,
    }
}

#[derive(Debug, Clone)]
pub enum OutboundEvent {
    DiscussionStarted { discussion_id: Uuid },
    MessageStart { persona: Persona, turn: i64 },
    MessageChunk { chunk: String },
    MessageComplete { response: Response },
    RoundComplete { round: Round },
    QuestionsGenerated { question_set: QuestionSet },
    SummaryCreated { summary: Summary },
    ConversationResolved { solution: Option<String>, confidence: f64, reason: Option<String> },
    Error { code: String, message: String, discussion_id: Option<Uuid> },
}

/// The Scheduler's only outbound dependency (spec §9): fan-out to connected
/// clients is the Event Bus's job, not the Scheduler's.
pub trait EventSink: Send + Sync {
    fn emit(&self, discussion_id: Uuid, event: OutboundEvent);
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub struct RoundScheduler {
    store: Arc<DiscussionStore>,
    locks: Arc<LockService>,
    providers: Arc<ProviderRegistry>,
    provider_name: String,
    token_budget: i64,
    processing_ttl: Duration,
}

impl RoundScheduler {
    pub fn new(
        store: Arc<DiscussionStore>,
        locks: Arc<LockService>,
        providers: Arc<ProviderRegistry>,
        provider_name: String,
        token_budget: i64,
    ) -> Self {
        Self { store, locks, providers, provider_name, token_budget, processing_ttl: LockScope::Processing.default_ttl() }
    }

    async fn emit_error(&self, discussion_id: Uuid, err: &AppError, sink: &dyn EventSink) {
        crate::metrics::record_error(err.category());
        sink.emit(
            discussion_id,
            OutboundEvent::Error { code: err.category().to_string(), message: err.to_string(), discussion_id: Some(discussion_id) },
        );
    }

    /// `start-dialogue(topic, files)` (spec §4.2's initial transition).
    pub async fn start(
        &self,
        user_id: &str,
        topic: &str,
        files: Vec<FileAttachment>,
        sink: &dyn EventSink,
    ) -> AppResult<Discussion> {
        self.start_with_id(user_id, topic, files, None, sink).await
    }

    /// Same as `start`, but lets the caller pin the discussion id up front.
    /// The gateway needs this to subscribe a session to its room *before*
    /// the first round's events fire (spec §4.9's ordering guarantees),
    /// since `discussion-started` and everything after it go out on `sink`
    /// before this call returns.
    pub async fn start_with_id(
        &self,
        user_id: &str,
        topic: &str,
        files: Vec<FileAttachment>,
        id: Option<Uuid>,
        sink: &dyn EventSink,
    ) -> AppResult<Discussion> {
        if let Some(active) = self.store.ensure_sole_active(user_id).await? {
            return Err(AppError::Conflict(format!("user {user_id} already has an active discussion {}", active.id)));
        }

        let discussion = self.store.create(user_id, topic, id).await?;
        let discussion = if files.is_empty() { discussion } else { self.store.attach_files(discussion.id, user_id, files).await? };

        sink.emit(discussion.id, OutboundEvent::DiscussionStarted { discussion_id: discussion.id });

        match self.run_locked(discussion.id, user_id, 1, sink).await {
            Ok(d) => Ok(d),
            Err(e) => {
                self.emit_error(discussion.id, &e, sink).await;
                Err(e)
            }
        }
    }

    /// `proceed-dialogue(discussion_id)`: resumes an incomplete round, or
    /// starts the next one (spec §4.2's resume transitions).
    pub async fn proceed(&self, discussion_id: Uuid, user_id: &str, sink: &dyn EventSink) -> AppResult<Discussion> {
        let discussion = self.store.read(discussion_id, user_id).await?;
        if discussion.is_resolved {
            return Err(AppError::Conflict(format!("discussion {discussion_id} is already resolved")));
        }

        let target_round = match discussion.rounds.last() {
            Some(last) if !last.is_complete() => last.round_number,
            Some(last) => last.round_number + 1,
            None => 1,
        };

        match self.run_locked(discussion_id, user_id, target_round, sink).await {
            Ok(d) => Ok(d),
            Err(e) => {
                self.emit_error(discussion_id, &e, sink).await;
                Err(e)
            }
        }
    }

    /// `generate-questions(discussion_id, round_number?)`.
    pub async fn generate_questions(
        &self,
        discussion_id: Uuid,
        user_id: &str,
        round_number: Option<i64>,
        sink: &dyn EventSink,
    ) -> AppResult<Discussion> {
        let result = self.locks
            .with_lock(LockScope::Processing, user_id, &discussion_id.to_string(), self.processing_ttl, move || async move {
                let discussion = self.store.read(discussion_id, user_id).await?;
                let round_number = match round_number {
                    Some(n) => n,
                    None => discussion
                        .latest_complete_round()
                        .map(|r| r.round_number)
                        .ok_or_else(|| AppError::Input("no complete round to generate questions for".to_string()))?,
                };
                let round = discussion
                    .round(round_number)
                    .ok_or_else(|| AppError::Input(format!("round {round_number} does not exist")))?;

                let provider = self.providers.get(&self.provider_name)?;
                let question_set = questions::generate(round, &provider).await?;
                let discussion = self.store.append_questions(discussion_id, user_id, question_set.clone()).await?;
                sink.emit(discussion_id, OutboundEvent::QuestionsGenerated { question_set });
                Ok(discussion)
            })
            .await;

        if let Err(e) = &result {
            self.emit_error(discussion_id, e, sink).await;
        }
        result
    }

    /// `submit-answers(discussion_id, round_number, answers)`. Does not
    /// itself advance the round (spec §4.2).
    pub async fn submit_answers(
        &self,
        discussion_id: Uuid,
        user_id: &str,
        round_number: i64,
        answers: &std::collections::HashMap<String, Vec<String>>,
        sink: &dyn EventSink,
    ) -> AppResult<Discussion> {
        let result = self.store.record_answers(discussion_id, user_id, round_number, answers).await;
        if let Err(e) = &result {
            self.emit_error(discussion_id, e, sink).await;
        }
        result
    }

    async fn run_locked(&self, discussion_id: Uuid, user_id: &str, round_number: i64, sink: &dyn EventSink) -> AppResult<Discussion> {
        self.locks
            .with_lock(LockScope::Processing, user_id, &discussion_id.to_string(), self.processing_ttl, move || async move {
                self.run_round(discussion_id, user_id, round_number, sink).await
            })
            .await
    }

    /// Drives `round_number` through whichever personas are still missing a
    /// slot, resuming in place after a mid-stream failure, then handles
    /// resolution/summarization before returning (spec §4.2, §4.6, §4.10).
    async fn run_round(&self, discussion_id: Uuid, user_id: &str, round_number: i64, sink: &dyn EventSink) -> AppResult<Discussion> {
        let mut discussion = self.store.read(discussion_id, user_id).await?;
        let provider = self.providers.get(&self.provider_name)?;

        let mut round = discussion.round(round_number).cloned().unwrap_or_else(|| Round::new(round_number, now_ms()));

        for persona in [Persona::Analyzer, Persona::Solver, Persona::Moderator] {
            if round.slot(persona).is_some() {
                continue;
            }

            let ctx = assembler::assemble(&discussion, persona, round_number)?;
            let turn = crate::model::turn_for(round_number, persona);
            sink.emit(discussion_id, OutboundEvent::MessageStart { persona, turn });

            let messages = vec![crate::provider::Message::user(ctx.prompt)];
            let content = provider
                .stream(
                    &messages,
                    Box::new(|delta: &str| {
                        sink.emit(discussion_id, OutboundEvent::MessageChunk { chunk: delta.to_string() });
                    }),
                )
                .await?;

            let response = Response { persona, content, turn, timestamp: now_ms() };
            round.set_slot(persona, response.clone());
            sink.emit(discussion_id, OutboundEvent::MessageComplete { response });

            discussion = self.store.append_round(discussion_id, user_id, round.clone()).await?;
            round = discussion.round(round_number).cloned().unwrap_or(round);
        }

        sink.emit(discussion_id, OutboundEvent::RoundComplete { round: round.clone() });
        crate::metrics::record_round_complete();

        match resolution::detect(&round)? {
            Resolution::Resolved { solution, confidence } => {
                discussion = self.store.mark_resolved(discussion_id, user_id).await?;
                sink.emit(discussion_id, OutboundEvent::ConversationResolved { solution, confidence, reason: None });
                return Ok(discussion);
            }
            Resolution::Unresolved => {}
        }

        let next_ctx = assembler::assemble(&discussion, Persona::Analyzer, round_number + 1)?;
        discussion = self.store.update_token_count(discussion_id, user_id, next_ctx.estimated_tokens).await?;

        if summarizer::should_summarize(next_ctx.estimated_tokens, self.token_budget) {
            let summary = summarizer::summarize(&discussion, &provider, now_ms()).await?;
            discussion = self.store.append_summary(discussion_id, user_id, summary.clone()).await?;
            discussion = self.store.update_token_count(discussion_id, user_id, summary.token_count_after).await?;
            sink.emit(discussion_id, OutboundEvent::SummaryCreated { summary });
        }

        Ok(discussion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::lock::InMemoryLockBackend;
    use crate::provider::mock::MockAdapter;
    use crate::provider::LogicalProvider;
    use crate::store::MetadataIndex;
    use sqlx::sqlite::SqlitePool;
    use std::sync::Mutex;

    struct RecordingSink {
        events: Mutex<Vec<(Uuid, OutboundEvent)>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self { events: Mutex::new(Vec::new()) }
        }
        fn events(&self) -> Vec<(Uuid, OutboundEvent)> {
            self.events.lock().unwrap().clone()
        }
    }

    impl EventSink for RecordingSink {
        fn emit(&self, discussion_id: Uuid, event: OutboundEvent) {
            self.events.lock().unwrap().push((discussion_id, event));
        }
    }

    async fn make_scheduler(reply: &str) -> RoundScheduler {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let index = MetadataIndex::new(pool).await.unwrap();
        let locks = Arc::new(LockService::new(Arc::new(InMemoryLockBackend::new())));
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(DiscussionStore::new(
            tmp.path().to_path_buf(),
            index,
            locks.clone(),
            &RetryConfig { max_retries: 3, retry_delay_ms: 1 },
            0.05,
            3600,
            4000,
        ));
        // leak the tempdir so it outlives the store for the duration of the test
        std::mem::forget(tmp);

        let mut providers = ProviderRegistry::new();
        providers.register(LogicalProvider {
            name: "default".into(),
            adapter: Arc::new(MockAdapter::fails_then_succeeds(0, reply)),
            primary_model: "m".into(),
            fallback_models: vec![],
            timeout: Duration::from_secs(5),
            max_attempts: 1,
        });

        RoundScheduler::new(store, locks, Arc::new(providers), "default".to_string(), 4000)
    }

    #[tokio::test]
    async fn start_drives_full_round_one() {
        let scheduler = make_scheduler("a reasoned response").await;
        let sink = RecordingSink::new();

        let discussion = scheduler.start("u1", "Design a cache eviction policy", vec![], &sink).await.unwrap();

        assert_eq!(discussion.rounds.len(), 1);
        assert!(discussion.rounds[0].is_complete());
        assert!(!discussion.is_resolved);

        let events = sink.events();
        assert!(matches!(events[0].1, OutboundEvent::DiscussionStarted { .. }));
        let complete_count = events.iter().filter(|(_, e)| matches!(e, OutboundEvent::MessageComplete { .. })).count();
        assert_eq!(complete_count, 3);
        assert!(events.iter().any(|(_, e)| matches!(e, OutboundEvent::RoundComplete { .. })));
    }

    #[tokio::test]
    async fn second_start_while_active_is_conflict() {
        let scheduler = make_scheduler("reply").await;
        let sink = RecordingSink::new();
        scheduler.start("u1", "topic a", vec![], &sink).await.unwrap();

        let err = scheduler.start("u1", "topic b", vec![], &sink).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn proceed_starts_round_two_with_moderator_as_last_message() {
        let scheduler = make_scheduler("reply").await;
        let sink = RecordingSink::new();
        let discussion = scheduler.start("u1", "topic", vec![], &sink).await.unwrap();

        let discussion = scheduler.proceed(discussion.id, "u1", &sink).await.unwrap();
        assert_eq!(discussion.rounds.len(), 2);
        assert_eq!(discussion.rounds[1].analyzer_response.as_ref().unwrap().turn, 4);
    }

    #[tokio::test]
    async fn proceed_on_resolved_discussion_is_conflict() {
        let scheduler = make_scheduler("In conclusion, we recommend the obvious choice.").await;
        let sink = RecordingSink::new();
        let discussion = scheduler.start("u1", "topic", vec![], &sink).await.unwrap();
        assert!(discussion.is_resolved);

        let err = scheduler.proceed(discussion.id, "u1", &sink).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn state_of_reports_awaiting_user_action_after_complete_round() {
        let scheduler = make_scheduler("reply").await;
        let sink = RecordingSink::new();
        let discussion = scheduler.start("u1", "topic", vec![], &sink).await.unwrap();
        assert_eq!(state_of(&discussion), SchedulerState::AwaitingUserAction);
    }
}
