// src/store/mod.rs
// C3: Discussion Store. Owns the durable per-discussion journal (two sibling
// files per spec §4.1/§6), enforces single-writer semantics via the file
// lock, and keeps the metadata index (§6) reconcilable against it. Built the
// way the teacher layers a thin service (`MemoryService`) over a storage
// primitive (`SqliteMemoryStore`) plus a retry/backoff wrapper, generalized
// to a filesystem journal instead of a single table.

pub mod index;
pub mod journal;
mod retry;

pub use index::{IndexRow, MetadataIndex};

use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::{RetryConfig, TokenSyncConfig};
use crate::error::{AppError, AppResult};
use crate::lock::{LockScope, LockService};
use crate::model::{Discussion, FileAttachment, QuestionSet, Round, Summary};

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Sentinel discussion-id component for the per-user lock guarding
/// `ensure_sole_active`, distinct from any real discussion UUID.
const SOLE_ACTIVE_LOCK_KEY: &str = "__sole_active__";

pub struct DiscussionStore {
    dir: PathBuf,
    index: MetadataIndex,
    locks: Arc<LockService>,
    retry_max_attempts: u32,
    retry_initial_delay: Duration,
    tolerance_pct: f64,
    stale_threshold_ms: i64,
    token_budget: i64,
    validate_token_sync: bool,
    auto_repair_token_sync: bool,
}

impl DiscussionStore {
    pub fn new(
        dir: PathBuf,
        index: MetadataIndex,
        locks: Arc<LockService>,
        retry_config: &RetryConfig,
        tolerance_pct: f64,
        stale_threshold_secs: i64,
        token_budget: i64,
    ) -> Self {
        Self::with_token_sync(
            dir,
            index,
            locks,
            retry_config,
            tolerance_pct,
            stale_threshold_secs,
            token_budget,
            &TokenSyncConfig { enable_validation: true, auto_repair: true },
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_token_sync(
        dir: PathBuf,
        index: MetadataIndex,
        locks: Arc<LockService>,
        retry_config: &RetryConfig,
        tolerance_pct: f64,
        stale_threshold_secs: i64,
        token_budget: i64,
        token_sync: &TokenSyncConfig,
    ) -> Self {
        Self {
            dir,
            index,
            locks,
            retry_max_attempts: retry_config.max_retries,
            retry_initial_delay: Duration::from_millis(retry_config.retry_delay_ms),
            tolerance_pct,
            stale_threshold_ms: stale_threshold_secs * 1000,
            token_budget,
            validate_token_sync: token_sync.enable_validation,
            auto_repair_token_sync: token_sync.auto_repair,
        }
    }

    async fn with_retry<F, Fut, T>(&self, f: F) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = AppResult<T>>,
    {
        retry::with_retry(self.retry_max_attempts, self.retry_initial_delay, f).await
    }

    async fn persist(&self, discussion: &Discussion) -> AppResult<()> {
        let dir = self.dir.clone();
        self.with_retry(|| journal::write(&dir, discussion)).await?;
        let json_path = journal::json_path(&self.dir, &discussion.user_id, discussion.id);
        let md_path = journal::md_path(&self.dir, &discussion.user_id, discussion.id);
        self.index
            .upsert(discussion, &json_path.to_string_lossy(), &md_path.to_string_lossy())
            .await
    }

    pub async fn create(&self, user_id: &str, topic: &str, id: Option<Uuid>) -> AppResult<Discussion> {
        let id = id.unwrap_or_else(Uuid::new_v4);
        let now = now_ms();
        let discussion = Discussion::new(id, user_id.to_string(), topic.to_string(), self.token_budget, now);
        self.persist(&discussion).await?;
        Ok(discussion)
    }

    /// Reads a discussion, failing `NotFound` if absent and `Auth` if the
    /// caller's `user_id` does not match the owner recorded by the index or
    /// the journal itself (spec §4.1).
    pub async fn read(&self, id: Uuid, user_id: &str) -> AppResult<Discussion> {
        let row = self.index.get(id).await?;
        let owner = match &row {
            Some(row) => {
                if row.user_id != user_id {
                    return Err(AppError::Auth(format!("discussion {id} is not owned by {user_id}")));
                }
                row.user_id.clone()
            }
            // No index row yet (e.g. crash before the first upsert landed) — fall back to the
            // caller's claimed ownership and let the journal content itself be the final check.
            None => user_id.to_string(),
        };

        let dir = self.dir.clone();
        let discussion = self.with_retry(|| journal::read(&dir, &owner, id)).await?;

        if discussion.user_id != user_id {
            return Err(AppError::Auth(format!("discussion {id} is not owned by {user_id}")));
        }
        Ok(discussion)
    }

    async fn mutate<F>(&self, id: Uuid, user_id: &str, f: F) -> AppResult<Discussion>
    where
        F: FnOnce(&mut Discussion) -> AppResult<()>,
    {
        self.locks
            .with_lock(LockScope::File, user_id, &id.to_string(), LockScope::File.default_ttl(), move || async move {
                let mut discussion = self.read(id, user_id).await?;
                f(&mut discussion)?;
                discussion.updated_at = now_ms();
                self.persist(&discussion).await?;
                Ok(discussion)
            })
            .await
    }

    /// Upserts `round` by `round_number`: a new number is appended (must be
    /// contiguous), an existing number is replaced in place — this is how a
    /// round accrues its three persona slots one response at a time while
    /// remaining a single durable record (spec §4.2's "partial response...
    /// remains incomplete on disk").
    pub async fn append_round(&self, id: Uuid, user_id: &str, round: Round) -> AppResult<Discussion> {
        self.mutate(id, user_id, |discussion| {
            if let Some(existing) = discussion.round_mut(round.round_number) {
                *existing = round;
            } else {
                let expected = discussion.rounds.len() as i64 + 1;
                if round.round_number != expected {
                    return Err(AppError::Internal(format!(
                        "non-contiguous round append: expected round {expected}, got {}",
                        round.round_number
                    )));
                }
                discussion.rounds.push(round);
            }
            discussion.current_round = discussion.rounds.iter().map(|r| r.round_number).max().unwrap_or(0);
            discussion.repair_turn_numbers();
            Ok(())
        })
        .await
    }

    pub async fn update_token_count(&self, id: Uuid, user_id: &str, count: i64) -> AppResult<Discussion> {
        self.mutate(id, user_id, |discussion| {
            discussion.last_token_count = count;
            Ok(())
        })
        .await
    }

    /// Appends a summary, validating spec §3's chain invariant: strictly
    /// increasing `round_number`, and `replaces_rounds` disjoint from every
    /// prior summary's set.
    pub async fn append_summary(&self, id: Uuid, user_id: &str, summary: Summary) -> AppResult<Discussion> {
        self.mutate(id, user_id, |discussion| {
            if let Some(last) = discussion.current_summary() {
                if summary.round_number <= last.round_number {
                    return Err(AppError::Input(format!(
                        "summary round_number {} must exceed prior summary's round_number {}",
                        summary.round_number, last.round_number
                    )));
                }
                let prior: std::collections::HashSet<_> = last.replaces_rounds.iter().collect();
                if summary.replaces_rounds.iter().any(|r| prior.contains(r)) {
                    return Err(AppError::Input("summary replaces_rounds overlaps a prior summary".to_string()));
                }
            }
            discussion.summaries.push(summary);
            Ok(())
        })
        .await
    }

    /// Appends a question set, attaching it to the matching round's
    /// `question_set_round` field when that round exists (spec §4.7).
    pub async fn append_questions(&self, id: Uuid, user_id: &str, question_set: QuestionSet) -> AppResult<Discussion> {
        self.mutate(id, user_id, |discussion| {
            let round_number = question_set.round_number;
            discussion.questions.push(question_set);
            if let Some(round) = discussion.round_mut(round_number) {
                round.question_set_round = Some(round_number);
            }
            Ok(())
        })
        .await
    }

    pub async fn record_answers(
        &self,
        id: Uuid,
        user_id: &str,
        round_number: i64,
        answers: &HashMap<String, Vec<String>>,
    ) -> AppResult<Discussion> {
        self.mutate(id, user_id, |discussion| {
            let qs = discussion
                .questions
                .iter_mut()
                .filter(|q| q.round_number == round_number)
                .next_back()
                .ok_or_else(|| AppError::Input(format!("no question set for round {round_number}")))?;
            qs.record_answers(answers).map_err(AppError::Input)
        })
        .await
    }

    /// Attaches files to a discussion at creation time (spec §4.4's file
    /// manifest needs somewhere durable to read them from on every
    /// subsequent prompt assembly).
    pub async fn attach_files(&self, id: Uuid, user_id: &str, files: Vec<FileAttachment>) -> AppResult<Discussion> {
        self.mutate(id, user_id, |discussion| {
            discussion.files = files;
            Ok(())
        })
        .await
    }

    pub async fn mark_resolved(&self, id: Uuid, user_id: &str) -> AppResult<Discussion> {
        self.mutate(id, user_id, |discussion| {
            discussion.is_resolved = true;
            Ok(())
        })
        .await
    }

    pub async fn list_by_user(&self, user_id: &str, limit: i64) -> AppResult<Vec<Discussion>> {
        let rows = self.index.list_by_user(user_id, limit).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            if let Ok(id) = Uuid::parse_str(&row.id) {
                match self.read(id, user_id).await {
                    Ok(discussion) => out.push(discussion),
                    Err(e) => tracing::warn!(discussion_id = %id, error = %e, "skipping unreadable discussion in list_by_user"),
                }
            }
        }
        Ok(out)
    }

    pub async fn delete_all(&self, user_id: &str) -> AppResult<()> {
        for row in self.index.list_by_user(user_id, i64::MAX).await? {
            if let Ok(id) = Uuid::parse_str(&row.id) {
                let dir = self.dir.clone();
                if let Err(e) = journal::delete(&dir, user_id, id).await {
                    tracing::warn!(discussion_id = %id, error = %e, "failed to delete journal during delete_all");
                }
            }
        }
        self.index.delete_all(user_id).await
    }

    /// Under the user-scoped lock, resolves stale unresolved discussions and
    /// returns the single remaining active one, if any (spec §3, §4.1).
    pub async fn ensure_sole_active(&self, user_id: &str) -> AppResult<Option<Discussion>> {
        self.locks
            .with_lock(LockScope::File, user_id, SOLE_ACTIVE_LOCK_KEY, LockScope::File.default_ttl(), move || async move {
                let now = now_ms();
                let unresolved = self.index.list_unresolved_by_user(user_id).await?;

                let mut active = Vec::new();
                for row in unresolved {
                    if now - row.updated_at > self.stale_threshold_ms {
                        if let Ok(id) = Uuid::parse_str(&row.id) {
                            self.mark_resolved(id, user_id).await?;
                            continue;
                        }
                    }
                    active.push(row);
                }

                match active.into_iter().next() {
                    Some(row) => {
                        let id = Uuid::parse_str(&row.id)
                            .map_err(|e| AppError::Internal(format!("corrupt discussion id in index: {e}")))?;
                        Ok(Some(self.read(id, user_id).await?))
                    }
                    None => Ok(None),
                }
            })
            .await
    }

    /// Runs `reconcile` over every unresolved discussion across all users;
    /// failures on one discussion are logged and do not abort the sweep.
    pub async fn reconcile_all(&self) -> AppResult<()> {
        for row in self.index.list_all_active().await? {
            let Ok(id) = Uuid::parse_str(&row.id) else { continue };
            if let Err(e) = self.reconcile(id, &row.user_id).await {
                tracing::warn!(discussion_id = %id, error = %e, "reconciliation sweep failed for discussion");
            }
        }
        Ok(())
    }

    /// Re-derives the index row's token count, current round and summary
    /// text from the journal (the authoritative source) and repairs the
    /// index if it has drifted beyond `tolerance_pct` (spec §4.1).
    pub async fn reconcile(&self, id: Uuid, user_id: &str) -> AppResult<()> {
        if !self.validate_token_sync {
            return Ok(());
        }

        let discussion = self.read(id, user_id).await?;
        let Some(row) = self.index.get(id).await? else {
            return self.persist(&discussion).await;
        };

        let journal_count = discussion.last_token_count;
        let drifted_tokens = if journal_count == 0 {
            row.token_count != 0
        } else {
            ((journal_count - row.token_count).abs() as f64 / journal_count as f64) > self.tolerance_pct
        };

        let journal_summary = discussion.current_summary().map(|s| s.summary.clone());
        let drifted_round = row.current_turn != discussion.current_round;
        let drifted_summary = row.summary != journal_summary;

        if drifted_tokens || drifted_round || drifted_summary {
            if !self.auto_repair_token_sync {
                tracing::warn!(
                    discussion_id = %id,
                    drifted_tokens, drifted_round, drifted_summary,
                    "metadata index has drifted from journal but AUTO_REPAIR_TOKEN_SYNC is disabled"
                );
                return Ok(());
            }
            tracing::info!(
                discussion_id = %id,
                drifted_tokens, drifted_round, drifted_summary,
                "repairing metadata index row from journal"
            );
            self.persist(&discussion).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::InMemoryLockBackend;
    use crate::model::{Persona, Response};
    use sqlx::sqlite::SqlitePool;

    async fn make_store(tmp: &std::path::Path) -> DiscussionStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let index = MetadataIndex::new(pool).await.unwrap();
        let locks = Arc::new(LockService::new(Arc::new(InMemoryLockBackend::new())));
        DiscussionStore::new(
            tmp.to_path_buf(),
            index,
            locks,
            &RetryConfig { max_retries: 3, retry_delay_ms: 1 },
            0.05,
            3600,
            4000,
        )
    }

    fn response(persona: Persona, round_number: i64, content: &str) -> Response {
        Response { persona, content: content.to_string(), turn: crate::model::turn_for(round_number, persona), timestamp: 0 }
    }

    #[tokio::test]
    async fn create_then_read_round_trips_and_checks_ownership() {
        let tmp = tempfile::tempdir().unwrap();
        let store = make_store(tmp.path()).await;

        let discussion = store.create("u1", "topic", None).await.unwrap();
        let reread = store.read(discussion.id, "u1").await.unwrap();
        assert_eq!(reread.topic, "topic");

        let err = store.read(discussion.id, "u2").await.unwrap_err();
        assert!(matches!(err, AppError::Auth(_)));
    }

    #[tokio::test]
    async fn append_round_is_contiguous_and_upserts_by_number() {
        let tmp = tempfile::tempdir().unwrap();
        let store = make_store(tmp.path()).await;
        let discussion = store.create("u1", "topic", None).await.unwrap();

        let mut round = Round::new(1, 0);
        round.set_slot(Persona::Analyzer, response(Persona::Analyzer, 1, "a"));
        let updated = store.append_round(discussion.id, "u1", round.clone()).await.unwrap();
        assert_eq!(updated.rounds.len(), 1);
        assert!(!updated.rounds[0].is_complete());

        round.set_slot(Persona::Solver, response(Persona::Solver, 1, "b"));
        round.set_slot(Persona::Moderator, response(Persona::Moderator, 1, "c"));
        let updated = store.append_round(discussion.id, "u1", round).await.unwrap();
        assert_eq!(updated.rounds.len(), 1, "same round_number must replace, not duplicate");
        assert!(updated.rounds[0].is_complete());
        assert_eq!(updated.current_round, 1);

        let mut round2 = Round::new(3, 0);
        round2.set_slot(Persona::Analyzer, response(Persona::Analyzer, 3, "x"));
        let err = store.append_round(discussion.id, "u1", round2).await.unwrap_err();
        assert!(matches!(err, AppError::Internal(_)), "round 3 cannot follow round 1 directly");
    }

    #[tokio::test]
    async fn summary_chain_rejects_non_increasing_round_number() {
        let tmp = tempfile::tempdir().unwrap();
        let store = make_store(tmp.path()).await;
        let discussion = store.create("u1", "topic", None).await.unwrap();

        let s1 = Summary {
            round_number: 3,
            replaces_rounds: vec![1, 2, 3],
            summary: "first".into(),
            token_count_before: 100,
            token_count_after: 10,
            created_at: 0,
        };
        store.append_summary(discussion.id, "u1", s1).await.unwrap();

        let s2 = Summary {
            round_number: 2,
            replaces_rounds: vec![4],
            summary: "bad".into(),
            token_count_before: 100,
            token_count_after: 10,
            created_at: 0,
        };
        let err = store.append_summary(discussion.id, "u1", s2).await.unwrap_err();
        assert!(matches!(err, AppError::Input(_)));
    }

    #[tokio::test]
    async fn record_answers_rejects_unknown_question_round() {
        let tmp = tempfile::tempdir().unwrap();
        let store = make_store(tmp.path()).await;
        let discussion = store.create("u1", "topic", None).await.unwrap();

        let mut answers = HashMap::new();
        answers.insert("Q1".to_string(), vec!["A".to_string()]);
        let err = store.record_answers(discussion.id, "u1", 1, &answers).await.unwrap_err();
        assert!(matches!(err, AppError::Input(_)));
    }

    #[tokio::test]
    async fn ensure_sole_active_force_resolves_stale_discussions() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = make_store(tmp.path()).await;
        store.stale_threshold_ms = 0; // force every unresolved discussion to read as stale

        let d1 = store.create("u1", "first", None).await.unwrap();
        let d2 = store.create("u1", "second", None).await.unwrap();

        let active = store.ensure_sole_active("u1").await.unwrap();
        assert!(active.is_none(), "both discussions are past the (zeroed) staleness threshold");

        assert!(store.read(d1.id, "u1").await.unwrap().is_resolved);
        assert!(store.read(d2.id, "u1").await.unwrap().is_resolved);
    }

    #[tokio::test]
    async fn delete_all_removes_journal_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = make_store(tmp.path()).await;
        let discussion = store.create("u1", "topic", None).await.unwrap();

        store.delete_all("u1").await.unwrap();
        let err = store.read(discussion.id, "u1").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
