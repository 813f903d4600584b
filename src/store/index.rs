// src/store/index.rs
// Metadata index: a `sqlx` SQLite table that mirrors discussion state for
// fast listing/filtering, reconcilable against the journal which always wins
// (spec §4.1, §6). Runtime `sqlx::query`/`query_as` rather than the `query!`
// macro, since there is no live database at build time to check against —
// same posture as the teacher's `db/memory/store.rs` hand-written SQL.

use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::model::Discussion;

/// Columns writable through `update_fields`. Anything outside this set is
/// rejected as a security violation (spec §6).
const WRITABLE_COLUMNS: &[&str] = &[
    "topic",
    "token_count",
    "token_limit",
    "summary",
    "summary_created_at",
    "is_resolved",
    "needs_user_input",
    "user_input_pending",
    "current_turn",
    "updated_at",
];

#[derive(Debug, Clone, FromRow)]
pub struct IndexRow {
    pub id: String,
    pub user_id: String,
    pub topic: String,
    pub json_path: String,
    pub md_path: String,
    pub token_count: i64,
    pub token_limit: i64,
    pub summary: Option<String>,
    pub summary_created_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub is_resolved: bool,
    pub needs_user_input: bool,
    pub user_input_pending: bool,
    pub current_turn: i64,
}

pub struct MetadataIndex {
    pool: SqlitePool,
}

impl MetadataIndex {
    pub async fn new(pool: SqlitePool) -> AppResult<Self> {
        let index = Self { pool };
        index.migrate().await?;
        Ok(index)
    }

    async fn migrate(&self) -> AppResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS discussions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                topic TEXT NOT NULL,
                json_path TEXT NOT NULL,
                md_path TEXT NOT NULL,
                token_count INTEGER NOT NULL DEFAULT 0,
                token_limit INTEGER NOT NULL,
                summary TEXT,
                summary_created_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                is_resolved INTEGER NOT NULL DEFAULT 0,
                needs_user_input INTEGER NOT NULL DEFAULT 0,
                user_input_pending INTEGER NOT NULL DEFAULT 0,
                current_turn INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Internal(format!("failed to migrate discussions table: {e}")))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_discussions_user ON discussions(user_id)")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Internal(format!("failed to create user index: {e}")))?;

        Ok(())
    }

    pub async fn upsert(&self, discussion: &Discussion, json_path: &str, md_path: &str) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO discussions
                (id, user_id, topic, json_path, md_path, token_count, token_limit, summary,
                 summary_created_at, created_at, updated_at, is_resolved, needs_user_input,
                 user_input_pending, current_turn)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                topic = excluded.topic,
                token_count = excluded.token_count,
                token_limit = excluded.token_limit,
                summary = excluded.summary,
                summary_created_at = excluded.summary_created_at,
                updated_at = excluded.updated_at,
                is_resolved = excluded.is_resolved,
                needs_user_input = excluded.needs_user_input,
                user_input_pending = excluded.user_input_pending,
                current_turn = excluded.current_turn
            "#,
        )
        .bind(discussion.id.to_string())
        .bind(&discussion.user_id)
        .bind(&discussion.topic)
        .bind(json_path)
        .bind(md_path)
        .bind(discussion.last_token_count)
        .bind(discussion.token_budget)
        .bind(discussion.current_summary().map(|s| s.summary.clone()))
        .bind(discussion.current_summary().map(|s| s.created_at))
        .bind(discussion.created_at)
        .bind(discussion.updated_at)
        .bind(discussion.is_resolved)
        .bind(false)
        .bind(false)
        .bind(discussion.current_round)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Internal(format!("failed to upsert discussion index row: {e}")))?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> AppResult<Option<IndexRow>> {
        sqlx::query_as::<_, IndexRow>("SELECT * FROM discussions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Internal(format!("failed to read discussion index row: {e}")))
    }

    pub async fn list_by_user(&self, user_id: &str, limit: i64) -> AppResult<Vec<IndexRow>> {
        sqlx::query_as::<_, IndexRow>(
            "SELECT * FROM discussions WHERE user_id = ? ORDER BY updated_at DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Internal(format!("failed to list discussions: {e}")))
    }

    /// All unresolved rows across every user, used by the background
    /// reconciliation sweep (spec §4.1) which has no single owning user.
    pub async fn list_all_active(&self) -> AppResult<Vec<IndexRow>> {
        sqlx::query_as::<_, IndexRow>("SELECT * FROM discussions WHERE is_resolved = 0")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::Internal(format!("failed to list active discussions: {e}")))
    }

    pub async fn list_unresolved_by_user(&self, user_id: &str) -> AppResult<Vec<IndexRow>> {
        sqlx::query_as::<_, IndexRow>(
            "SELECT * FROM discussions WHERE user_id = ? AND is_resolved = 0 ORDER BY updated_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Internal(format!("failed to list unresolved discussions: {e}")))
    }

    pub async fn delete(&self, id: Uuid) -> AppResult<()> {
        sqlx::query("DELETE FROM discussions WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Internal(format!("failed to delete discussion index row: {e}")))?;
        Ok(())
    }

    pub async fn delete_all(&self, user_id: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM discussions WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Internal(format!("failed to delete discussions for user: {e}")))?;
        Ok(())
    }

    /// Updates a whitelisted subset of columns by id. Any key outside
    /// `WRITABLE_COLUMNS` is rejected outright — no partial application.
    pub async fn update_fields(&self, id: Uuid, fields: &HashMap<String, serde_json::Value>) -> AppResult<()> {
        for key in fields.keys() {
            if !WRITABLE_COLUMNS.contains(&key.as_str()) {
                return Err(AppError::Internal(format!(
                    "security violation: attempted to update non-whitelisted column `{key}`"
                )));
            }
        }
        if fields.is_empty() {
            return Ok(());
        }

        let mut cols: Vec<&str> = fields.keys().map(|k| k.as_str()).collect();
        cols.sort_unstable();
        let assignments = cols.iter().map(|c| format!("{c} = ?")).collect::<Vec<_>>().join(", ");
        let sql = format!("UPDATE discussions SET {assignments} WHERE id = ?");

        let mut query = sqlx::query(&sql);
        for col in &cols {
            query = match &fields[*col] {
                serde_json::Value::Null => query.bind(None::<String>),
                serde_json::Value::Bool(b) => query.bind(*b),
                serde_json::Value::Number(n) if n.is_i64() => query.bind(n.as_i64()),
                serde_json::Value::Number(n) => query.bind(n.as_f64()),
                serde_json::Value::String(s) => query.bind(s.clone()),
                other => query.bind(other.to_string()),
            };
        }
        query = query.bind(id.to_string());

        query
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Internal(format!("failed to update discussion fields: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pool() -> SqlitePool {
        SqlitePool::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let index = MetadataIndex::new(pool().await).await.unwrap();
        let discussion = Discussion::new(Uuid::new_v4(), "u1".into(), "topic".into(), 4000, 0);
        index.upsert(&discussion, "j.json", "j.md").await.unwrap();

        let row = index.get(discussion.id).await.unwrap().unwrap();
        assert_eq!(row.user_id, "u1");
        assert_eq!(row.token_limit, 4000);
    }

    #[tokio::test]
    async fn update_rejects_non_whitelisted_column() {
        let index = MetadataIndex::new(pool().await).await.unwrap();
        let discussion = Discussion::new(Uuid::new_v4(), "u1".into(), "topic".into(), 4000, 0);
        index.upsert(&discussion, "j.json", "j.md").await.unwrap();

        let mut fields = HashMap::new();
        fields.insert("user_id".to_string(), serde_json::json!("attacker"));
        let err = index.update_fields(discussion.id, &fields).await.unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));
    }

    #[tokio::test]
    async fn update_whitelisted_column_succeeds() {
        let index = MetadataIndex::new(pool().await).await.unwrap();
        let discussion = Discussion::new(Uuid::new_v4(), "u1".into(), "topic".into(), 4000, 0);
        index.upsert(&discussion, "j.json", "j.md").await.unwrap();

        let mut fields = HashMap::new();
        fields.insert("token_count".to_string(), serde_json::json!(123));
        index.update_fields(discussion.id, &fields).await.unwrap();

        let row = index.get(discussion.id).await.unwrap().unwrap();
        assert_eq!(row.token_count, 123);
    }

    #[tokio::test]
    async fn delete_all_removes_only_that_user() {
        let index = MetadataIndex::new(pool().await).await.unwrap();
        let d1 = Discussion::new(Uuid::new_v4(), "u1".into(), "a".into(), 4000, 0);
        let d2 = Discussion::new(Uuid::new_v4(), "u2".into(), "b".into(), 4000, 0);
        index.upsert(&d1, "a.json", "a.md").await.unwrap();
        index.upsert(&d2, "b.json", "b.md").await.unwrap();

        index.delete_all("u1").await.unwrap();
        assert!(index.get(d1.id).await.unwrap().is_none());
        assert!(index.get(d2.id).await.unwrap().is_some());
    }
}
