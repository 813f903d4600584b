// src/identity/mod.rs
// C15: identity shim. A real user directory is out of scope (spec §1
// Non-goals); this ships a trait plus an in-memory stub used both as the
// default runtime implementation and by tests, mirroring the teacher's
// pattern of a small trait seam with a stub behind it (cf. `memory::traits`).

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub image: Option<String>,
    pub provider: String,
    pub provider_id: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn get_user_by_id(&self, id: &str) -> AppResult<User>;
    async fn get_user_by_email(&self, email: &str) -> AppResult<User>;
}

/// In-memory stand-in for the identity store (spec §1 Non-goals excludes the
/// real directory). Ownership comparisons in the store/scheduler only ever
/// need `id`, so ordinary tests construct a user ad hoc without registering it.
#[derive(Default)]
pub struct InMemoryIdentityStore {
    by_id: RwLock<HashMap<String, User>>,
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, user: User) {
        self.by_id.write().await.insert(user.id.clone(), user);
    }
}

#[async_trait]
impl IdentityStore for InMemoryIdentityStore {
    async fn get_user_by_id(&self, id: &str) -> AppResult<User> {
        self.by_id
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("user {id}")))
    }

    async fn get_user_by_email(&self, email: &str) -> AppResult<User> {
        self.by_id
            .read()
            .await
            .values()
            .find(|u| u.email == email)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("user with email {email}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_by_id_and_email() {
        let store = InMemoryIdentityStore::new();
        store
            .upsert(User {
                id: "u1".into(),
                email: "a@example.com".into(),
                name: Some("Alice".into()),
                image: None,
                provider: "local".into(),
                provider_id: "u1".into(),
                created_at: 0,
                updated_at: 0,
            })
            .await;

        assert_eq!(store.get_user_by_id("u1").await.unwrap().email, "a@example.com");
        assert_eq!(store.get_user_by_email("a@example.com").await.unwrap().id, "u1");
        assert!(store.get_user_by_id("missing").await.is_err());
    }
}
