// src/lock/mod.rs
// C2: named leased locks (file-level, processing-level) with a network
// back-end plus in-memory fallback, mirroring the teacher's pattern of a
// pluggable back-end behind one small trait (cf. llm::provider registry).

mod memory;
mod redis_backend;

pub use memory::InMemoryLockBackend;
pub use redis_backend::RedisLockBackend;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockScope {
    File,
    Processing,
}

impl LockScope {
    pub fn default_ttl(self) -> Duration {
        match self {
            LockScope::File => Duration::from_secs(30),
            LockScope::Processing => Duration::from_secs(300),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            LockScope::File => "file",
            LockScope::Processing => "processing",
        }
    }
}

fn lock_key(scope: LockScope, user_id: &str, discussion_id: &str) -> String {
    format!("{}:{}:{}", scope.as_str(), user_id, discussion_id)
}

/// Back-end abstraction: atomic set-if-absent with expiry, and compare-and-delete release.
#[async_trait]
pub trait LockBackend: Send + Sync {
    async fn try_acquire(&self, key: &str, lock_id: &str, ttl: Duration) -> AppResult<bool>;
    async fn release(&self, key: &str, lock_id: &str) -> AppResult<()>;
}

pub struct LockService {
    backend: Arc<dyn LockBackend>,
}

/// RAII guard that releases its lock when dropped is not expressible for an
/// async backend without blocking drop; callers use `with_lock` for
/// guaranteed release, or `release` explicitly.
pub struct LockHandle {
    scope: LockScope,
    user_id: String,
    discussion_id: String,
    lock_id: String,
}

impl LockService {
    pub fn new(backend: Arc<dyn LockBackend>) -> Self {
        Self { backend }
    }

    pub async fn acquire(
        &self,
        scope: LockScope,
        user_id: &str,
        discussion_id: &str,
        ttl: Duration,
    ) -> AppResult<Option<LockHandle>> {
        let key = lock_key(scope, user_id, discussion_id);
        let lock_id = Uuid::new_v4().to_string();
        let acquired = self.backend.try_acquire(&key, &lock_id, ttl).await?;
        if acquired {
            Ok(Some(LockHandle {
                scope,
                user_id: user_id.to_string(),
                discussion_id: discussion_id.to_string(),
                lock_id,
            }))
        } else {
            Ok(None)
        }
    }

    pub async fn acquire_with_retry(
        &self,
        scope: LockScope,
        user_id: &str,
        discussion_id: &str,
        ttl: Duration,
        max_attempts: u32,
    ) -> AppResult<Option<LockHandle>> {
        for attempt in 0..max_attempts {
            if let Some(handle) = self.acquire(scope, user_id, discussion_id, ttl).await? {
                return Ok(Some(handle));
            }
            if attempt + 1 < max_attempts {
                sleep(Duration::from_millis(100)).await;
            }
        }
        Ok(None)
    }

    pub async fn release(&self, handle: LockHandle) -> AppResult<()> {
        let key = lock_key(handle.scope, &handle.user_id, &handle.discussion_id);
        self.backend.release(&key, &handle.lock_id).await
    }

    /// Scoped acquisition with guaranteed release on any exit path from `f`,
    /// including an error return.
    pub async fn with_lock<F, Fut, T>(
        &self,
        scope: LockScope,
        user_id: &str,
        discussion_id: &str,
        ttl: Duration,
        f: F,
    ) -> AppResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = AppResult<T>>,
    {
        let handle = self
            .acquire(scope, user_id, discussion_id, ttl)
            .await?
            .ok_or(AppError::AlreadyProcessing)?;

        let result = f().await;
        // Release regardless of success/failure; log but don't mask the original error.
        if let Err(e) = self.release(handle).await {
            tracing::error!("failed to release {:?} lock: {}", scope, e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_fails_until_released() {
        let svc = LockService::new(Arc::new(InMemoryLockBackend::new()));
        let h1 = svc.acquire(LockScope::Processing, "u1", "d1", Duration::from_secs(5)).await.unwrap();
        assert!(h1.is_some());

        let h2 = svc.acquire(LockScope::Processing, "u1", "d1", Duration::from_secs(5)).await.unwrap();
        assert!(h2.is_none(), "second acquire must fail while first is held");

        svc.release(h1.unwrap()).await.unwrap();

        let h3 = svc.acquire(LockScope::Processing, "u1", "d1", Duration::from_secs(5)).await.unwrap();
        assert!(h3.is_some(), "lock must be available again after release");
    }

    #[tokio::test]
    async fn with_lock_releases_on_error() {
        let svc = LockService::new(Arc::new(InMemoryLockBackend::new()));
        let res: AppResult<()> = svc
            .with_lock(LockScope::File, "u1", "d1", Duration::from_secs(5), || async {
                Err(AppError::Internal("boom".into()))
            })
            .await;
        assert!(res.is_err());

        // Lock must be free again despite the error.
        let h = svc.acquire(LockScope::File, "u1", "d1", Duration::from_secs(5)).await.unwrap();
        assert!(h.is_some());
    }

    #[tokio::test]
    async fn expired_lock_can_be_reacquired() {
        let svc = LockService::new(Arc::new(InMemoryLockBackend::new()));
        let h1 = svc.acquire(LockScope::File, "u1", "d1", Duration::from_millis(10)).await.unwrap();
        assert!(h1.is_some());
        sleep(Duration::from_millis(50)).await;

        let h2 = svc.acquire(LockScope::File, "u1", "d1", Duration::from_secs(5)).await.unwrap();
        assert!(h2.is_some(), "expired lock should be reacquirable");
    }
}
