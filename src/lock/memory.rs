// src/lock/memory.rs
// In-process lock backend: a mutex-guarded map with a background expiry sweep.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::LockBackend;
use crate::error::AppResult;

struct Entry {
    lock_id: String,
    expires_at: Instant,
}

pub struct InMemoryLockBackend {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl InMemoryLockBackend {
    pub fn new() -> Self {
        Self { entries: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Spawns a background task that periodically drops expired entries, so
    /// stale processing locks expire on their own TTL (spec §5) even if no
    /// one ever tries to acquire that exact key again.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) {
        let entries = self.entries.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let now = Instant::now();
                let mut guard = entries.lock().await;
                guard.retain(|_, e| e.expires_at > now);
            }
        });
    }
}

impl Default for InMemoryLockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockBackend for InMemoryLockBackend {
    async fn try_acquire(&self, key: &str, lock_id: &str, ttl: Duration) -> AppResult<bool> {
        let now = Instant::now();
        let mut guard = self.entries.lock().await;

        if let Some(existing) = guard.get(key) {
            if existing.expires_at > now {
                return Ok(false);
            }
        }

        guard.insert(key.to_string(), Entry { lock_id: lock_id.to_string(), expires_at: now + ttl });
        Ok(true)
    }

    async fn release(&self, key: &str, lock_id: &str) -> AppResult<()> {
        let mut guard = self.entries.lock().await;
        if let Some(existing) = guard.get(key) {
            if existing.lock_id == lock_id {
                guard.remove(key);
            }
            // Nonce mismatch: another party holds the lock now. Silently no-op,
            // matching spec §4.8's "one party never releases another's lock".
        }
        Ok(())
    }
}
