// src/lock/redis_backend.rs
// Network cache-backed lock, used when REDIS_URL (or host/port) is configured
// (spec §6). Acquisition is a single atomic `SET key value NX PX ttl`;
// release is a compare-and-delete Lua script so a party can never clear a
// lock it doesn't hold.

use async_trait::async_trait;
use std::time::Duration;

use super::LockBackend;
use crate::error::{AppError, AppResult};

const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

pub struct RedisLockBackend {
    client: redis::Client,
}

impl RedisLockBackend {
    pub fn new(url: &str) -> AppResult<Self> {
        let client = redis::Client::open(url).map_err(|e| AppError::Internal(format!("invalid redis url: {e}")))?;
        Ok(Self { client })
    }

    async fn conn(&self) -> AppResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| AppError::Transient(format!("redis connection failed: {e}")))
    }
}

#[async_trait]
impl LockBackend for RedisLockBackend {
    async fn try_acquire(&self, key: &str, lock_id: &str, ttl: Duration) -> AppResult<bool> {
        let mut conn = self.conn().await?;
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(lock_id)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| AppError::Transient(format!("redis SET failed: {e}")))?;
        Ok(result.is_some())
    }

    async fn release(&self, key: &str, lock_id: &str) -> AppResult<()> {
        let mut conn = self.conn().await?;
        let script = redis::Script::new(RELEASE_SCRIPT);
        let _: i32 = script
            .key(key)
            .arg(lock_id)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| AppError::Transient(format!("redis release script failed: {e}")))?;
        Ok(())
    }
}
