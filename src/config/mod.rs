// src/config/mod.rs
// Central configuration, composed from per-domain config structs the way the
// teacher's MiraConfig composes llm/memory/server sub-configs.

pub mod helpers;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

lazy_static! {
    pub static ref CONFIG: Config = Config::from_env();
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub retry: RetryConfig,
    pub gateway: GatewayConfig,
    pub context: ContextConfig,
    pub redis: Option<RedisConfig>,
    pub alerts: AlertConfig,
    pub token_sync: TokenSyncConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    fn from_env() -> Self {
        Self {
            host: helpers::env_or("HOST", "0.0.0.0"),
            port: helpers::env_parsed_or("PORT", 8080),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub database_path: String,
    pub discussions_dir: String,
    pub backups_dir: String,
}

impl StorageConfig {
    fn from_env() -> Self {
        Self {
            database_path: helpers::env_or("DATABASE_PATH", "sqlite://conclave.db"),
            discussions_dir: helpers::env_or("DISCUSSIONS_DIR", "./discussions"),
            backups_dir: helpers::env_or("BACKUPS_DIR", "./backups"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl RetryConfig {
    fn from_env() -> Self {
        Self {
            max_retries: helpers::env_parsed_or("FILE_OPERATION_MAX_RETRIES", 3),
            retry_delay_ms: helpers::env_parsed_or("FILE_OPERATION_RETRY_DELAY_MS", 100),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub max_connections_per_ip: u32,
    pub connection_rate_limit_per_min: u32,
    pub max_messages_per_minute: u32,
    pub max_payload_bytes: usize,
    pub idle_timeout_secs: u64,
}

impl GatewayConfig {
    fn from_env() -> Self {
        Self {
            max_connections_per_ip: helpers::env_parsed_or("MAX_CONNECTIONS_PER_IP", 10),
            connection_rate_limit_per_min: helpers::env_parsed_or("CONNECTION_RATE_LIMIT", 5),
            max_messages_per_minute: helpers::env_parsed_or("MAX_MESSAGES_PER_MINUTE", 100),
            max_payload_bytes: helpers::env_parsed_or("MAX_PAYLOAD_BYTES", 1_048_576),
            idle_timeout_secs: helpers::env_parsed_or("IDLE_TIMEOUT_SECS", 1800),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    pub token_limit: i64,
    pub stale_discussion_secs: i64,
    pub reconciliation_tolerance_pct: f64,
}

impl ContextConfig {
    fn from_env() -> Self {
        Self {
            token_limit: helpers::env_parsed_or("DISCUSSION_TOKEN_LIMIT", 4000),
            stale_discussion_secs: helpers::env_parsed_or("STALE_DISCUSSION_SECS", 3600),
            reconciliation_tolerance_pct: helpers::env_parsed_or("RECONCILIATION_TOLERANCE_PCT", 0.05),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    pub enabled: bool,
    pub error_rate_threshold: f64,
}

impl AlertConfig {
    fn from_env() -> Self {
        Self {
            enabled: helpers::env_parsed_or("ALERTS_ENABLED", false),
            error_rate_threshold: helpers::env_parsed_or("ALERT_ERROR_RATE_THRESHOLD", 0.05),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSyncConfig {
    pub enable_validation: bool,
    pub auto_repair: bool,
}

impl TokenSyncConfig {
    fn from_env() -> Self {
        Self {
            enable_validation: helpers::env_parsed_or("ENABLE_TOKEN_SYNC_VALIDATION", true),
            auto_repair: helpers::env_parsed_or("AUTO_REPAIR_TOKEN_SYNC", true),
        }
    }
}

/// Bearer-token verification at the WS upgrade edge (spec §4.11). A missing
/// `JWT_SECRET` degrades to the anonymous fallback rather than failing closed
/// — the real auth system is out of scope (spec.md §1 Non-goals).
#[derive(Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: Option<String>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig").field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "<redacted>")).finish()
    }
}

impl AuthConfig {
    fn from_env() -> Self {
        Self { jwt_secret: std::env::var("JWT_SECRET").ok() }
    }
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let redis_url = std::env::var("REDIS_URL").ok().or_else(|| {
            let host = std::env::var("REDIS_HOST").ok()?;
            let port = std::env::var("REDIS_PORT").unwrap_or_else(|_| "6379".to_string());
            Some(format!("redis://{host}:{port}"))
        });

        Self {
            server: ServerConfig::from_env(),
            storage: StorageConfig::from_env(),
            retry: RetryConfig::from_env(),
            gateway: GatewayConfig::from_env(),
            context: ContextConfig::from_env(),
            redis: redis_url.map(|url| RedisConfig { url }),
            alerts: AlertConfig::from_env(),
            token_sync: TokenSyncConfig::from_env(),
            auth: AuthConfig::from_env(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.context.token_limit <= 0 {
            anyhow::bail!("DISCUSSION_TOKEN_LIMIT must be positive");
        }
        Ok(())
    }
}
