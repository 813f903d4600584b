// src/main.rs
// HTTP/WS bootstrap (spec §4.12): builds the axum router, wires the gateway,
// spawns the background sweepers, and serves with a bounded graceful
// shutdown drain, the way the teacher's `mira-chat::server::run` assembles
// `Router::new()` + `TcpListener` + `axum::serve`, generalized with the
// WS gateway and the sweepers this spec adds.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use sqlx::sqlite::SqlitePool;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{fmt, EnvFilter};

use conclave::config::CONFIG;
use conclave::gateway;
use conclave::identity::InMemoryIdentityStore;
use conclave::lock::{InMemoryLockBackend, LockService, RedisLockBackend};
use conclave::provider::{anthropic_style::AnthropicStyleAdapter, openai_style::OpenAiStyleAdapter, LogicalProvider, ProviderRegistry};
use conclave::scheduler::RoundScheduler;
use conclave::store::{DiscussionStore, MetadataIndex};
use conclave::AppState;

/// Bounded deadline for in-flight streams to finish once shutdown starts
/// (spec §5's graceful-shutdown concurrency note).
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    CONFIG.validate()?;
    conclave::metrics::init();

    let pool = SqlitePool::connect(&CONFIG.storage.database_path).await?;
    let index = MetadataIndex::new(pool).await?;

    let locks = Arc::new(build_lock_service()?);

    std::fs::create_dir_all(&CONFIG.storage.discussions_dir)?;
    let store = Arc::new(DiscussionStore::with_token_sync(
        std::path::PathBuf::from(&CONFIG.storage.discussions_dir),
        index,
        locks.clone(),
        &CONFIG.retry,
        CONFIG.context.reconciliation_tolerance_pct,
        CONFIG.context.stale_discussion_secs,
        CONFIG.context.token_limit,
        &CONFIG.token_sync,
    ));

    let providers = Arc::new(build_provider_registry());
    let default_provider = std::env::var("DEFAULT_PROVIDER").unwrap_or_else(|_| "openai".to_string());

    let scheduler = Arc::new(RoundScheduler::new(
        store.clone(),
        locks.clone(),
        providers.clone(),
        default_provider.clone(),
        CONFIG.context.token_limit,
    ));

    let identity = Arc::new(InMemoryIdentityStore::new());

    let state = Arc::new(AppState::new(store.clone(), locks.clone(), providers, scheduler, identity, default_provider, &CONFIG.gateway));

    spawn_sweepers(state.clone());

    let cors = CorsLayer::permissive();
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(conclave::metrics::handler))
        .merge(gateway::router(state.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(60)))
        .layer(cors)
        .with_state(state.clone());

    let addr: SocketAddr = CONFIG.server.bind_address().parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "conclave listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn build_lock_service() -> anyhow::Result<LockService> {
    if let Some(redis) = &CONFIG.redis {
        tracing::info!("using Redis lock backend");
        Ok(LockService::new(Arc::new(RedisLockBackend::new(&redis.url)?)))
    } else {
        tracing::info!("using in-memory lock backend");
        let backend = Arc::new(InMemoryLockBackend::new());
        backend.spawn_sweeper(Duration::from_secs(10));
        Ok(LockService::new(backend))
    }
}

/// Registers every provider this binary can reach credentials for. Spec §4.5
/// requires at least two back-ends; both adapters share the same
/// `ModelAdapter` trait so either can lead with the other as fallback.
fn build_provider_registry() -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();

    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        let base_url = std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        registry.register(LogicalProvider {
            name: "openai".to_string(),
            adapter: Arc::new(OpenAiStyleAdapter::new(base_url, key)),
            primary_model: std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o".to_string()),
            fallback_models: vec![std::env::var("OPENAI_FALLBACK_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string())],
            timeout: Duration::from_secs(120),
            max_attempts: 3,
        });
    }

    if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
        let base_url = std::env::var("ANTHROPIC_BASE_URL").unwrap_or_else(|_| "https://api.anthropic.com".to_string());
        registry.register(LogicalProvider {
            name: "anthropic".to_string(),
            adapter: Arc::new(AnthropicStyleAdapter::new(base_url, key)),
            primary_model: std::env::var("ANTHROPIC_MODEL").unwrap_or_else(|_| "claude-3-5-sonnet-latest".to_string()),
            fallback_models: vec![std::env::var("ANTHROPIC_FALLBACK_MODEL").unwrap_or_else(|_| "claude-3-haiku-latest".to_string())],
            timeout: Duration::from_secs(120),
            max_attempts: 3,
        });
    }

    if registry.get("openai").is_err() && registry.get("anthropic").is_err() {
        tracing::warn!("no provider API keys configured; registering mock provider for local smoke testing");
        registry.register(LogicalProvider {
            name: "mock".to_string(),
            adapter: Arc::new(conclave::provider::mock::MockAdapter::echo()),
            primary_model: "mock-1".to_string(),
            fallback_models: vec![],
            timeout: Duration::from_secs(30),
            max_attempts: 1,
        });
    }

    registry
}

/// Background sweepers: stale-discussion reconciliation and idle-session
/// eviction (spec §4.1, §4.9). The lock-expiry sweep is started inline by
/// `build_lock_service` when the in-memory backend is in use.
fn spawn_sweepers(state: Arc<AppState>) {
    gateway::spawn_idle_sweeper(state.clone(), gateway::rate_limit::idle_timeout(&CONFIG.gateway));

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(300));
        loop {
            ticker.tick().await;
            if let Err(e) = state.store.reconcile_all().await {
                tracing::warn!(error = %e, "reconciliation sweep failed");
            }
        }
    });
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.providers.get(&state.default_provider) {
        Ok(_) => StatusCode::OK.into_response(),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "default provider unavailable").into_response(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async { tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler") };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!(drain = ?SHUTDOWN_DRAIN, "shutdown signal received, draining in-flight streams");
    tokio::time::sleep(SHUTDOWN_DRAIN).await;
}
