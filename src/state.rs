// src/state.rs
// Shared application state, composed the way the teacher's `web::state::AppState`
// bundles its db/embeddings/broadcast handles into one `Clone`-able struct
// threaded through axum's `State` extractor.

use std::sync::Arc;

use crate::gateway::rate_limit::GatewayLimiter;
use crate::gateway::room::DiscussionRoom;
use crate::gateway::session::SessionRegistry;
use crate::identity::IdentityStore;
use crate::lock::LockService;
use crate::provider::ProviderRegistry;
use crate::scheduler::RoundScheduler;
use crate::store::DiscussionStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<DiscussionStore>,
    pub locks: Arc<LockService>,
    pub providers: Arc<ProviderRegistry>,
    pub scheduler: Arc<RoundScheduler>,
    pub identity: Arc<dyn IdentityStore>,
    pub sessions: Arc<SessionRegistry>,
    pub rooms: Arc<DiscussionRoom>,
    pub limiter: Arc<GatewayLimiter>,
    pub default_provider: String,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<DiscussionStore>,
        locks: Arc<LockService>,
        providers: Arc<ProviderRegistry>,
        scheduler: Arc<RoundScheduler>,
        identity: Arc<dyn IdentityStore>,
        default_provider: String,
        gateway_config: &crate::config::GatewayConfig,
    ) -> Self {
        let sessions = Arc::new(SessionRegistry::new());
        let rooms = Arc::new(DiscussionRoom::new(sessions.clone()));
        let limiter = Arc::new(GatewayLimiter::new(gateway_config));
        Self { store, locks, providers, scheduler, identity, sessions, rooms, limiter, default_provider }
    }
}
