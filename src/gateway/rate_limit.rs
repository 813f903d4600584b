// src/gateway/rate_limit.rs
// Per-source-address connection and message limits (spec §4.9, §6), built on
// `governor` the way the teacher's `utils/rate_limiter.rs` wraps it, but keyed
// per `IpAddr` instead of a single global limiter since the gateway must cap
// each client independently.

use std::collections::HashMap;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter as GovRateLimiter};
use parking_lot::RwLock;

use crate::config::GatewayConfig;

type KeyedLimiter = GovRateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

/// Tracks concurrent connections and admission rate per source address, plus
/// a message-rate limiter per address once connected.
pub struct GatewayLimiter {
    max_connections_per_ip: u32,
    max_payload_bytes: usize,
    connection_counts: RwLock<HashMap<IpAddr, Arc<AtomicU32>>>,
    connection_rate: KeyedLimiter,
    message_rate: KeyedLimiter,
}

impl GatewayLimiter {
    pub fn new(config: &GatewayConfig) -> Self {
        let conn_quota = Quota::per_minute(
            NonZeroU32::new(config.connection_rate_limit_per_min.max(1)).unwrap(),
        );
        let msg_quota =
            Quota::per_minute(NonZeroU32::new(config.max_messages_per_minute.max(1)).unwrap());
        Self {
            max_connections_per_ip: config.max_connections_per_ip,
            max_payload_bytes: config.max_payload_bytes,
            connection_counts: RwLock::new(HashMap::new()),
            connection_rate: GovRateLimiter::keyed(conn_quota),
            message_rate: GovRateLimiter::keyed(msg_quota),
        }
    }

    pub fn max_payload_bytes(&self) -> usize {
        self.max_payload_bytes
    }

    /// Admits a new connection from `addr`, returning a guard that decrements
    /// the live count on drop. `None` means rejected (rate or concurrency cap).
    pub fn try_admit(&self, addr: IpAddr) -> Option<ConnectionGuard> {
        if self.connection_rate.check_key(&addr).is_err() {
            return None;
        }
        let counter = self
            .connection_counts
            .write()
            .entry(addr)
            .or_insert_with(|| Arc::new(AtomicU32::new(0)))
            .clone();
        let current = counter.fetch_add(1, Ordering::SeqCst);
        if current >= self.max_connections_per_ip {
            counter.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(ConnectionGuard { counter })
    }

    pub fn try_message(&self, addr: IpAddr) -> bool {
        self.message_rate.check_key(&addr).is_ok()
    }

    /// Drops idle per-address bookkeeping so the map doesn't grow unbounded
    /// across the lifetime of a long-running process.
    pub fn sweep_idle(&self, idle_addresses: &[IpAddr]) {
        let mut counts = self.connection_counts.write();
        for addr in idle_addresses {
            if counts.get(addr).map(|c| c.load(Ordering::SeqCst) == 0).unwrap_or(false) {
                counts.remove(addr);
            }
        }
    }
}

pub struct ConnectionGuard {
    counter: Arc<AtomicU32>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Default idle-session timeout as a `Duration`, for consistency with the
/// `tokio::time` sweep task in `gateway::session`.
pub fn idle_timeout(config: &GatewayConfig) -> Duration {
    Duration::from_secs(config.idle_timeout_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GatewayConfig {
        GatewayConfig {
            max_connections_per_ip: 2,
            connection_rate_limit_per_min: 100,
            max_messages_per_minute: 100,
            max_payload_bytes: 1024,
            idle_timeout_secs: 1800,
        }
    }

    #[test]
    fn admits_up_to_the_per_ip_cap_then_rejects() {
        let limiter = GatewayLimiter::new(&config());
        let addr: IpAddr = "127.0.0.1".parse().unwrap();
        let g1 = limiter.try_admit(addr);
        let g2 = limiter.try_admit(addr);
        let g3 = limiter.try_admit(addr);
        assert!(g1.is_some());
        assert!(g2.is_some());
        assert!(g3.is_none());
    }

    #[test]
    fn dropping_a_guard_frees_a_slot() {
        let limiter = GatewayLimiter::new(&config());
        let addr: IpAddr = "127.0.0.1".parse().unwrap();
        let g1 = limiter.try_admit(addr).unwrap();
        let _g2 = limiter.try_admit(addr).unwrap();
        drop(g1);
        assert!(limiter.try_admit(addr).is_some());
    }

    #[test]
    fn distinct_addresses_have_independent_budgets() {
        let limiter = GatewayLimiter::new(&config());
        let a: IpAddr = "127.0.0.1".parse().unwrap();
        let b: IpAddr = "127.0.0.2".parse().unwrap();
        let _g1 = limiter.try_admit(a).unwrap();
        let _g2 = limiter.try_admit(a).unwrap();
        assert!(limiter.try_admit(b).is_some());
    }
}
