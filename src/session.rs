//! Session collaborators: the remote session API, the server-list cache and
//! per-server statistics

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;
use crate::models::probe::round2;
use crate::models::{
    Credentials, LoginInfo, ProbeResult, ServerDescriptor, SessionState, StatisticsSnapshot,
};

/// Remote session service.
///
/// Implementations own their transport and endpoint settings.
#[async_trait]
pub trait SessionApi: Send + Sync {
    async fn login(&self, username: &str, password: &str, code: Option<&str>) -> Result<LoginInfo>;

    /// Proxy credentials as delivered on the wire: both fields base64-encoded
    async fn fetch_proxy_credentials(&self, session_auth_hash: &str) -> Result<Credentials>;

    async fn fetch_server_list(&self, loc_hash: &str, is_premium: bool) -> Result<Vec<ServerDescriptor>>;
}

struct CachedServers {
    servers: Arc<Vec<ServerDescriptor>>,
    expires_at: Instant,
}

/// Server list shared by readers; a refresh replaces it wholesale
pub struct ServerListCache {
    ttl: Duration,
    current: ArcSwapOption<CachedServers>,
}

impl ServerListCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            current: ArcSwapOption::empty(),
        }
    }

    /// The cached list, unless it has expired
    pub fn get(&self) -> Option<Arc<Vec<ServerDescriptor>>> {
        let guard = self.current.load();
        let cached = guard.as_ref()?;
        (Instant::now() < cached.expires_at).then(|| cached.servers.clone())
    }

    pub fn store(&self, servers: Vec<ServerDescriptor>) -> Arc<Vec<ServerDescriptor>> {
        let servers = Arc::new(servers);
        self.current.store(Some(Arc::new(CachedServers {
            servers: servers.clone(),
            expires_at: Instant::now() + self.ttl,
        })));
        servers
    }

    pub fn clear(&self) {
        self.current.store(None);
    }
}

#[derive(Debug, Default)]
struct ServerStats {
    successes: u64,
    total_latency_ms: u64,
}

impl ServerStats {
    fn average_latency_ms(&self) -> Option<u64> {
        (self.successes > 0).then(|| self.total_latency_ms / self.successes)
    }
}

/// Probe outcomes accumulated per server
#[derive(Debug, Default)]
pub struct Statistics {
    servers: DashMap<String, ServerStats>,
    total: AtomicU64,
    successful: AtomicU64,
    total_latency_ms: AtomicU64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, hostname: &str, success: bool, latency_ms: u64) {
        self.total.fetch_add(1, Ordering::Relaxed);

        if success {
            let mut entry = self.servers.entry(hostname.to_string()).or_default();
            entry.successes += 1;
            entry.total_latency_ms += latency_ms;
            self.successful.fetch_add(1, Ordering::Relaxed);
            self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
        }
    }

    pub fn record_probe(&self, result: &ProbeResult) {
        self.record(&result.hostname, result.success, result.latency_ms);
    }

    /// Lowest average latency among servers with at least one success
    pub fn best_server(&self) -> Option<String> {
        self.servers
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .average_latency_ms()
                    .map(|avg| (avg, entry.key().clone()))
            })
            .min()
            .map(|(_, hostname)| hostname)
    }

    pub fn snapshot(&self, state: &SessionState) -> StatisticsSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let successful = self.successful.load(Ordering::Relaxed);
        let latency = self.total_latency_ms.load(Ordering::Relaxed);

        StatisticsSnapshot {
            total_tests: total,
            successful_tests: successful,
            success_rate: if total == 0 {
                0.0
            } else {
                round2(successful as f64 / total as f64 * 100.0)
            },
            best_server: self.best_server(),
            average_latency_ms: if successful == 0 { 0 } else { latency / successful },
            connected_servers: state.connected_servers.clone(),
            failed_servers: state.failed_servers.clone(),
            last_heartbeat: state.last_heartbeat,
        }
    }

    pub fn reset(&self) {
        self.servers.clear();
        self.total.store(0, Ordering::Relaxed);
        self.successful.store(0, Ordering::Relaxed);
        self.total_latency_ms.store(0, Ordering::Relaxed);
    }
}
