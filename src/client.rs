//! Session-owning client
//!
//! [`VeilClient`] ties the tunnel primitives to one logged-in session: it
//! holds the session state, caches the server list, keeps statistics and
//! publishes [`ClientEvent`]s.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::error::{Result, VeilError};
use crate::events::{ClientEvent, EventBus};
use crate::models::{
    BulkProbeReport, Credentials, HealthStatus, LatencyReport, LoginInfo, MonitoringSummary,
    ProbeResult, ProxyTarget, ServerDescriptor, SessionState, StatisticsSnapshot,
};
use crate::proxy::balancer::{
    BalanceOutcome, BalancedRequest, LoadBalanceConfig, LoadBalancer, TunnelExecutor,
};
use crate::proxy::health::{HealthMonitor, MonitoredSession, ReconnectHook};
use crate::proxy::probe::{BulkProbeConfig, ProbeOptions, Prober};
use crate::session::{ServerListCache, SessionApi, Statistics};

/// Filters for [`VeilClient::find_best_servers`]
#[derive(Debug, Clone)]
pub struct ServerSearch {
    /// ISO country code; `None` searches every server
    pub country: Option<String>,
    pub max_latency_ms: u64,
    /// Maximum number of servers returned
    pub count: usize,
    /// Skip servers that failed an earlier probe
    pub exclude_failed: bool,
}

impl Default for ServerSearch {
    fn default() -> Self {
        Self {
            country: None,
            max_latency_ms: 1000,
            count: 5,
            exclude_failed: true,
        }
    }
}

struct ClientInner {
    config: Config,
    api: Arc<dyn SessionApi>,
    state: RwLock<SessionState>,
    cache: ServerListCache,
    stats: Statistics,
    events: EventBus,
}

impl ClientInner {
    fn prober(&self) -> Prober {
        Prober::new(&self.config.probe).with_credentials(self.state.read().proxy_credentials())
    }

    /// Statistics, connected/failed bookkeeping and the matching event
    fn record(&self, result: &ProbeResult) {
        self.stats.record_probe(result);
        {
            let mut state = self.state.write();
            if result.success {
                state.mark_connected(&result.hostname);
            } else {
                state.mark_failed(&result.hostname);
            }
        }
        self.events.emit(ClientEvent::from_probe(result));
    }

    async fn server_list(&self) -> Result<Arc<Vec<ServerDescriptor>>> {
        if let Some(servers) = self.cache.get() {
            return Ok(servers);
        }

        let (loc_hash, is_premium) = {
            let state = self.state.read();
            if !state.is_active() {
                return Err(VeilError::NoActiveSession);
            }
            (state.loc_hash.clone(), state.is_premium)
        };

        let servers = self.api.fetch_server_list(&loc_hash, is_premium).await?;
        info!("Fetched {} servers", servers.len());
        Ok(self.cache.store(servers))
    }

    async fn test_proxy(&self, hostname: &str, port: u16, timeout: Duration) -> ProbeResult {
        let result = self.prober().probe_ip(hostname, port, timeout).await;
        self.record(&result);
        result
    }
}

#[async_trait]
impl MonitoredSession for ClientInner {
    fn is_active(&self) -> bool {
        self.state.read().is_active()
    }

    async fn servers(&self) -> Result<Arc<Vec<ServerDescriptor>>> {
        self.server_list().await
    }

    async fn probe(&self, server: &ServerDescriptor, timeout: Duration) -> ProbeResult {
        let target = ProxyTarget::from(server);
        self.test_proxy(&target.hostname, target.port_or_default(), timeout)
            .await
    }

    fn report(&self, status: &HealthStatus) {
        self.events.emit(ClientEvent::HealthCheck(status.clone()));
    }
}

/// Client for one proxy session
pub struct VeilClient {
    inner: Arc<ClientInner>,
    monitor: HealthMonitor,
    balancer: LoadBalancer<TunnelExecutor>,
}

impl VeilClient {
    pub fn new(config: Config, api: Arc<dyn SessionApi>) -> Self {
        let monitor = HealthMonitor::new(config.health.clone());
        let balancer = LoadBalancer::new(TunnelExecutor {
            credentials: None,
            fake_sni: config.probe.fake_sni.clone(),
            user_agent: config.probe.user_agent.clone(),
            timeout: config.probe.timeout,
        });
        let cache = ServerListCache::new(config.session.server_list_ttl);

        Self {
            inner: Arc::new(ClientInner {
                config,
                api,
                state: RwLock::new(SessionState::default()),
                cache,
                stats: Statistics::new(),
                events: EventBus::default(),
            }),
            monitor,
            balancer,
        }
    }

    /// Replace the monitor's reconnect hook. Stops monitoring if it was running.
    pub fn with_reconnect_hook(mut self, hook: Arc<dyn ReconnectHook>) -> Self {
        self.monitor.stop();
        self.monitor = HealthMonitor::new(self.inner.config.health.clone()).with_reconnect_hook(hook);
        self
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.events.subscriber_count()
    }

    /// Stop monitoring and close the event bus. Subscribers see `Closed`
    /// once they have drained buffered events.
    pub fn shutdown(&self) {
        self.monitor.stop();
        if self.inner.events.close() {
            info!("Client shut down");
        }
    }

    /// A copy of the current session state
    pub fn state(&self) -> SessionState {
        self.inner.state.read().clone()
    }

    pub fn set_state(&self, state: SessionState) {
        *self.inner.state.write() = state;
    }

    #[instrument(skip(self, password, code))]
    pub async fn login(&self, username: &str, password: &str, code: Option<&str>) -> Result<LoginInfo> {
        let info = self
            .inner
            .api
            .login(username, password, code.filter(|c| !c.is_empty()))
            .await?;

        self.inner.state.write().apply_login(&info);
        self.inner.cache.clear();
        info!("Logged in as {}", username);
        self.inner.events.emit(ClientEvent::SessionCreated {
            username: username.to_string(),
        });
        Ok(info)
    }

    /// Fetch and decode the proxy credentials for the active session
    pub async fn refresh_credentials(&self) -> Result<Credentials> {
        let session_auth_hash = {
            let state = self.inner.state.read();
            if !state.is_active() {
                return Err(VeilError::NoActiveSession);
            }
            state.session_auth_hash.clone()
        };

        let encoded = self
            .inner
            .api
            .fetch_proxy_credentials(&session_auth_hash)
            .await?;
        let credentials = Credentials::from_base64(&encoded.username, &encoded.password)?;

        self.inner.state.write().apply_credentials(&credentials);
        self.inner.events.emit(ClientEvent::CredentialsRefreshed);
        Ok(credentials)
    }

    /// Server list, served from cache while it is fresh
    pub async fn server_list(&self) -> Result<Arc<Vec<ServerDescriptor>>> {
        self.inner.server_list().await
    }

    pub fn clear_cache(&self) {
        self.inner.cache.clear();
        self.inner.events.emit(ClientEvent::CacheCleared);
    }

    /// Probe one proxy against the IP echo service
    pub async fn test_proxy(&self, hostname: &str, port: u16, timeout: Duration) -> ProbeResult {
        self.inner.test_proxy(hostname, port, timeout).await
    }

    /// Probe one proxy with a caller-chosen target URL, SNI and headers
    pub async fn test_custom_proxy(&self, options: &ProbeOptions) -> ProbeResult {
        let result = self.inner.prober().probe(options).await;
        self.inner.record(&result);
        result
    }

    pub async fn bulk_test(&self, targets: &[ProxyTarget], config: &BulkProbeConfig) -> BulkProbeReport {
        let report = self
            .inner
            .prober()
            .bulk_with(targets, config, |result| self.inner.record(result))
            .await;
        self.inner
            .events
            .emit(ClientEvent::BulkTestCompleted(report.clone()));
        report
    }

    /// Probe the session's servers and return the fastest reachable ones,
    /// sorted by latency
    #[instrument(skip(self))]
    pub async fn find_best_servers(&self, search: &ServerSearch) -> Result<Vec<ProbeResult>> {
        let servers = self.inner.server_list().await?;
        let failed = self.inner.state.read().failed_servers.clone();

        let candidates: Vec<ProxyTarget> = servers
            .iter()
            .filter(|s| search.country.as_deref().map_or(true, |c| s.in_country(c)))
            .filter(|s| !(search.exclude_failed && failed.contains(&s.hostname)))
            .map(ProxyTarget::from)
            .collect();

        if candidates.is_empty() {
            warn!("No candidate servers match the search");
            return Ok(Vec::new());
        }

        let report = self
            .bulk_test(&candidates, &BulkProbeConfig::from(&self.inner.config.probe))
            .await;

        let mut best: Vec<ProbeResult> = report
            .results
            .into_iter()
            .filter(|r| r.success && r.latency_ms <= search.max_latency_ms)
            .collect();
        best.sort_by_key(|r| r.latency_ms);
        best.truncate(search.count);
        Ok(best)
    }

    /// Probe one server `rounds` times in sequence
    pub async fn test_server_latency(&self, hostname: &str, port: u16, rounds: usize) -> LatencyReport {
        let mut results = Vec::with_capacity(rounds);
        for _ in 0..rounds {
            results.push(
                self.test_proxy(hostname, port, self.inner.config.probe.timeout)
                    .await,
            );
        }
        LatencyReport::from_results(hostname, results)
    }

    /// Spread requests over `servers`, using the session's proxy credentials
    /// for servers that carry none
    pub async fn load_balance(
        &self,
        servers: &[ProxyTarget],
        requests: &[BalancedRequest],
        config: LoadBalanceConfig,
    ) -> Result<Vec<BalanceOutcome>> {
        let session_credentials = self.inner.state.read().proxy_credentials();
        let servers: Vec<ProxyTarget> = servers
            .iter()
            .cloned()
            .map(|mut server| {
                if server.credentials.is_none() {
                    server.credentials = session_credentials.clone();
                }
                server
            })
            .collect();

        let outcomes = self.balancer.distribute(&servers, requests, config).await?;
        for outcome in &outcomes {
            self.inner
                .stats
                .record(&outcome.server, outcome.success, outcome.latency_ms);
        }
        Ok(outcomes)
    }

    /// Probe one server on every health interval until `duration` has passed
    #[instrument(skip(self))]
    pub async fn monitor_connection(&self, hostname: &str, port: u16, duration: Duration) -> MonitoringSummary {
        let started_at = Utc::now();
        let deadline = Instant::now() + duration;
        self.inner.events.emit(ClientEvent::MonitoringStarted {
            hostname: hostname.to_string(),
            port,
            duration_ms: duration.as_millis() as u64,
        });

        let mut ticker = interval(self.inner.config.health.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut results = Vec::new();

        loop {
            tokio::select! {
                biased;

                _ = sleep_until(deadline) => break,
                _ = ticker.tick() => {
                    let result = self.test_proxy(hostname, port, self.inner.config.probe.timeout).await;
                    self.inner
                        .events
                        .emit(ClientEvent::MonitoringResult(result.clone()));
                    results.push(result);
                }
            }
        }

        let summary = MonitoringSummary::from_results(hostname, port, &results, started_at);
        info!(
            "Monitoring of {} finished: {}/{} checks passed",
            hostname, summary.successful, summary.checks
        );
        self.inner
            .events
            .emit(ClientEvent::MonitoringCompleted(summary.clone()));
        summary
    }

    /// Start the background health monitor
    pub fn start_monitoring(&self) -> bool {
        self.monitor.start(self.inner.clone())
    }

    pub fn stop_monitoring(&self) -> bool {
        self.monitor.stop()
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.is_monitoring()
    }

    /// One health check outside the timer
    pub async fn check_health(&self) -> HealthStatus {
        self.monitor.check_once(self.inner.as_ref()).await
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.inner.stats.snapshot(&self.inner.state.read())
    }

    pub fn reset_statistics(&self) {
        self.inner.stats.reset();
    }

    /// Write the session state as JSON. Returns `false` on any failure.
    pub fn save_state(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        let state = self.state();
        match state.save(path) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to save state to {}: {}", path.display(), e);
                false
            }
        }
    }

    /// Replace the session state from a JSON file; absent fields take their
    /// defaults. Counters start over for the loaded session. Returns `false`
    /// and leaves everything untouched when the file is missing, blank or
    /// unparsable.
    pub fn load_state(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        match SessionState::load(path) {
            Ok(Some(state)) => {
                self.set_state(state);
                self.inner.cache.clear();
                self.inner.stats.reset();
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("Failed to load state from {}: {}", path.display(), e);
                false
            }
        }
    }

    /// [`save_state`](Self::save_state) to the configured state file
    pub fn save(&self) -> bool {
        self.save_state(&self.inner.config.session.state_file)
    }

    /// [`load_state`](Self::load_state) from the configured state file
    pub fn load(&self) -> bool {
        self.load_state(&self.inner.config.session.state_file)
    }
}

impl Drop for VeilClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}
