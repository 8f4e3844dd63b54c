//! Periodic health checking of the active session's proxy servers
//!
//! Each tick samples one server at random from the session's server list and
//! probes it. Stopping the monitor lets an in-flight tick finish but no
//! further tick runs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::config::HealthConfig;
use crate::error::Result;
use crate::models::{HealthStatus, ProbeResult, ServerDescriptor};

/// Timeout for the probe run on each tick
pub const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// What the monitor needs from a session
#[async_trait]
pub trait MonitoredSession: Send + Sync {
    fn is_active(&self) -> bool;

    /// Current server list, possibly cached
    async fn servers(&self) -> Result<Arc<Vec<ServerDescriptor>>>;

    async fn probe(&self, server: &ServerDescriptor, timeout: Duration) -> ProbeResult;

    /// Called with every tick's status
    fn report(&self, status: &HealthStatus);
}

/// Invoked after a failed check when auto-reconnect is enabled
#[async_trait]
pub trait ReconnectHook: Send + Sync {
    async fn reconnect(&self, status: &HealthStatus);
}

struct Running {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Recurring health check with explicit start/stop
pub struct HealthMonitor {
    config: HealthConfig,
    reconnect: Option<Arc<dyn ReconnectHook>>,
    running: Mutex<Option<Running>>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            reconnect: None,
            running: Mutex::new(None),
        }
    }

    pub fn with_reconnect_hook(mut self, hook: Arc<dyn ReconnectHook>) -> Self {
        self.reconnect = Some(hook);
        self
    }

    pub fn is_monitoring(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .map(|running| !running.handle.is_finished())
            .unwrap_or(false)
    }

    /// Arm the timer. Returns `false` if the monitor was already running.
    pub fn start(&self, session: Arc<dyn MonitoredSession>) -> bool {
        let mut running = self.running.lock();
        if running
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
        {
            return false;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = MonitorTask {
            interval: self.config.interval,
            auto_reconnect: self.config.auto_reconnect,
            reconnect: self.reconnect.clone(),
            session,
        };
        let handle = tokio::spawn(task.run(shutdown_rx));

        *running = Some(Running { shutdown, handle });
        true
    }

    /// Disarm the timer. Returns `false` if the monitor was not running.
    pub fn stop(&self) -> bool {
        match self.running.lock().take() {
            Some(running) => {
                let _ = running.shutdown.send(true);
                true
            }
            None => false,
        }
    }

    /// Run a single check immediately, outside the timer
    pub async fn check_once(&self, session: &dyn MonitoredSession) -> HealthStatus {
        check(
            session,
            self.config.auto_reconnect,
            self.reconnect.as_deref(),
        )
        .await
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            let _ = running.shutdown.send(true);
        }
    }
}

struct MonitorTask {
    interval: Duration,
    auto_reconnect: bool,
    reconnect: Option<Arc<dyn ReconnectHook>>,
    session: Arc<dyn MonitoredSession>,
}

impl MonitorTask {
    #[instrument(skip_all, fields(interval_secs = self.interval.as_secs()))]
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Health monitor started");

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    check(
                        self.session.as_ref(),
                        self.auto_reconnect,
                        self.reconnect.as_deref(),
                    )
                    .await;
                }
            }
        }

        info!("Health monitor stopped");
    }
}

async fn check(
    session: &dyn MonitoredSession,
    auto_reconnect: bool,
    reconnect: Option<&dyn ReconnectHook>,
) -> HealthStatus {
    let status = sample(session).await;
    session.report(&status);

    if status.alive {
        debug!(
            "Health check passed for {}",
            status.tested_server.as_deref().unwrap_or("-")
        );
    } else {
        warn!("Health check failed: {}", status.reason);
        if auto_reconnect {
            if let Some(hook) = reconnect {
                hook.reconnect(&status).await;
            }
        }
    }

    status
}

async fn sample(session: &dyn MonitoredSession) -> HealthStatus {
    if !session.is_active() {
        return HealthStatus::no_active_session();
    }

    let servers = match session.servers().await {
        Ok(servers) => servers,
        Err(e) => return HealthStatus::dead(format!("Failed to fetch server list: {}", e), None),
    };

    let picked = {
        let mut rng = rand::thread_rng();
        servers.choose(&mut rng).cloned()
    };
    let Some(server) = picked else {
        return HealthStatus::dead("No servers available", None);
    };

    let probe = session.probe(&server, HEALTH_PROBE_TIMEOUT).await;
    HealthStatus::from_probe(&probe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VeilError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeSession {
        active: bool,
        healthy: bool,
        probe_delay: Duration,
        probes_started: AtomicUsize,
        probes_finished: AtomicUsize,
        reports: Mutex<Vec<HealthStatus>>,
    }

    impl FakeSession {
        fn new(active: bool, healthy: bool) -> Self {
            Self {
                active,
                healthy,
                probe_delay: Duration::ZERO,
                probes_started: AtomicUsize::new(0),
                probes_finished: AtomicUsize::new(0),
                reports: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MonitoredSession for FakeSession {
        fn is_active(&self) -> bool {
            self.active
        }

        async fn servers(&self) -> Result<Arc<Vec<ServerDescriptor>>> {
            Ok(Arc::new(vec![
                ServerDescriptor::new("nl1.example"),
                ServerDescriptor::new("nl2.example"),
            ]))
        }

        async fn probe(&self, server: &ServerDescriptor, timeout: Duration) -> ProbeResult {
            assert_eq!(timeout, HEALTH_PROBE_TIMEOUT);
            self.probes_started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.probe_delay).await;
            self.probes_finished.fetch_add(1, Ordering::SeqCst);

            let mut result = ProbeResult::failure(&server.hostname, 443, "HTTPS", 20, "refused");
            if self.healthy {
                result.success = true;
                result.error = None;
            }
            result
        }

        fn report(&self, status: &HealthStatus) {
            self.reports.lock().push(status.clone());
        }
    }

    struct FailingListSession;

    #[async_trait]
    impl MonitoredSession for FailingListSession {
        fn is_active(&self) -> bool {
            true
        }

        async fn servers(&self) -> Result<Arc<Vec<ServerDescriptor>>> {
            Err(VeilError::Session("HTTP 503".into()))
        }

        async fn probe(&self, _server: &ServerDescriptor, _timeout: Duration) -> ProbeResult {
            panic!("no server to probe");
        }

        fn report(&self, _status: &HealthStatus) {}
    }

    #[derive(Default)]
    struct RecordingHook(AtomicBool);

    #[async_trait]
    impl ReconnectHook for RecordingHook {
        async fn reconnect(&self, _status: &HealthStatus) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn config(interval_ms: u64, auto_reconnect: bool) -> HealthConfig {
        HealthConfig {
            interval: Duration::from_millis(interval_ms),
            auto_reconnect,
        }
    }

    #[tokio::test]
    async fn test_no_active_session_skips_probe() {
        let monitor = HealthMonitor::new(config(1000, false));
        let session = FakeSession::new(false, true);

        let status = monitor.check_once(&session).await;
        assert!(!status.alive);
        assert_eq!(status.reason, "No active session");
        assert_eq!(session.probes_started.load(Ordering::SeqCst), 0);
        assert_eq!(session.reports.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_healthy_server_reported_alive() {
        let monitor = HealthMonitor::new(config(1000, false));
        let session = FakeSession::new(true, true);

        let status = monitor.check_once(&session).await;
        assert!(status.alive);
        assert!(matches!(
            status.tested_server.as_deref(),
            Some("nl1.example" | "nl2.example")
        ));
    }

    #[tokio::test]
    async fn test_failed_check_invokes_reconnect_hook() {
        let hook = Arc::new(RecordingHook::default());
        let monitor = HealthMonitor::new(config(1000, true)).with_reconnect_hook(hook.clone());

        let status = monitor.check_once(&FakeSession::new(true, false)).await;
        assert!(!status.alive);
        assert_eq!(status.reason, "refused");
        assert!(hook.0.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_reconnect_hook_needs_auto_reconnect() {
        let hook = Arc::new(RecordingHook::default());
        let monitor = HealthMonitor::new(config(1000, false)).with_reconnect_hook(hook.clone());

        monitor.check_once(&FakeSession::new(true, false)).await;
        assert!(!hook.0.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_server_list_failure_is_reported() {
        let monitor = HealthMonitor::new(config(1000, false));
        let status = monitor.check_once(&FailingListSession).await;
        assert!(!status.alive);
        assert!(status.reason.contains("HTTP 503"));
    }

    #[tokio::test]
    async fn test_start_ticks_until_stopped() {
        let monitor = HealthMonitor::new(config(20, false));
        let session = Arc::new(FakeSession::new(true, true));

        assert!(monitor.start(session.clone()));
        assert!(!monitor.start(session.clone()));
        assert!(monitor.is_monitoring());

        tokio::time::sleep(Duration::from_millis(110)).await;
        assert!(monitor.stop());
        assert!(!monitor.stop());
        assert!(!monitor.is_monitoring());

        tokio::time::sleep(Duration::from_millis(30)).await;
        let ticks = session.reports.lock().len();
        assert!(ticks >= 2, "expected several ticks, got {}", ticks);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(session.reports.lock().len(), ticks);
    }

    #[tokio::test]
    async fn test_stop_lets_in_flight_tick_finish_without_rearming() {
        let monitor = HealthMonitor::new(config(20, false));
        let mut session = FakeSession::new(true, true);
        session.probe_delay = Duration::from_millis(100);
        let session = Arc::new(session);

        monitor.start(session.clone());
        // First tick fires at 20ms and is still probing at 50ms.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.probes_started.load(Ordering::SeqCst), 1);
        monitor.stop();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(session.probes_started.load(Ordering::SeqCst), 1);
        assert_eq!(session.probes_finished.load(Ordering::SeqCst), 1);
        assert_eq!(session.reports.lock().len(), 1);
    }
}
