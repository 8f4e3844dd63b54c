//! Client notifications
//!
//! Events go out on a broadcast channel. Sending never fails the operation
//! that produced the event: with no subscribers the event is dropped, and a
//! subscriber that falls behind sees `Lagged` on its own receiver. Once the
//! bus is closed every receiver drains what is buffered and then sees
//! `Closed`.

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::models::{BulkProbeReport, HealthStatus, MonitoringSummary, ProbeResult};

/// Default number of buffered events per subscriber
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    SessionCreated {
        username: String,
    },
    CredentialsRefreshed,
    ProxyConnected {
        hostname: String,
        port: u16,
        latency_ms: u64,
    },
    ProxyFailed {
        hostname: String,
        port: u16,
        error: Option<String>,
    },
    HealthCheck(HealthStatus),
    MonitoringStarted {
        hostname: String,
        port: u16,
        duration_ms: u64,
    },
    MonitoringResult(ProbeResult),
    MonitoringCompleted(MonitoringSummary),
    BulkTestCompleted(BulkProbeReport),
    CacheCleared,
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::SessionCreated { .. } => "session_created",
            ClientEvent::CredentialsRefreshed => "credentials_refreshed",
            ClientEvent::ProxyConnected { .. } => "proxy_connected",
            ClientEvent::ProxyFailed { .. } => "proxy_failed",
            ClientEvent::HealthCheck(_) => "health_check",
            ClientEvent::MonitoringStarted { .. } => "monitoring_started",
            ClientEvent::MonitoringResult(_) => "monitoring_result",
            ClientEvent::MonitoringCompleted(_) => "monitoring_completed",
            ClientEvent::BulkTestCompleted(_) => "bulk_test_completed",
            ClientEvent::CacheCleared => "cache_cleared",
        }
    }

    /// Connected/failed event for a finished probe
    pub fn from_probe(result: &ProbeResult) -> Self {
        if result.success {
            ClientEvent::ProxyConnected {
                hostname: result.hostname.clone(),
                port: result.port,
                latency_ms: result.latency_ms,
            }
        } else {
            ClientEvent::ProxyFailed {
                hostname: result.hostname.clone(),
                port: result.port,
                error: result.error.clone(),
            }
        }
    }
}

#[derive(Debug)]
pub struct EventBus {
    tx: RwLock<Option<broadcast::Sender<ClientEvent>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx: RwLock::new(Some(tx)),
        }
    }

    /// Subscribe to future events. After [`close`](Self::close) the
    /// receiver is already closed.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        match self.tx.read().as_ref() {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    pub fn emit(&self, event: ClientEvent) {
        let name = event.name();
        let guard = self.tx.read();
        let Some(tx) = guard.as_ref() else {
            trace!("Dropped {}: bus closed", name);
            return;
        };
        match tx.send(event) {
            Ok(receivers) => trace!("Emitted {} to {} subscriber(s)", name, receivers),
            Err(_) => trace!("Dropped {}: no subscribers", name),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.read().as_ref().map_or(0, |tx| tx.receiver_count())
    }

    /// Drop the sender, detaching every subscriber. Returns `false` if the
    /// bus was already closed.
    pub fn close(&self) -> bool {
        let closed = self.tx.write().take().is_some();
        if closed {
            trace!("Event bus closed");
        }
        closed
    }

    pub fn is_closed(&self) -> bool {
        self.tx.read().is_none()
    }
}
