use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{BulkProbeReport, ProbeResult};

/// Reason reported when a tick finds no logged-in session
pub const NO_ACTIVE_SESSION: &str = "No active session";

/// Result of one health monitor tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub alive: bool,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tested_server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    pub checked_at: DateTime<Utc>,
}

impl HealthStatus {
    pub fn no_active_session() -> Self {
        Self::dead(NO_ACTIVE_SESSION, None)
    }

    pub fn dead(reason: impl Into<String>, tested_server: Option<String>) -> Self {
        Self {
            alive: false,
            reason: reason.into(),
            tested_server,
            latency_ms: None,
            checked_at: Utc::now(),
        }
    }

    pub fn from_probe(probe: &ProbeResult) -> Self {
        let reason = if probe.success {
            "Proxy reachable".to_string()
        } else {
            probe
                .error
                .clone()
                .unwrap_or_else(|| "Proxy unreachable".to_string())
        };

        Self {
            alive: probe.success,
            reason,
            tested_server: Some(probe.hostname.clone()),
            latency_ms: Some(probe.latency_ms),
            checked_at: Utc::now(),
        }
    }
}

/// Outcome of a fixed-duration monitoring run against one server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringSummary {
    pub hostname: String,
    pub port: u16,
    pub checks: usize,
    pub successful: usize,
    pub failed: usize,
    /// Share of successful checks, rounded to two decimals
    pub uptime_percent: f64,
    pub average_latency_ms: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl MonitoringSummary {
    pub fn from_results(
        hostname: &str,
        port: u16,
        results: &[ProbeResult],
        started_at: DateTime<Utc>,
    ) -> Self {
        let report = BulkProbeReport::from_results(results.to_vec());
        Self {
            hostname: hostname.to_string(),
            port,
            checks: report.total,
            successful: report.successful,
            failed: report.failed,
            uptime_percent: report.success_rate,
            average_latency_ms: report.average_latency_ms,
            started_at,
            ended_at: Utc::now(),
        }
    }
}

/// Repeated latency measurement of one server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyReport {
    pub hostname: String,
    pub rounds: usize,
    pub successful: usize,
    /// Mean over successful rounds, `None` when every round failed
    pub average_latency_ms: Option<u64>,
    pub min_latency_ms: Option<u64>,
    pub max_latency_ms: Option<u64>,
    pub results: Vec<ProbeResult>,
}

impl LatencyReport {
    pub fn from_results(hostname: &str, results: Vec<ProbeResult>) -> Self {
        let latencies: Vec<u64> = results
            .iter()
            .filter(|r| r.success)
            .map(|r| r.latency_ms)
            .collect();
        let average_latency_ms = (!latencies.is_empty()).then(|| {
            (latencies.iter().sum::<u64>() as f64 / latencies.len() as f64).round() as u64
        });

        Self {
            hostname: hostname.to_string(),
            rounds: results.len(),
            successful: latencies.len(),
            average_latency_ms,
            min_latency_ms: latencies.iter().copied().min(),
            max_latency_ms: latencies.iter().copied().max(),
            results,
        }
    }
}

/// Aggregated connection statistics for a client
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub total_tests: u64,
    pub successful_tests: u64,
    /// Percentage, rounded to two decimals
    pub success_rate: f64,
    /// Server with the lowest average latency
    pub best_server: Option<String>,
    pub average_latency_ms: u64,
    pub connected_servers: Vec<String>,
    pub failed_servers: Vec<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}
