use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Response body captured by a probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProbeBody {
    Json(Value),
    Text(String),
}

impl ProbeBody {
    /// Parse as JSON when possible, keep the raw text otherwise
    pub fn parse(body: &[u8]) -> Self {
        match serde_json::from_slice::<Value>(body) {
            Ok(value) => ProbeBody::Json(value),
            Err(_) => ProbeBody::Text(String::from_utf8_lossy(body).into_owned()),
        }
    }

    pub fn is_json(&self) -> bool {
        matches!(self, ProbeBody::Json(_))
    }

    /// Public IP reported by an echo service (`ip` for ipinfo, `origin` for httpbin)
    pub fn reported_ip(&self) -> Option<String> {
        let ProbeBody::Json(value) = self else {
            return None;
        };
        value
            .get("ip")
            .or_else(|| value.get("origin"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

/// Outcome of one probe through one proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub success: bool,
    pub hostname: String,
    pub port: u16,
    pub latency_ms: u64,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ProbeBody>,
    #[serde(default)]
    pub response_size: usize,
}

impl ProbeResult {
    /// A failed probe carrying only the error message
    pub fn failure(
        hostname: impl Into<String>,
        port: u16,
        protocol: impl Into<String>,
        latency_ms: u64,
        error: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            hostname: hostname.into(),
            port,
            latency_ms,
            protocol: protocol.into(),
            target_url: None,
            status_code: None,
            ip: None,
            error: Some(error.into()),
            response: None,
            response_size: 0,
        }
    }
}

/// Aggregate over a bulk probe run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkProbeReport {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    /// Results in input order
    pub results: Vec<ProbeResult>,
    /// Percentage of successful probes, rounded to two decimals
    pub success_rate: f64,
    /// Mean latency of successful probes only, 0 when none succeeded
    pub average_latency_ms: u64,
}

impl BulkProbeReport {
    pub fn from_results(results: Vec<ProbeResult>) -> Self {
        let total = results.len();
        let successful_latencies: Vec<u64> = results
            .iter()
            .filter(|r| r.success)
            .map(|r| r.latency_ms)
            .collect();
        let successful = successful_latencies.len();

        let success_rate = if total == 0 {
            0.0
        } else {
            round2(successful as f64 / total as f64 * 100.0)
        };

        let average_latency_ms = if successful == 0 {
            0
        } else {
            (successful_latencies.iter().sum::<u64>() as f64 / successful as f64).round() as u64
        };

        Self {
            total,
            successful,
            failed: total - successful,
            results,
            success_rate,
            average_latency_ms,
        }
    }

    /// Success rate formatted like `66.67%`
    pub fn success_rate_label(&self) -> String {
        format!("{:.2}%", self.success_rate)
    }
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
