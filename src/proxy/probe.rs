//! Single and bulk reachability probes
//!
//! A probe never returns an error: every failure becomes a [`ProbeResult`]
//! with `success == false`.

use std::future::Future;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tracing::{debug, info, instrument};

use crate::config::{ProbeConfig, DEFAULT_FAKE_SNI, DEFAULT_TARGET_URL, DEFAULT_USER_AGENT};
use crate::models::{BulkProbeReport, Credentials, ProbeBody, ProbeResult, ProxyScheme, ProxyTarget};
use crate::proxy::tunnel::{send_request, TunnelRequest};

/// Echo service used by [`Prober::probe_ip`]
const IP_ECHO_URL: &str = "https://ipinfo.io/json";

/// SNI presented by [`Prober::probe_ip`]
const IP_PROBE_SNI: &str = "com";

/// One probe against one proxy
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub hostname: String,
    pub port: u16,
    pub target_url: String,
    /// Overrides the prober's fake SNI and is reported in the protocol label
    pub custom_sni: Option<String>,
    pub timeout: Duration,
    /// Falls back to the prober's credentials when unset
    pub credentials: Option<Credentials>,
    pub method: String,
    pub headers: Vec<(String, String)>,
}

impl ProbeOptions {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            target_url: DEFAULT_TARGET_URL.to_string(),
            custom_sni: None,
            timeout: Duration::from_secs(10),
            credentials: None,
            method: "GET".to_string(),
            headers: Vec::new(),
        }
    }

    pub fn target_url(mut self, url: impl Into<String>) -> Self {
        self.target_url = url.into();
        self
    }

    pub fn custom_sni(mut self, sni: Option<String>) -> Self {
        self.custom_sni = sni.filter(|s| !s.is_empty());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    /// `HTTPS`, `HTTP`, or either followed by ` with SNI: <sni>`
    pub fn protocol_label(&self) -> String {
        let scheme = ProxyScheme::for_port(self.port).as_str().to_uppercase();
        match &self.custom_sni {
            Some(sni) => format!("{} with SNI: {}", scheme, sni),
            None => scheme,
        }
    }
}

/// Settings shared by every probe of a bulk run
#[derive(Debug, Clone)]
pub struct BulkProbeConfig {
    /// Probes per batch
    pub concurrency: usize,
    pub timeout: Duration,
    pub target_url: String,
    pub custom_sni: Option<String>,
}

impl Default for BulkProbeConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            timeout: Duration::from_secs(10),
            target_url: DEFAULT_TARGET_URL.to_string(),
            custom_sni: None,
        }
    }
}

impl From<&ProbeConfig> for BulkProbeConfig {
    fn from(config: &ProbeConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            timeout: config.timeout,
            target_url: config.target_url.clone(),
            custom_sni: None,
        }
    }
}

/// Runs probes with a fixed user agent, fallback credentials and decoy SNI
#[derive(Debug, Clone)]
pub struct Prober {
    user_agent: String,
    fake_sni: String,
    credentials: Option<Credentials>,
}

impl Default for Prober {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            fake_sni: DEFAULT_FAKE_SNI.to_string(),
            credentials: None,
        }
    }
}

impl Prober {
    pub fn new(config: &ProbeConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            fake_sni: config.fake_sni.clone(),
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials.filter(|c| !c.is_empty());
        self
    }

    /// Fetch `options.target_url` through the proxy; any 2xx counts as success
    #[instrument(skip(self, options), fields(hostname = %options.hostname, port = options.port))]
    pub async fn probe(&self, options: &ProbeOptions) -> ProbeResult {
        let started = Instant::now();
        let protocol = options.protocol_label();

        let request = match self.tunnel_request(options) {
            Ok(request) => request,
            Err(e) => {
                return ProbeResult::failure(&options.hostname, options.port, protocol, 0, e.to_string())
            }
        };

        let response = match send_request(&request).await {
            Ok(response) => response,
            Err(e) => {
                debug!("Probe of {} failed: {}", options.hostname, e);
                let mut result = ProbeResult::failure(
                    &options.hostname,
                    options.port,
                    protocol,
                    elapsed_ms(started),
                    e.to_string(),
                );
                result.target_url = Some(options.target_url.clone());
                return result;
            }
        };
        let latency_ms = elapsed_ms(started);

        let body = ProbeBody::parse(&response.body);
        let success = response.is_success();
        ProbeResult {
            success,
            hostname: options.hostname.clone(),
            port: options.port,
            latency_ms,
            protocol,
            target_url: Some(options.target_url.clone()),
            status_code: Some(response.status_code),
            ip: body.reported_ip(),
            error: (!success).then(|| format!("HTTP {}", response.status_code)),
            response: Some(body),
            response_size: response.body.len(),
        }
    }

    /// Fetch the IP echo service through the proxy, presenting a bare TLD as SNI.
    ///
    /// Success requires status 200 and an `ip` field in the JSON body.
    #[instrument(skip(self))]
    pub async fn probe_ip(&self, hostname: &str, port: u16, timeout: Duration) -> ProbeResult {
        let started = Instant::now();
        let protocol = format!(
            "{} with custom SNI",
            ProxyScheme::for_port(port).as_str().to_uppercase()
        );

        let request = TunnelRequest::new(hostname, port, IP_ECHO_URL).map(|request| {
            request
                .with_credentials(self.credentials.clone())
                .with_fake_sni(IP_PROBE_SNI)
                .with_timeout(timeout)
                .header("User-Agent", &self.user_agent)
        });

        let response = match request {
            Ok(request) => send_request(&request).await,
            Err(e) => Err(e),
        };
        let latency_ms = elapsed_ms(started);

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                return ProbeResult::failure(
                    hostname,
                    port,
                    protocol,
                    latency_ms,
                    format!("Proxy error: {}", e),
                )
            }
        };

        let body_text = response.body_text();
        let value: serde_json::Value = match serde_json::from_slice(&response.body) {
            Ok(value) => value,
            Err(e) => {
                return ProbeResult::failure(
                    hostname,
                    port,
                    protocol,
                    latency_ms,
                    format!("Failed to parse response: {}", e),
                )
            }
        };

        let ip = value.get("ip").and_then(|ip| ip.as_str()).map(str::to_string);
        let body = ProbeBody::Json(value);

        match ip {
            Some(ip) if response.status_code == 200 => ProbeResult {
                success: true,
                hostname: hostname.to_string(),
                port,
                latency_ms,
                protocol,
                target_url: Some(IP_ECHO_URL.to_string()),
                status_code: Some(response.status_code),
                ip: Some(ip),
                error: None,
                response: Some(body),
                response_size: response.body.len(),
            },
            _ => {
                let mut result = ProbeResult::failure(
                    hostname,
                    port,
                    protocol,
                    latency_ms,
                    format!("Invalid response: {}", body_text),
                );
                result.status_code = Some(response.status_code);
                result
            }
        }
    }

    /// Probe every target in batches of `config.concurrency`.
    ///
    /// Results keep input order.
    #[instrument(skip(self, targets, config), fields(total = targets.len(), concurrency = config.concurrency))]
    pub async fn bulk(&self, targets: &[ProxyTarget], config: &BulkProbeConfig) -> BulkProbeReport {
        self.bulk_with(targets, config, |_| {}).await
    }

    /// Like [`Prober::bulk`], calling `on_result` as each target finishes
    /// rather than after the whole run.
    pub async fn bulk_with<C>(
        &self,
        targets: &[ProxyTarget],
        config: &BulkProbeConfig,
        on_result: C,
    ) -> BulkProbeReport
    where
        C: Fn(&ProbeResult),
    {
        let on_result = &on_result;
        let options: Vec<ProbeOptions> = targets
            .iter()
            .map(|target| {
                ProbeOptions::new(&target.hostname, target.port_or_default())
                    .target_url(&config.target_url)
                    .custom_sni(config.custom_sni.clone())
                    .timeout(config.timeout)
                    .credentials(target.credentials.clone())
            })
            .collect();

        let results = run_batched(options, config.concurrency, |options| async move {
            let result = self.probe(&options).await;
            on_result(&result);
            result
        })
        .await;

        let report = BulkProbeReport::from_results(results);
        info!(
            "Bulk probe finished: {}/{} reachable ({}), average latency {}ms",
            report.successful,
            report.total,
            report.success_rate_label(),
            report.average_latency_ms
        );
        report
    }

    fn tunnel_request(&self, options: &ProbeOptions) -> crate::error::Result<TunnelRequest> {
        let mut request = TunnelRequest::new(&options.hostname, options.port, &options.target_url)?
            .with_credentials(options.credentials.clone().or_else(|| self.credentials.clone()))
            .with_fake_sni(options.custom_sni.as_deref().unwrap_or(&self.fake_sni))
            .with_timeout(options.timeout)
            .header("User-Agent", &self.user_agent);

        request.method = options.method.clone();
        for (name, value) in &options.headers {
            request.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
            request.headers.push((name.clone(), value.clone()));
        }
        Ok(request)
    }
}

/// Run `task` over `items` in consecutive batches of `concurrency`.
///
/// A batch starts only after every task of the previous one has finished,
/// and outputs are returned in input order.
pub async fn run_batched<T, R, F, Fut>(items: Vec<T>, concurrency: usize, task: F) -> Vec<R>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = R>,
{
    let concurrency = concurrency.max(1);
    let mut results = Vec::with_capacity(items.len());
    let mut items = items.into_iter().peekable();

    while items.peek().is_some() {
        let batch: Vec<Fut> = items.by_ref().take(concurrency).map(&task).collect();
        results.extend(join_all(batch).await);
    }

    results
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::tls::test_support::{
        closed_port, spawn_connect_proxy, spawn_connect_proxy_with_delay,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_protocol_label() {
        assert_eq!(ProbeOptions::new("a", 443).protocol_label(), "HTTPS");
        assert_eq!(ProbeOptions::new("a", 80).protocol_label(), "HTTP");
        assert_eq!(
            ProbeOptions::new("a", 443)
                .custom_sni(Some("cdn.example".into()))
                .protocol_label(),
            "HTTPS with SNI: cdn.example"
        );
        assert_eq!(
            ProbeOptions::new("a", 443).custom_sni(Some(String::new())).protocol_label(),
            "HTTPS"
        );
    }

    #[tokio::test]
    async fn test_run_batched_caps_in_flight_tasks() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let out = run_batched((0..7).collect(), 3, |i: usize| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                // Later items finish first to check ordering.
                tokio::time::sleep(Duration::from_millis(30 - i as u64 * 3)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                i * 10
            }
        })
        .await;

        assert_eq!(out, vec![0, 10, 20, 30, 40, 50, 60]);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_batched_waits_for_whole_batch() {
        let finished = Arc::new(AtomicUsize::new(0));

        let seen = run_batched(vec![50u64, 5, 5], 2, |delay| {
            let finished = finished.clone();
            async move {
                let before = finished.load(Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                before
            }
        })
        .await;

        // The third task starts only after both tasks of the first batch ended.
        assert_eq!(seen, vec![0, 0, 2]);
    }

    #[tokio::test]
    async fn test_run_batched_zero_concurrency_is_clamped() {
        let out = run_batched(vec![1, 2], 0, |x: i32| async move { x }).await;
        assert_eq!(out, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_probe_success_parses_json() {
        let port = spawn_connect_proxy(
            b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\r\n{\"origin\":\"198.51.100.4\"}",
        )
        .await;

        let options = ProbeOptions::new("127.0.0.1", port)
            .target_url("http://httpbin.org/ip")
            .timeout(Duration::from_secs(5));
        let result = Prober::default().probe(&options).await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.status_code, Some(200));
        assert_eq!(result.ip.as_deref(), Some("198.51.100.4"));
        assert_eq!(result.protocol, "HTTPS");
        assert!(result.response.as_ref().unwrap().is_json());
        assert_eq!(result.response_size, 25);
    }

    #[tokio::test]
    async fn test_probe_non_2xx_is_failure_with_text_body() {
        let port = spawn_connect_proxy(b"HTTP/1.1 503 Service Unavailable\r\n\r\nbusy").await;

        let options = ProbeOptions::new("127.0.0.1", port)
            .target_url("http://httpbin.org/ip")
            .custom_sni(Some("cdn.example".into()))
            .timeout(Duration::from_secs(5));
        let result = Prober::default().probe(&options).await;

        assert!(!result.success);
        assert_eq!(result.status_code, Some(503));
        assert_eq!(result.error.as_deref(), Some("HTTP 503"));
        assert_eq!(result.protocol, "HTTPS with SNI: cdn.example");
        assert_eq!(result.response, Some(ProbeBody::Text("busy".into())));
    }

    #[tokio::test]
    async fn test_probe_unreachable_is_failure() {
        let port = closed_port().await;
        let options = ProbeOptions::new("127.0.0.1", port).timeout(Duration::from_secs(2));
        let result = Prober::default().probe(&options).await;

        assert!(!result.success);
        assert!(result.status_code.is_none());
        assert!(result.error.unwrap().contains("unreachable"));
    }

    #[tokio::test]
    async fn test_probe_invalid_url_is_failure() {
        let options = ProbeOptions::new("127.0.0.1", 443).target_url("not a url");
        let result = Prober::default().probe(&options).await;
        assert!(!result.success);
        assert_eq!(result.latency_ms, 0);
    }

    #[tokio::test]
    async fn test_probe_ip_unreachable_is_prefixed() {
        let port = closed_port().await;
        let result = Prober::default()
            .probe_ip("127.0.0.1", port, Duration::from_secs(2))
            .await;

        assert!(!result.success);
        assert_eq!(result.protocol, "HTTPS with custom SNI");
        assert!(result.error.unwrap().starts_with("Proxy error: "));
    }

    #[tokio::test]
    async fn test_bulk_keeps_input_order_and_aggregates() {
        let up = spawn_connect_proxy(b"HTTP/1.1 200 OK\r\n\r\n{\"ip\":\"203.0.113.5\"}").await;
        let down = closed_port().await;

        let targets = vec![
            ProxyTarget::new("127.0.0.1").with_port(up),
            ProxyTarget::new("127.0.0.1").with_port(down),
            ProxyTarget::new("127.0.0.1").with_port(up),
        ];
        let config = BulkProbeConfig {
            concurrency: 2,
            timeout: Duration::from_secs(5),
            target_url: "http://ipinfo.io/json".to_string(),
            custom_sni: None,
        };

        let report = Prober::default().bulk(&targets, &config).await;

        assert_eq!(report.total, 3);
        assert_eq!(report.successful, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.success_rate_label(), "66.67%");
        let ports: Vec<u16> = report.results.iter().map(|r| r.port).collect();
        assert_eq!(ports, vec![up, down, up]);
        assert!(!report.results[1].success);
    }

    #[tokio::test]
    async fn test_bulk_with_reports_in_completion_order() {
        let slow = spawn_connect_proxy_with_delay(
            b"HTTP/1.1 200 OK\r\n\r\n{}",
            Duration::from_millis(400),
        )
        .await;
        let down = closed_port().await;

        let targets = vec![
            ProxyTarget::new("127.0.0.1").with_port(slow),
            ProxyTarget::new("127.0.0.1").with_port(down),
        ];
        let config = BulkProbeConfig {
            concurrency: 2,
            timeout: Duration::from_secs(5),
            target_url: "http://ipinfo.io/json".to_string(),
            custom_sni: None,
        };

        let seen = parking_lot::Mutex::new(Vec::new());
        let report = Prober::default()
            .bulk_with(&targets, &config, |result| seen.lock().push(result.port))
            .await;

        assert_eq!(seen.into_inner(), vec![down, slow]);
        let ports: Vec<u16> = report.results.iter().map(|r| r.port).collect();
        assert_eq!(ports, vec![slow, down]);
    }
}
