//! Round-robin distribution of requests across proxy servers

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::config::{DEFAULT_FAKE_SNI, DEFAULT_USER_AGENT};
use crate::error::{Result, VeilError};
use crate::models::{Credentials, ProbeBody, ProxyTarget};
use crate::proxy::exchange::HttpResponse;
use crate::proxy::tunnel::{send_request, TunnelRequest};

/// A logical request to be sent through whichever server is chosen
#[derive(Debug, Clone)]
pub struct BalancedRequest {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
}

impl BalancedRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            headers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoadBalanceConfig {
    /// Retry a failed request on the following servers
    pub retry_failed_requests: bool,
}

/// Result of one logical request, however many attempts it took
#[derive(Debug, Clone, Serialize)]
pub struct BalanceOutcome {
    pub request_index: usize,
    /// Server that produced the final attempt
    pub server: String,
    pub success: bool,
    pub attempts: usize,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<ProbeBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Sends one request through one server
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    async fn execute(&self, server: &ProxyTarget, request: &BalancedRequest) -> Result<HttpResponse>;
}

/// Executes requests over a fresh fake-SNI tunnel each time
#[derive(Debug, Clone)]
pub struct TunnelExecutor {
    pub credentials: Option<Credentials>,
    pub fake_sni: String,
    pub user_agent: String,
    pub timeout: Duration,
}

impl Default for TunnelExecutor {
    fn default() -> Self {
        Self {
            credentials: None,
            fake_sni: DEFAULT_FAKE_SNI.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl RequestExecutor for TunnelExecutor {
    async fn execute(&self, server: &ProxyTarget, request: &BalancedRequest) -> Result<HttpResponse> {
        let mut tunnel_request =
            TunnelRequest::new(&server.hostname, server.port_or_default(), &request.url)?
                .with_credentials(server.credentials.clone().or_else(|| self.credentials.clone()))
                .with_fake_sni(&self.fake_sni)
                .with_timeout(self.timeout)
                .header("User-Agent", &self.user_agent);
        tunnel_request.method = request.method.clone();
        tunnel_request.headers.extend(request.headers.iter().cloned());

        send_request(&tunnel_request).await
    }
}

/// Spreads requests over a server set with a shared round-robin cursor
pub struct LoadBalancer<E> {
    executor: E,
    cursor: AtomicUsize,
}

impl<E: RequestExecutor> LoadBalancer<E> {
    pub fn new(executor: E) -> Self {
        Self {
            executor,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Index of the next server; every attempt advances the cursor
    fn next_index(&self, len: usize) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed) % len
    }

    /// Send every request in order, one outcome per request.
    ///
    /// With retries enabled a request is attempted on at most `servers.len()`
    /// consecutive servers.
    #[instrument(skip_all, fields(servers = servers.len(), requests = requests.len()))]
    pub async fn distribute(
        &self,
        servers: &[ProxyTarget],
        requests: &[BalancedRequest],
        config: LoadBalanceConfig,
    ) -> Result<Vec<BalanceOutcome>> {
        if servers.is_empty() {
            return Err(VeilError::NoServersConfigured);
        }

        let max_attempts = if config.retry_failed_requests {
            servers.len()
        } else {
            1
        };

        let mut outcomes = Vec::with_capacity(requests.len());
        for (request_index, request) in requests.iter().enumerate() {
            outcomes.push(
                self.send_one(servers, request_index, request, max_attempts)
                    .await,
            );
        }
        Ok(outcomes)
    }

    async fn send_one(
        &self,
        servers: &[ProxyTarget],
        request_index: usize,
        request: &BalancedRequest,
        max_attempts: usize,
    ) -> BalanceOutcome {
        let mut attempts = 0;
        loop {
            let server = &servers[self.next_index(servers.len())];
            attempts += 1;

            let started = Instant::now();
            let result = self.executor.execute(server, request).await;
            let latency_ms = started.elapsed().as_millis() as u64;

            let (error, status_code, retryable) = match result {
                Ok(response) if response.is_success() => {
                    debug!(
                        "Request {} served by {} in {}ms",
                        request_index, server.hostname, latency_ms
                    );
                    return BalanceOutcome {
                        request_index,
                        server: server.hostname.clone(),
                        success: true,
                        attempts,
                        latency_ms,
                        status_code: Some(response.status_code),
                        response: Some(ProbeBody::parse(&response.body)),
                        error: None,
                    };
                }
                Ok(response) => (
                    format!("HTTP {}", response.status_code),
                    Some(response.status_code),
                    true,
                ),
                Err(e) => (e.to_string(), None, e.is_retryable()),
            };

            if attempts < max_attempts && retryable {
                debug!(
                    "Request {} failed on {}: {}, trying next server",
                    request_index, server.hostname, error
                );
                continue;
            }

            warn!(
                "Request {} failed after {} attempt(s): {}",
                request_index, attempts, error
            );
            return BalanceOutcome {
                request_index,
                server: server.hostname.clone(),
                success: false,
                attempts,
                latency_ms,
                status_code,
                response: None,
                error: Some(error),
            };
        }
    }
}
