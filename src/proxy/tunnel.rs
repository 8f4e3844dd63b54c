//! Composed pipeline: proxy dial, inner TLS, one HTTP exchange

use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, instrument};
use url::Url;

use crate::config::DEFAULT_FAKE_SNI;
use crate::error::{Result, VeilError};
use crate::models::{Credentials, ProxyScheme};
use crate::proxy::dialer::{ProxyDialer, ProxyEndpoint};
use crate::proxy::exchange::{exchange, HttpRequest, HttpResponse};
use crate::proxy::tls::FakeSniDialer;
use crate::proxy::transport::Tunnel;

/// Everything needed to reach one target URL through one proxy
#[derive(Debug, Clone)]
pub struct TunnelRequest {
    pub proxy_host: String,
    pub proxy_port: u16,
    pub proxy_scheme: ProxyScheme,
    pub credentials: Option<Credentials>,
    /// SNI shown to observers on the proxy leg
    pub fake_sni: String,
    pub target_host: String,
    pub target_port: u16,
    /// Wrap the tunnel in TLS toward the target
    pub target_tls: bool,
    pub timeout: Duration,
    pub method: String,
    /// Path plus query string
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl TunnelRequest {
    /// GET `target_url` through `proxy_host:proxy_port`.
    ///
    /// The proxy scheme follows the port: 80 is plain HTTP, anything else TLS.
    pub fn new(proxy_host: impl Into<String>, proxy_port: u16, target_url: &str) -> Result<Self> {
        let url = Url::parse(target_url).map_err(|e| {
            VeilError::InvalidConfig(format!("Invalid target URL {:?}: {}", target_url, e))
        })?;
        let target_tls = match url.scheme() {
            "https" => true,
            "http" => false,
            other => {
                return Err(VeilError::InvalidConfig(format!(
                    "Unsupported target URL scheme: {}",
                    other
                )))
            }
        };
        let target_host = url
            .host_str()
            .ok_or_else(|| VeilError::InvalidConfig(format!("Missing host in {}", target_url)))?
            .to_string();
        let target_port = url
            .port_or_known_default()
            .unwrap_or(if target_tls { 443 } else { 80 });

        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(Self {
            proxy_host: proxy_host.into(),
            proxy_port,
            proxy_scheme: ProxyScheme::for_port(proxy_port),
            credentials: None,
            fake_sni: DEFAULT_FAKE_SNI.to_string(),
            target_host,
            target_port,
            target_tls,
            timeout: Duration::from_secs(10),
            method: "GET".to_string(),
            path,
            headers: Vec::new(),
            body: None,
        })
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials.filter(|c| !c.is_empty());
        self
    }

    pub fn with_fake_sni(mut self, sni: impl Into<String>) -> Self {
        self.fake_sni = sni.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    fn endpoint(&self) -> ProxyEndpoint {
        let mut endpoint = ProxyEndpoint::new(&self.proxy_host, self.proxy_port, self.proxy_scheme);
        if let Some(credentials) = &self.credentials {
            endpoint = endpoint.with_credentials(credentials);
        }
        if !self.fake_sni.is_empty() {
            endpoint = endpoint.with_spoofed_sni(&self.fake_sni);
        }
        endpoint
    }

    fn http_request(&self) -> HttpRequest {
        HttpRequest {
            method: self.method.clone(),
            path: self.path.clone(),
            host: self.target_host.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }
}

/// Open a tunnel to the request's target, TLS-wrapped when the target is https
#[instrument(skip(request), fields(proxy = %request.proxy_host, target = %request.target_host))]
pub async fn connect_proxy(request: &TunnelRequest) -> Result<Tunnel> {
    let dialer = ProxyDialer::new(request.endpoint())?;

    if request.target_tls {
        FakeSniDialer::new()?
            .dial_tls(
                &request.target_host,
                request.target_port,
                request.timeout,
                Some(&dialer),
            )
            .await
    } else {
        dialer
            .dial(&request.target_host, request.target_port, request.timeout)
            .await
    }
}

/// Dial and perform one HTTP exchange
pub async fn send_request(request: &TunnelRequest) -> Result<HttpResponse> {
    let tunnel = connect_proxy(request).await?;
    let response = exchange(tunnel, &request.http_request(), request.timeout).await?;
    debug!(
        "{} {} via {} -> {}",
        request.method, request.path, request.proxy_host, response.status_code
    );
    Ok(response)
}
