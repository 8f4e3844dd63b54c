//! HTTP CONNECT dialing through a forward proxy
//!
//! The proxy leg may itself be TLS. Each step (TCP connect, optional TLS,
//! CONNECT exchange) fails with its own error and drops the socket before
//! returning.

use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, instrument, warn};
use url::Url;

use crate::error::{Result, VeilError};
use crate::models::{basic_auth_header, Credentials, ProxyScheme};
use crate::proxy::resolver::resolve_hostname;
use crate::proxy::tls::{handshake, proxy_client_config};
use crate::proxy::transport::{format_authority, into_tunnel, Tunnel};

/// Fixed bound on waiting for the proxy's CONNECT response
pub const CONNECT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on a CONNECT response header block
const MAX_CONNECT_RESPONSE: usize = 16 * 1024;

/// Produces the `Proxy-Authorization` header value on demand
pub type AuthProvider = Arc<dyn Fn() -> String + Send + Sync>;

/// Where and how to reach a forward proxy
#[derive(Clone)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
    pub scheme: ProxyScheme,
    /// Server name verified on the proxy leg (empty for plain HTTP)
    pub tls_server_name: String,
    pub auth: Option<AuthProvider>,
    pub trusted_cas: Option<RootCertStore>,
    /// Overrides the SNI presented on the proxy leg
    pub spoofed_sni: Option<String>,
}

impl ProxyEndpoint {
    pub fn new(host: impl Into<String>, port: u16, scheme: ProxyScheme) -> Self {
        let host = host.into();
        let tls_server_name = if scheme.is_secure() {
            host.clone()
        } else {
            String::new()
        };

        Self {
            host,
            port,
            scheme,
            tls_server_name,
            auth: None,
            trusted_cas: None,
            spoofed_sni: None,
        }
    }

    /// Parse `http://[user:pass@]host[:port]` or `https://...`.
    ///
    /// Credentials embedded in the URL take precedence over `auth`.
    pub fn from_url(raw: &str, auth: Option<AuthProvider>) -> Result<Self> {
        let url = Url::parse(raw)?;

        let scheme = ProxyScheme::from_str(url.scheme())
            .ok_or_else(|| VeilError::InvalidProxyScheme(url.scheme().to_string()))?;

        let host = url
            .host_str()
            .ok_or_else(|| VeilError::InvalidProxyAddress(format!("Missing host in {}", raw)))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        let port = url.port().unwrap_or_else(|| scheme.default_port());

        let mut endpoint = Self::new(host, port, scheme);
        endpoint.auth = match (url.username(), url.password()) {
            (user, Some(pass)) if !user.is_empty() && !pass.is_empty() => {
                Some(basic_auth_provider(&Credentials::new(user, pass)))
            }
            _ => auth,
        };

        Ok(endpoint)
    }

    pub fn with_credentials(mut self, credentials: &Credentials) -> Self {
        self.auth = Some(basic_auth_provider(credentials));
        self
    }

    pub fn with_spoofed_sni(mut self, sni: impl Into<String>) -> Self {
        self.spoofed_sni = Some(sni.into());
        self
    }

    pub fn with_trusted_cas(mut self, roots: RootCertStore) -> Self {
        self.trusted_cas = Some(roots);
        self
    }

    pub fn address(&self) -> String {
        format_authority(&self.host, self.port)
    }

    /// Name presented in the proxy-leg ClientHello
    pub fn proxy_leg_sni(&self) -> &str {
        match self.spoofed_sni.as_deref() {
            Some(sni) if !sni.is_empty() => sni,
            _ => &self.tls_server_name,
        }
    }
}

impl fmt::Debug for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyEndpoint")
            .field("address", &self.address())
            .field("scheme", &self.scheme)
            .field("tls_server_name", &self.tls_server_name)
            .field("auth", &self.auth.is_some())
            .field("trusted_cas", &self.trusted_cas.as_ref().map(|r| r.len()))
            .field("spoofed_sni", &self.spoofed_sni)
            .finish()
    }
}

/// Wrap static credentials as an [`AuthProvider`]
pub fn basic_auth_provider(credentials: &Credentials) -> AuthProvider {
    let header = basic_auth_header(&credentials.username, &credentials.password);
    Arc::new(move || header.clone())
}

/// Opens CONNECT tunnels through one proxy endpoint
#[derive(Clone)]
pub struct ProxyDialer {
    endpoint: ProxyEndpoint,
    tls_config: Option<Arc<ClientConfig>>,
}

impl ProxyDialer {
    pub fn new(endpoint: ProxyEndpoint) -> Result<Self> {
        let tls_config = if endpoint.scheme.is_secure() {
            Some(proxy_client_config(endpoint.trusted_cas.as_ref())?)
        } else {
            None
        };

        Ok(Self {
            endpoint,
            tls_config,
        })
    }

    pub fn from_url(raw: &str, auth: Option<AuthProvider>) -> Result<Self> {
        Self::new(ProxyEndpoint::from_url(raw, auth)?)
    }

    pub fn endpoint(&self) -> &ProxyEndpoint {
        &self.endpoint
    }

    /// Open a tunnel to `target_host:target_port` through the proxy.
    ///
    /// `connect_timeout` bounds only the TCP connect; the TLS handshake and
    /// the CONNECT response each have their own fixed five-second bound.
    #[instrument(skip(self), fields(proxy = %self.endpoint.address()))]
    pub async fn dial(
        &self,
        target_host: &str,
        target_port: u16,
        connect_timeout: Duration,
    ) -> Result<Tunnel> {
        let ip = resolve_hostname(&self.endpoint.host).await?;
        let socket_addr = (ip, self.endpoint.port);

        let stream = connect_bounded(
            self.endpoint.address(),
            connect_timeout,
            TcpStream::connect(socket_addr),
        )
        .await?;
        stream.set_nodelay(true).ok();

        let conn: Tunnel = match &self.tls_config {
            Some(config) => {
                let sni = self.endpoint.proxy_leg_sni();
                debug!("Starting TLS to proxy with SNI {}", sni);
                handshake(config.clone(), stream, sni).await?
            }
            None => Box::new(stream),
        };

        let auth_header = self.endpoint.auth.as_ref().map(|provider| provider());
        let tunnel = establish(conn, target_host, target_port, auth_header.as_deref()).await?;

        debug!(
            "CONNECT tunnel established to {}",
            format_authority(target_host, target_port)
        );
        Ok(tunnel)
    }
}

/// Await a TCP connect for at most `connect_timeout`.
///
/// Refusal and expiry both surface as `ProxyUnreachable`; expiry carries
/// `ErrorKind::TimedOut`.
pub(crate) async fn connect_bounded<F>(
    addr: String,
    connect_timeout: Duration,
    connect: F,
) -> Result<TcpStream>
where
    F: Future<Output = io::Result<TcpStream>>,
{
    match timeout(connect_timeout, connect).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(VeilError::ProxyUnreachable { addr, source: e }),
        Err(_) => {
            warn!("Connect to {} timed out after {:?}", addr, connect_timeout);
            Err(VeilError::ProxyUnreachable {
                addr,
                source: io::Error::new(io::ErrorKind::TimedOut, "Connection timed out"),
            })
        }
    }
}

/// Build the CONNECT request for `host:port`
pub fn build_connect_request(host: &str, port: u16, auth_header: Option<&str>) -> String {
    let authority = format_authority(host, port);
    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", authority, authority);

    if let Some(value) = auth_header {
        request.push_str(&format!("Proxy-Authorization: {}\r\n", value));
    }

    request.push_str("\r\n");
    request
}

/// Check a CONNECT status line for success
pub fn is_connect_success(status_line: &str) -> bool {
    let mut parts = status_line.split_whitespace();
    matches!(
        (parts.next(), parts.next()),
        (Some("HTTP/1.0" | "HTTP/1.1"), Some("200"))
    )
}

/// Send CONNECT over an open proxy connection and wait for a 200
async fn establish(
    mut conn: Tunnel,
    target_host: &str,
    target_port: u16,
    auth_header: Option<&str>,
) -> Result<Tunnel> {
    let request = build_connect_request(target_host, target_port, auth_header);
    let deadline = Instant::now() + CONNECT_RESPONSE_TIMEOUT;

    let write = async {
        conn.write_all(request.as_bytes()).await?;
        conn.flush().await
    };
    match tokio::time::timeout_at(deadline, write).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            return Err(VeilError::ProxyConnectRejected(format!(
                "Failed to send CONNECT: {}",
                e
            )))
        }
        Err(_) => return Err(VeilError::ProxyResponseTimeout),
    }

    let mut response = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        let n = match tokio::time::timeout_at(deadline, conn.read(&mut chunk)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                return Err(VeilError::ProxyConnectRejected(format!(
                    "Failed to read CONNECT response: {}",
                    e
                )))
            }
            Err(_) => {
                warn!("Proxy did not answer CONNECT within {:?}", CONNECT_RESPONSE_TIMEOUT);
                return Err(VeilError::ProxyResponseTimeout);
            }
        };

        if n == 0 {
            let received = String::from_utf8_lossy(&response);
            let status_line = received.lines().next().unwrap_or("").trim();
            return Err(VeilError::ProxyConnectRejected(if status_line.is_empty() {
                "Empty CONNECT response".to_string()
            } else {
                status_line.to_string()
            }));
        }

        response.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_header_end(&response) {
            break pos;
        }
        if response.len() > MAX_CONNECT_RESPONSE {
            return Err(VeilError::ProxyConnectRejected(
                "CONNECT response headers too large".to_string(),
            ));
        }
    };

    let head = String::from_utf8_lossy(&response[..header_end]);
    let status_line = head.split("\r\n").next().unwrap_or("").to_string();

    if !is_connect_success(&status_line) {
        return Err(VeilError::ProxyConnectRejected(status_line));
    }

    Ok(into_tunnel(conn, &response[header_end + 4..]))
}

/// Offset of the `\r\n\r\n` header terminator
pub(crate) fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}
