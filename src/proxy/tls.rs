//! TLS for both legs of a tunnel
//!
//! The proxy leg validates certificates only when a CA pool is supplied.
//! The target leg never validates: the destination is already pinned by
//! the CONNECT authority or the dialed address, and the SNI it presents may
//! be a decoy.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument};

use crate::error::{Result, VeilError};
use crate::proxy::dialer::{connect_bounded, ProxyDialer};
use crate::proxy::resolver::resolve_hostname;
use crate::proxy::transport::{Tunnel, TunnelStream};

/// Fixed bound on every TLS handshake, independent of the caller's timeout
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

fn crypto_provider() -> Arc<CryptoProvider> {
    // Every suite shipped by the provider is ECDHE + AEAD, so null,
    // anonymous, MD5 and RC4 suites are never offered.
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

fn invalid_tls_config(e: rustls::Error) -> VeilError {
    VeilError::TlsHandshakeFailed(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("Invalid TLS configuration: {}", e),
    ))
}

/// Client config for the target leg: TLS 1.2-1.3, no certificate checks
pub fn insecure_client_config() -> Result<Arc<ClientConfig>> {
    let provider = crypto_provider();
    let mut config = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .map_err(invalid_tls_config)?
        .with_root_certificates(RootCertStore::empty())
        .with_no_client_auth();

    config
        .dangerous()
        .set_certificate_verifier(Arc::new(NoCertificateVerification::new(provider)));

    Ok(Arc::new(config))
}

/// Client config for the proxy leg
pub fn proxy_client_config(trusted_cas: Option<&RootCertStore>) -> Result<Arc<ClientConfig>> {
    let Some(roots) = trusted_cas else {
        return insecure_client_config();
    };

    let config = ClientConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .map_err(invalid_tls_config)?
        .with_root_certificates(roots.clone())
        .with_no_client_auth();

    Ok(Arc::new(config))
}

/// Load a PEM bundle into a CA pool for validating the proxy leg
pub fn load_ca_pool(path: &Path) -> Result<RootCertStore> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer> = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()?;

    if certs.is_empty() {
        return Err(VeilError::InvalidConfig(format!(
            "No certificates found in {}",
            path.display()
        )));
    }

    let mut store = RootCertStore::empty();
    for cert in certs {
        store.add(cert).map_err(|e| {
            VeilError::InvalidConfig(format!("Failed to add CA certificate: {}", e))
        })?;
    }
    Ok(store)
}

/// Run a client handshake over `stream`, bounded by [`HANDSHAKE_TIMEOUT`]
pub async fn handshake<S: TunnelStream>(
    config: Arc<ClientConfig>,
    stream: S,
    server_name: &str,
) -> Result<Tunnel> {
    let name = ServerName::try_from(server_name.to_string()).map_err(|e| {
        VeilError::TlsHandshakeFailed(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Invalid server name {:?}: {}", server_name, e),
        ))
    })?;

    let connector = TlsConnector::from(config);
    match timeout(HANDSHAKE_TIMEOUT, connector.connect(name, stream)).await {
        Ok(Ok(tls)) => Ok(Box::new(tls)),
        Ok(Err(e)) => Err(VeilError::TlsHandshakeFailed(e)),
        Err(_) => Err(VeilError::TlsHandshakeFailed(io::Error::new(
            io::ErrorKind::TimedOut,
            "TLS handshake timed out",
        ))),
    }
}

/// Upgrades a stream to TLS while presenting a caller-chosen SNI
#[derive(Clone)]
pub struct FakeSniDialer {
    config: Arc<ClientConfig>,
}

impl FakeSniDialer {
    pub fn new() -> Result<Self> {
        Ok(Self {
            config: insecure_client_config()?,
        })
    }

    /// Open a stream to `target_host:target_port` (through `proxy` when
    /// given, otherwise directly) and run the TLS handshake over it.
    #[instrument(skip(self, proxy), fields(via_proxy = proxy.is_some()))]
    pub async fn dial_tls(
        &self,
        target_host: &str,
        target_port: u16,
        connect_timeout: Duration,
        proxy: Option<&ProxyDialer>,
    ) -> Result<Tunnel> {
        let stream: Tunnel = match proxy {
            Some(dialer) => dialer.dial(target_host, target_port, connect_timeout).await?,
            None => Box::new(connect_direct(target_host, target_port, connect_timeout).await?),
        };

        self.upgrade(stream, target_host).await
    }

    /// Handshake over an already-open stream, presenting `server_name` as SNI
    pub async fn upgrade<S: TunnelStream>(&self, stream: S, server_name: &str) -> Result<Tunnel> {
        let tunnel = handshake(self.config.clone(), stream, server_name).await?;
        debug!("TLS established with SNI {}", server_name);
        Ok(tunnel)
    }
}

async fn connect_direct(host: &str, port: u16, connect_timeout: Duration) -> Result<TcpStream> {
    let ip = resolve_hostname(host).await?;
    let addr = (ip, port);

    connect_bounded(format!("{}:{}", ip, port), connect_timeout, TcpStream::connect(addr)).await
}

/// Accepts any server certificate while still checking handshake signatures
#[derive(Debug)]
struct NoCertificateVerification {
    provider: Arc<CryptoProvider>,
}

impl NoCertificateVerification {
    fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
