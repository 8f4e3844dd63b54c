use std::io;
use std::time::Duration;

use thiserror::Error;

/// Unified error type for the Veil toolkit
#[derive(Error, Debug)]
pub enum VeilError {
    // Resolution errors
    #[error("Could not resolve hostname: {hostname}")]
    Resolution { hostname: String },

    // Proxy errors
    #[error("Proxy {addr} unreachable: {source}")]
    ProxyUnreachable {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Proxy connection failed: {0}")]
    ProxyConnectRejected(String),

    #[error("Timeout waiting for proxy response")]
    ProxyResponseTimeout,

    #[error("Unsupported proxy type: {0}")]
    InvalidProxyScheme(String),

    #[error("Invalid proxy address: {0}")]
    InvalidProxyAddress(String),

    #[error("No servers configured")]
    NoServersConfigured,

    // TLS errors
    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(#[source] io::Error),

    // Exchange errors
    #[error("Timeout waiting for HTTP response after {0:?}")]
    ExchangeTimeout(Duration),

    #[error("Invalid HTTP response format: {0}")]
    MalformedResponse(String),

    // Session errors
    #[error("No active session")]
    NoActiveSession,

    #[error("Session API error: {0}")]
    Session(String),

    #[error("State persistence error: {0}")]
    State(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for Veil operations
pub type Result<T> = std::result::Result<T, VeilError>;

impl VeilError {
    /// Check if this error was caused by a deadline expiring
    pub fn is_timeout(&self) -> bool {
        match self {
            VeilError::ProxyResponseTimeout | VeilError::ExchangeTimeout(_) => true,
            VeilError::TlsHandshakeFailed(e)
            | VeilError::ProxyUnreachable { source: e, .. }
            | VeilError::Io(e) => e.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// Check if another server might succeed where this one failed
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            VeilError::NoServersConfigured
                | VeilError::InvalidProxyScheme(_)
                | VeilError::InvalidProxyAddress(_)
                | VeilError::InvalidConfig(_)
                | VeilError::NoActiveSession
        )
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for VeilError {
    fn from(err: url::ParseError) -> Self {
        VeilError::InvalidProxyAddress(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_rejected_carries_status_line() {
        let err = VeilError::ProxyConnectRejected(
            "HTTP/1.1 407 Proxy Authentication Required".to_string(),
        );
        assert_eq!(
            err.to_string(),
            "Proxy connection failed: HTTP/1.1 407 Proxy Authentication Required"
        );
    }

    #[test]
    fn test_timeout_classification() {
        assert!(VeilError::ProxyResponseTimeout.is_timeout());
        assert!(VeilError::ExchangeTimeout(Duration::from_secs(1)).is_timeout());
        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "handshake stalled");
        assert!(VeilError::TlsHandshakeFailed(timed_out).is_timeout());
        // The message alone does not make an error a timeout.
        let bad_mac = io::Error::new(io::ErrorKind::InvalidData, "bad record mac, timed out");
        assert!(!VeilError::TlsHandshakeFailed(bad_mac).is_timeout());

        let refused = VeilError::ProxyUnreachable {
            addr: "127.0.0.1:9".into(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert!(!refused.is_timeout());
        let stalled = VeilError::ProxyUnreachable {
            addr: "10.255.255.1:443".into(),
            source: io::Error::from(io::ErrorKind::TimedOut),
        };
        assert!(stalled.is_timeout());
        assert!(!VeilError::NoServersConfigured.is_timeout());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(VeilError::ProxyResponseTimeout.is_retryable());
        assert!(VeilError::ProxyConnectRejected("HTTP/1.1 502 Bad Gateway".into()).is_retryable());
        assert!(!VeilError::NoServersConfigured.is_retryable());
        assert!(!VeilError::InvalidProxyScheme("socks5".into()).is_retryable());
    }

    #[test]
    fn test_url_parse_error_conversion() {
        let err: VeilError = url::Url::parse("not a url").unwrap_err().into();
        assert!(matches!(err, VeilError::InvalidProxyAddress(_)));
    }
}
