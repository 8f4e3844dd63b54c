use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VeilError};

/// Port assumed for a proxy when none is given
pub const DEFAULT_PROXY_PORT: u16 = 443;

/// Scheme spoken on the client-to-proxy leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyScheme {
    Http,
    #[default]
    Https,
}

impl ProxyScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyScheme::Http => "http",
            ProxyScheme::Https => "https",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "http" => Some(ProxyScheme::Http),
            "https" => Some(ProxyScheme::Https),
            _ => None,
        }
    }

    /// Port-80 proxies speak plain HTTP, everything else is wrapped in TLS
    pub fn for_port(port: u16) -> Self {
        if port == 80 {
            ProxyScheme::Http
        } else {
            ProxyScheme::Https
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            ProxyScheme::Http => 80,
            ProxyScheme::Https => 443,
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, ProxyScheme::Https)
    }
}

impl std::fmt::Display for ProxyScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Username/password pair used for `Proxy-Authorization`
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Decode credentials as delivered by the session API (base64 in transit)
    pub fn from_base64(username: &str, password: &str) -> Result<Self> {
        let decode = |field: &str, value: &str| -> Result<String> {
            let raw = BASE64
                .decode(value.trim())
                .map_err(|e| VeilError::Session(format!("Invalid base64 {}: {}", field, e)))?;
            String::from_utf8(raw)
                .map_err(|e| VeilError::Session(format!("Invalid UTF-8 {}: {}", field, e)))
        };

        Ok(Self {
            username: decode("username", username)?,
            password: decode("password", password)?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.username.is_empty() || self.password.is_empty()
    }

    /// Header value for `Proxy-Authorization`
    pub fn basic_auth_header(&self) -> String {
        basic_auth_header(&self.username, &self.password)
    }
}

// Keep passwords out of logs
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Build a `Basic` authorization header value
pub fn basic_auth_header(username: &str, password: &str) -> String {
    let credentials = format!("{}:{}", username, password);
    format!("Basic {}", BASE64.encode(credentials.as_bytes()))
}

/// A proxy to be probed or used for a request.
///
/// Inputs given as a bare hostname are normalized here once, so callers
/// further down never deal with the string form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyTarget {
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

impl ProxyTarget {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            port: None,
            credentials: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PROXY_PORT)
    }
}

impl From<&str> for ProxyTarget {
    fn from(hostname: &str) -> Self {
        Self::new(hostname)
    }
}

impl From<String> for ProxyTarget {
    fn from(hostname: String) -> Self {
        Self::new(hostname)
    }
}

impl From<&ServerDescriptor> for ProxyTarget {
    fn from(server: &ServerDescriptor) -> Self {
        Self {
            hostname: server.hostname.clone(),
            port: server.port,
            credentials: None,
        }
    }
}

/// A proxy server as listed by the session API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl ServerDescriptor {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            port: None,
            country_code: None,
            city: None,
            location: None,
        }
    }

    pub fn in_country(&self, country: &str) -> bool {
        self.country_code
            .as_deref()
            .map(|c| c.eq_ignore_ascii_case(country))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_auth_header() {
        assert_eq!(basic_auth_header("user", "pass"), "Basic dXNlcjpwYXNz");
        assert_eq!(
            Credentials::new("user", "pass").basic_auth_header(),
            "Basic dXNlcjpwYXNz"
        );
    }

    #[test]
    fn test_credentials_from_base64() {
        let creds = Credentials::from_base64("dXNlcg==", "c2VjcmV0").unwrap();
        assert_eq!(creds.username, "user");
        assert_eq!(creds.password, "secret");

        let err = Credentials::from_base64("!!!", "c2VjcmV0").unwrap_err();
        assert!(matches!(err, VeilError::Session(_)));
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let rendered = format!("{:?}", Credentials::new("user", "hunter2"));
        assert!(rendered.contains("user"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_scheme_for_port() {
        assert_eq!(ProxyScheme::for_port(80), ProxyScheme::Http);
        assert_eq!(ProxyScheme::for_port(443), ProxyScheme::Https);
        assert_eq!(ProxyScheme::for_port(8443), ProxyScheme::Https);
        assert_eq!(ProxyScheme::from_str("HTTPS"), Some(ProxyScheme::Https));
        assert_eq!(ProxyScheme::from_str("socks5"), None);
    }

    #[test]
    fn test_target_normalization() {
        let target: ProxyTarget = "us-east-001.example.net".into();
        assert_eq!(target.port_or_default(), 443);
        assert!(target.credentials.is_none());

        let target = ProxyTarget::new("ca-west.example.net")
            .with_port(80)
            .with_credentials(Credentials::new("u", "p"));
        assert_eq!(target.port_or_default(), 80);
        assert!(target.credentials.is_some());
    }

    #[test]
    fn test_server_descriptor_deserialize_partial() {
        let server: ServerDescriptor =
            serde_json::from_str(r#"{"hostname":"de-fra.example.net","country_code":"DE"}"#)
                .unwrap();
        assert_eq!(server.hostname, "de-fra.example.net");
        assert!(server.in_country("de"));
        assert!(!server.in_country("us"));
        assert_eq!(ProxyTarget::from(&server).port_or_default(), 443);
    }
}
