use crate::error::{Result, VeilError};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Default browser user agent sent with probe requests
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/133.0.0.0 Safari/537.36";

/// Default URL fetched through each probed proxy
pub const DEFAULT_TARGET_URL: &str = "https://ipinfo.io/json";

/// Default SNI presented to on-path observers on the proxy leg
pub const DEFAULT_FAKE_SNI: &str = "www.google.com";

/// Toolkit configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Probe configuration
    pub probe: ProbeConfig,
    /// Health monitor configuration
    pub health: HealthConfig,
    /// Session and persistence configuration
    pub session: SessionConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Maximum number of probes in flight at once (default: 5)
    pub concurrency: usize,
    /// Per-probe timeout
    pub timeout: Duration,
    /// URL fetched through every probed proxy
    pub target_url: String,
    /// SNI presented on the proxy leg
    pub fake_sni: String,
    /// User agent sent with probe requests
    pub user_agent: String,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Interval between health checks (default: 30s)
    pub interval: Duration,
    /// Invoke the reconnect hook when a health check fails
    pub auto_reconnect: bool,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a fetched server list stays fresh
    pub server_list_ttl: Duration,
    /// Where session state is saved and loaded
    pub state_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            timeout: Duration::from_secs(10),
            target_url: DEFAULT_TARGET_URL.to_string(),
            fake_sni: DEFAULT_FAKE_SNI.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            auto_reconnect: false,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_list_ttl: Duration::from_secs(600),
            state_file: PathBuf::from("session.json"),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            probe: ProbeConfig::default(),
            health: HealthConfig::default(),
            session: SessionConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let concurrency: usize = get_env_or("VEIL_PROBE_CONCURRENCY", "5")
            .parse()
            .map_err(|_| {
                VeilError::InvalidConfig("VEIL_PROBE_CONCURRENCY must be a valid number".into())
            })?;
        if concurrency == 0 {
            return Err(VeilError::InvalidConfig(
                "VEIL_PROBE_CONCURRENCY must be at least 1".into(),
            ));
        }

        let target_url = get_env_or("VEIL_TARGET_URL", DEFAULT_TARGET_URL);
        let parsed = Url::parse(&target_url).map_err(|e| {
            VeilError::InvalidConfig(format!("VEIL_TARGET_URL must be a valid URL: {}", e))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(VeilError::InvalidConfig(format!(
                "VEIL_TARGET_URL has unsupported scheme: {}",
                parsed.scheme()
            )));
        }

        let auto_reconnect: bool = get_env_or("VEIL_AUTO_RECONNECT", "false")
            .to_lowercase()
            .parse()
            .map_err(|_| {
                VeilError::InvalidConfig("VEIL_AUTO_RECONNECT must be true or false".into())
            })?;

        let format = get_env_or("LOG_FORMAT", "pretty").to_lowercase();
        if format != "json" && format != "pretty" {
            return Err(VeilError::InvalidConfig(
                "LOG_FORMAT must be either json or pretty".into(),
            ));
        }

        Ok(Config {
            probe: ProbeConfig {
                concurrency,
                timeout: Duration::from_secs(parse_secs("VEIL_PROBE_TIMEOUT", "10")?),
                target_url,
                fake_sni: get_env_or("VEIL_FAKE_SNI", DEFAULT_FAKE_SNI),
                user_agent: get_env_or("VEIL_USER_AGENT", DEFAULT_USER_AGENT),
            },
            health: HealthConfig {
                interval: Duration::from_secs(parse_secs("VEIL_HEALTH_CHECK_INTERVAL", "30")?),
                auto_reconnect,
            },
            session: SessionConfig {
                server_list_ttl: Duration::from_secs(parse_secs("VEIL_SERVER_LIST_TTL", "600")?),
                state_file: PathBuf::from(get_env_or("VEIL_STATE_FILE", "session.json")),
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format,
            },
        })
    }
}

fn parse_secs(key: &str, default: &str) -> Result<u64> {
    let secs: u64 = get_env_or(key, default).parse().map_err(|_| {
        VeilError::InvalidConfig(format!("{} must be a number of seconds", key))
    })?;
    if secs == 0 {
        return Err(VeilError::InvalidConfig(format!(
            "{} must be greater than zero",
            key
        )));
    }
    Ok(secs)
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
