use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_USER_AGENT;
use crate::error::{Result, VeilError};
use crate::models::Credentials;

/// Session type identifier sent on login
pub const SESSION_TYPE_EXT: u32 = 2;

/// Client identity sent to the session API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub client_auth_secret: String,
    pub platform: String,
    #[serde(rename = "type")]
    pub client_type: String,
    pub user_agent: String,
    pub origin: String,
    pub session_type: u32,
    pub endpoints: Endpoints,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            client_auth_secret: "952b4412f002315aa50751032fcaab03".to_string(),
            platform: "chrome".to_string(),
            client_type: "chrome".to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            origin: "chrome-extension://hnmpcagpplmpfojmgmnngilcnanddlhb".to_string(),
            session_type: SESSION_TYPE_EXT,
            endpoints: Endpoints::default(),
        }
    }
}

/// Session API endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    #[serde(rename = "Session")]
    pub session: String,
    #[serde(rename = "serverlist")]
    pub server_list: String,
    #[serde(rename = "ServerCredentials")]
    pub server_credentials: String,
    #[serde(rename = "BestLocation")]
    pub best_location: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            session: "https://api.windscribe.com/Session".to_string(),
            server_list: "https://assets.windscribe.com/serverlist".to_string(),
            server_credentials: "https://api.windscribe.com/ServerCredentials".to_string(),
            best_location: "https://api.windscribe.com/BestLocation".to_string(),
        }
    }
}

/// Account data returned by a successful login
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginInfo {
    pub user_id: String,
    pub session_auth_hash: String,
    pub traffic_used: u64,
    pub traffic_max: u64,
    pub is_premium: bool,
    pub loc_hash: String,
    #[serde(default)]
    pub loc_rev: u64,
    #[serde(default)]
    pub status: u32,
}

/// Everything the toolkit remembers between runs.
///
/// Loading merges a saved document onto the defaults field by field, so a
/// file written by an older version never truncates newer fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionState {
    pub token_id: String,
    pub token: String,
    pub token_signature: String,
    pub token_signature_time: String,
    pub loc_hash: String,
    pub loc_rev: u64,
    pub is_premium: bool,
    pub status: u32,
    pub user_id: String,
    pub session_auth_hash: String,
    pub proxy_username: String,
    pub proxy_password: String,
    pub settings: Settings,
    pub traffic_usage: f64,
    pub traffic_used_formatted: String,
    pub traffic_max_formatted: String,
    pub connected_servers: Vec<String>,
    pub failed_servers: Vec<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            token_id: String::new(),
            token: String::new(),
            token_signature: String::new(),
            token_signature_time: "0".to_string(),
            loc_hash: String::new(),
            loc_rev: 0,
            is_premium: false,
            status: 0,
            user_id: String::new(),
            session_auth_hash: String::new(),
            proxy_username: String::new(),
            proxy_password: String::new(),
            settings: Settings::default(),
            traffic_usage: 0.0,
            traffic_used_formatted: "0 B".to_string(),
            traffic_max_formatted: "0 B".to_string(),
            connected_servers: Vec::new(),
            failed_servers: Vec::new(),
            last_heartbeat: None,
        }
    }
}

impl SessionState {
    /// A session is active once login produced an auth hash
    pub fn is_active(&self) -> bool {
        !self.session_auth_hash.is_empty()
    }

    /// Proxy credentials, if any were fetched
    pub fn proxy_credentials(&self) -> Option<Credentials> {
        let creds = Credentials::new(&self.proxy_username, &self.proxy_password);
        (!creds.is_empty()).then_some(creds)
    }

    pub fn apply_login(&mut self, info: &LoginInfo) {
        self.user_id = info.user_id.clone();
        self.session_auth_hash = info.session_auth_hash.clone();
        self.status = info.status;
        self.is_premium = info.is_premium;
        self.loc_rev = info.loc_rev;
        self.loc_hash = info.loc_hash.clone();
        self.traffic_usage = if info.traffic_max > 0 {
            info.traffic_used as f64 / info.traffic_max as f64 * 100.0
        } else {
            0.0
        };
        self.traffic_used_formatted = format_bytes(info.traffic_used);
        self.traffic_max_formatted = format_bytes(info.traffic_max);
    }

    pub fn apply_credentials(&mut self, credentials: &Credentials) {
        self.proxy_username = credentials.username.clone();
        self.proxy_password = credentials.password.clone();
    }

    /// Record a server that answered a probe
    pub fn mark_connected(&mut self, hostname: &str) {
        self.failed_servers.retain(|h| h != hostname);
        if !self.connected_servers.iter().any(|h| h == hostname) {
            self.connected_servers.push(hostname.to_string());
        }
        self.last_heartbeat = Some(Utc::now());
    }

    /// Record a server that failed a probe
    pub fn mark_failed(&mut self, hostname: &str) {
        self.connected_servers.retain(|h| h != hostname);
        if !self.failed_servers.iter().any(|h| h == hostname) {
            self.failed_servers.push(hostname.to_string());
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load a saved state. Returns `Ok(None)` when the file is missing or blank.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let data = std::fs::read_to_string(path)?;
        if data.trim().is_empty() {
            return Ok(None);
        }

        let state = serde_json::from_str(&data).map_err(|e| {
            VeilError::State(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        Ok(Some(state))
    }
}

/// Render a byte count with a binary unit, e.g. `833.55 KB`
pub fn format_bytes(bytes: u64) -> String {
    const SIZES: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes == 0 {
        return "0 B".to_string();
    }

    let i = ((bytes as f64).ln() / 1024f64.ln()).floor() as usize;
    let i = i.min(SIZES.len() - 1);
    format!("{:.2} {}", bytes as f64 / 1024f64.powi(i as i32), SIZES[i])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("veil-state-{}.json", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(853_555), "833.55 KB");
        assert_eq!(format_bytes(10 * 1024 * 1024 * 1024), "10.00 GB");
    }

    #[test]
    fn test_apply_login() {
        let mut state = SessionState::default();
        assert!(!state.is_active());

        state.apply_login(&LoginInfo {
            user_id: "u1".to_string(),
            session_auth_hash: "hash".to_string(),
            traffic_used: 1024,
            traffic_max: 4096,
            is_premium: true,
            loc_hash: "loc".to_string(),
            loc_rev: 7,
            status: 1,
        });

        assert!(state.is_active());
        assert_eq!(state.traffic_usage, 25.0);
        assert_eq!(state.traffic_used_formatted, "1.00 KB");
        assert_eq!(state.traffic_max_formatted, "4.00 KB");
    }

    #[test]
    fn test_proxy_credentials_require_both_fields() {
        let mut state = SessionState::default();
        assert!(state.proxy_credentials().is_none());

        state.proxy_username = "user".to_string();
        assert!(state.proxy_credentials().is_none());

        state.apply_credentials(&Credentials::new("user", "pass"));
        assert_eq!(
            state.proxy_credentials(),
            Some(Credentials::new("user", "pass"))
        );
    }

    #[test]
    fn test_server_bookkeeping() {
        let mut state = SessionState::default();
        state.mark_failed("a");
        state.mark_connected("b");
        state.mark_connected("a");

        assert_eq!(state.connected_servers, vec!["b", "a"]);
        assert!(state.failed_servers.is_empty());
        assert!(state.last_heartbeat.is_some());
    }

    #[test]
    fn test_save_load_round_trip() {
        let path = temp_path();
        let mut state = SessionState::default();
        state.session_auth_hash = "abc".to_string();
        state.proxy_username = "proxy-user".to_string();
        state.is_premium = true;
        state.settings.platform = "firefox".to_string();
        state.mark_connected("fr-par.example.net");

        state.save(&path).unwrap();
        let loaded = SessionState::load(&path).unwrap().unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded, state);
    }

    #[test]
    fn test_load_merges_onto_defaults() {
        let path = temp_path();
        std::fs::write(
            &path,
            r#"{"sessionAuthHash":"h","settings":{"platform":"edge"}}"#,
        )
        .unwrap();

        let loaded = SessionState::load(&path).unwrap().unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.session_auth_hash, "h");
        assert_eq!(loaded.settings.platform, "edge");
        assert_eq!(loaded.settings.user_agent, DEFAULT_USER_AGENT);
        assert_eq!(loaded.settings.endpoints, Endpoints::default());
        assert_eq!(loaded.token_signature_time, "0");
    }

    #[test]
    fn test_load_missing_or_blank() {
        let path = temp_path();
        assert!(SessionState::load(&path).unwrap().is_none());

        std::fs::write(&path, "   \n").unwrap();
        assert!(SessionState::load(&path).unwrap().is_none());

        std::fs::write(&path, "{not json").unwrap();
        let err = SessionState::load(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(matches!(err, VeilError::State(_)));
    }
}
