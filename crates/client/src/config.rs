// Client configuration file.
//
// Global config: `~/.courier/config.toml`

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::backoff::BackoffPolicy;

/// Root directory for Courier state: `~/.courier/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".courier"))
}

/// Path to the config file: `~/.courier/config.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("config.toml"))
}

// ── Client config ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ClientConfig {
    pub server: ServerConfig,
    pub reconnect: ReconnectConfig,
    pub heartbeat: HeartbeatConfig,
    pub outbox: OutboxConfig,
    pub router: RouterConfig,
    pub typing: TypingConfig,
}

impl ClientConfig {
    /// Load from `~/.courier/config.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        global_config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    /// Load from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Reject configurations the session layer cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(ws_url) = &self.server.ws_url {
            validate_ws_url(ws_url)?;
        }
        if let Some(api_url) = &self.server.api_url {
            validate_api_url(api_url)?;
        }
        if self.server.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid("server.connect_timeout_ms must be > 0".into()));
        }
        if self.heartbeat.interval_ms == 0 || self.heartbeat.timeout_multiplier == 0 {
            return Err(ConfigError::Invalid("heartbeat interval and multiplier must be > 0".into()));
        }
        if self.reconnect.base_delay_ms == 0 || self.reconnect.max_delay_ms < self.reconnect.base_delay_ms
        {
            return Err(ConfigError::Invalid(
                "reconnect delays must satisfy 0 < base_delay_ms <= max_delay_ms".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter) {
            return Err(ConfigError::Invalid("reconnect jitter must be within [0, 1]".into()));
        }
        if self.outbox.max_per_chat == 0 || self.outbox.ack_timeout_ms == 0 {
            return Err(ConfigError::Invalid("outbox bounds must be > 0".into()));
        }
        Ok(())
    }
}

/// Backend endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// WebSocket endpoint (e.g. `wss://chat.example.com/ws`).
    pub ws_url: Option<String>,
    /// REST base URL used for history resync (e.g. `https://chat.example.com/api`).
    pub api_url: Option<String>,
    /// Bound on socket open plus auth handshake.
    pub connect_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { ws_url: None, api_url: None, connect_timeout_ms: 10_000 }
    }
}

impl ServerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Consecutive failed attempts before the session is marked failed.
    pub max_attempts: u32,
    /// Fraction of each delay that is randomized away (0 disables jitter).
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self { base_delay_ms: 1_000, max_delay_ms: 30_000, max_attempts: 5, jitter: 0.2 }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_attempts: self.max_attempts,
            jitter: self.jitter,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    /// Silence longer than `interval × timeout_multiplier` means the link is dead.
    pub timeout_multiplier: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval_ms: 15_000, timeout_multiplier: 2 }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        self.interval().saturating_mul(self.timeout_multiplier)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutboxConfig {
    pub max_per_chat: usize,
    pub ack_timeout_ms: u64,
    /// Sends attempted before an unacknowledged action is failed.
    pub max_attempts: u32,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self { max_per_chat: 500, ack_timeout_ms: 10_000, max_attempts: 5 }
    }
}

impl OutboxConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RouterConfig {
    pub dedup_capacity: usize,
    pub dedup_ttl_ms: u64,
    pub typing_expiry_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self { dedup_capacity: 1_024, dedup_ttl_ms: 300_000, typing_expiry_ms: 5_000 }
    }
}

impl RouterConfig {
    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_millis(self.dedup_ttl_ms)
    }

    pub fn typing_expiry(&self) -> Duration {
        Duration::from_millis(self.typing_expiry_ms)
    }
}

/// Local typing indicator debounce.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TypingConfig {
    /// Idle time after the last keystroke before `typing_stop` is sent.
    pub idle_ms: u64,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self { idle_ms: 1_000 }
    }
}

impl TypingConfig {
    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }
}

// ── URL checks ─────────────────────────────────────────────────────

pub(crate) fn validate_ws_url(value: &str) -> Result<Url, ConfigError> {
    let parsed = Url::parse(value)
        .map_err(|error| ConfigError::Invalid(format!("invalid ws_url `{value}`: {error}")))?;
    match parsed.scheme() {
        "wss" => Ok(parsed),
        "ws" if is_loopback_host(parsed.host_str()) => Ok(parsed),
        _ => Err(ConfigError::Invalid(
            "ws_url must use wss (ws is allowed only for localhost testing)".into(),
        )),
    }
}

pub(crate) fn validate_api_url(value: &str) -> Result<Url, ConfigError> {
    let parsed = Url::parse(value)
        .map_err(|error| ConfigError::Invalid(format!("invalid api_url `{value}`: {error}")))?;
    match parsed.scheme() {
        "https" => Ok(parsed),
        "http" if is_loopback_host(parsed.host_str()) => Ok(parsed),
        _ => Err(ConfigError::Invalid(
            "api_url must use https (http is allowed only for localhost testing)".into(),
        )),
    }
}

fn is_loopback_host(host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .is_ok_and(|addr| addr.is_loopback())
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = ClientConfig::default();
        assert!(cfg.server.ws_url.is_none());
        assert_eq!(cfg.server.connect_timeout_ms, 10_000);
        assert_eq!(cfg.reconnect.base_delay_ms, 1_000);
        assert_eq!(cfg.reconnect.max_delay_ms, 30_000);
        assert_eq!(cfg.reconnect.max_attempts, 5);
        assert_eq!(cfg.heartbeat.timeout(), Duration::from_secs(30));
        assert_eq!(cfg.outbox.max_per_chat, 500);
        assert_eq!(cfg.router.typing_expiry(), Duration::from_secs(5));
        assert_eq!(cfg.typing.idle(), Duration::from_secs(1));
        cfg.validate().expect("defaults should validate");
    }

    #[test]
    fn config_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut cfg = ClientConfig::default();
        cfg.server.ws_url = Some("wss://chat.example.com/ws".into());
        cfg.server.api_url = Some("https://chat.example.com/api".into());
        cfg.reconnect.max_attempts = 9;
        cfg.save_to(&path).unwrap();

        let loaded = ClientConfig::load_from(&path).unwrap();
        assert_eq!(cfg, loaded);
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let toml_str = r#"
[server]
ws_url = "ws://localhost:8000/ws"

[heartbeat]
interval_ms = 5000
"#;
        let cfg: ClientConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.server.ws_url.as_deref(), Some("ws://localhost:8000/ws"));
        assert_eq!(cfg.heartbeat.interval_ms, 5_000);
        assert_eq!(cfg.heartbeat.timeout_multiplier, 2); // default
        assert_eq!(cfg.outbox, OutboxConfig::default());
        cfg.validate().expect("loopback ws is allowed");
    }

    #[test]
    fn load_missing_file_is_error() {
        let dir = TempDir::new().unwrap();
        let result = ClientConfig::load_from(&dir.path().join("missing.toml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn validate_rejects_plaintext_remote_ws() {
        let mut cfg = ClientConfig::default();
        cfg.server.ws_url = Some("ws://chat.example.com/ws".into());
        let err = cfg.validate().expect_err("plaintext remote ws must be rejected");
        assert!(err.to_string().contains("ws_url must use wss"));
    }

    #[test]
    fn validate_rejects_inverted_backoff() {
        let mut cfg = ClientConfig::default();
        cfg.reconnect.base_delay_ms = 5_000;
        cfg.reconnect.max_delay_ms = 1_000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_connect_timeout() {
        let mut cfg = ClientConfig::default();
        cfg.server.connect_timeout_ms = 0;
        let err = cfg.validate().expect_err("zero handshake bound must be rejected");
        assert!(err.to_string().contains("connect_timeout_ms"));
    }

    #[test]
    fn loopback_detection() {
        assert!(is_loopback_host(Some("localhost")));
        assert!(is_loopback_host(Some("127.0.0.1")));
        assert!(is_loopback_host(Some("[::1]")));
        assert!(!is_loopback_host(Some("example.com")));
        assert!(!is_loopback_host(None));
    }

    #[test]
    fn global_dir_is_under_home() {
        let dir = global_dir().expect("home dir should resolve");
        assert!(dir.ends_with(".courier"));
    }
}
