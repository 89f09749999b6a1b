//! Backend endpoints, user settings and protocol timers

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default host serving relay, STUN and TURN
const DEFAULT_BACKEND_HOST: &str = "localhost";

/// Version tag sent to the relay on connect
pub const SIGNALING_PROTOCOL_VERSION: u32 = 1;

/// Delay before reconnecting to the relay after a transient closure
pub const SIGNALING_RECONNECT_DELAY: Duration = Duration::from_secs(15);

/// How long a listener waits for its host before giving up
pub const HOST_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// TURN credentials are re-fetched this long before they expire
pub const TURN_REFRESH_MARGIN: Duration = Duration::from_secs(120);

/// Retry delay after a failed TURN credential fetch
pub const TURN_RETRY_DELAY: Duration = Duration::from_secs(60);

/// How long to wait for an `audioinfo` reply
pub const AUDIO_INFO_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Where the relay, STUN and TURN services live
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendConfig {
    pub signaling_host: String,
    pub signaling_port: u16,
    /// Use `wss://` instead of `ws://`
    pub signaling_secure: bool,
    pub stun_host: String,
    pub stun_port: u16,
    pub turn_host: String,
    pub turn_port: u16,
    /// Static TURN credentials, used when no REST endpoint is configured
    pub turn_username: Option<String>,
    pub turn_password: Option<String>,
    /// HTTPS endpoint returning short-lived `{username, password, ttl}`
    pub turn_credentials_url: Option<String>,
    /// Base URL invitations are appended to as `<base>#<host id>`
    pub invitation_base_url: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            signaling_host: DEFAULT_BACKEND_HOST.to_string(),
            signaling_port: 443,
            signaling_secure: true,
            stun_host: DEFAULT_BACKEND_HOST.to_string(),
            stun_port: 3478,
            turn_host: DEFAULT_BACKEND_HOST.to_string(),
            turn_port: 3478,
            turn_username: None,
            turn_password: None,
            turn_credentials_url: None,
            invitation_base_url: None,
        }
    }
}

impl BackendConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Point every service at `host`
    pub fn with_backend_host(mut self, host: &str) -> Self {
        self.signaling_host = host.to_string();
        self.stun_host = host.to_string();
        self.turn_host = host.to_string();
        self
    }

    /// Share link for a session hosted by `host_id`
    pub fn invitation_url(&self, host_id: &str) -> Option<String> {
        self.invitation_base_url
            .as_ref()
            .map(|base| format!("{}#{}", base.trim_end_matches('#'), host_id))
    }
}

/// User-facing backend override
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub use_custom_backend: bool,
    pub custom_backend_host: String,
}

impl Settings {
    /// Effective backend host, if the user overrides the configured one
    pub fn backend_host(&self) -> Option<&str> {
        let host = self.custom_backend_host.trim();
        (self.use_custom_backend && !host.is_empty()).then_some(host)
    }

    /// Apply the override (if any) to `config`
    pub fn apply(&self, config: BackendConfig) -> BackendConfig {
        match self.backend_host() {
            Some(host) => config.with_backend_host(host),
            None => config,
        }
    }
}

/// Protocol timers, shortened in tests
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timing {
    pub signaling_reconnect: Duration,
    pub host_connect_timeout: Duration,
    pub turn_refresh_margin: Duration,
    pub turn_retry: Duration,
    pub audio_info_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            signaling_reconnect: SIGNALING_RECONNECT_DELAY,
            host_connect_timeout: HOST_CONNECT_TIMEOUT,
            turn_refresh_margin: TURN_REFRESH_MARGIN,
            turn_retry: TURN_RETRY_DELAY,
            audio_info_timeout: AUDIO_INFO_TIMEOUT,
        }
    }
}
