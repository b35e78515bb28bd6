//! Configuration file parser for ProxyHub
//!
//! Reads `proxyhub.yml` with relay, local service, reconnect and mock
//! settings. Command-line flags override file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::mock::MockRule;

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Relay WebSocket URL
    #[serde(default = "default_relay")]
    pub relay: String,

    /// Local port to forward to. Without it only mocks are served.
    #[serde(default)]
    pub port: Option<u16>,

    /// Local hostname to forward to
    #[serde(default = "default_host")]
    pub local_host: String,

    /// Subdomain to request instead of the persisted one
    #[serde(default)]
    pub stable_id: Option<String>,

    /// Token callers must send in `X-Proxy-Token`
    #[serde(default)]
    pub token: Option<String>,

    /// Keep an in-memory log of tunneled requests
    #[serde(default = "default_true")]
    pub inspect: bool,

    /// Time allowed for the local service to answer with headers
    #[serde(default = "default_local_timeout")]
    pub local_timeout_secs: u64,

    /// Reconnect attempts after an unexpected disconnect
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,

    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,

    /// Where persisted stable ids live (default `~/.proxyhub`)
    #[serde(default)]
    pub id_dir: Option<PathBuf>,

    #[serde(default)]
    pub mocks: Vec<MockRule>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay: default_relay(),
            port: None,
            local_host: default_host(),
            stable_id: None,
            token: None,
            inspect: true,
            local_timeout_secs: default_local_timeout(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay(),
            id_dir: None,
            mocks: Vec::new(),
        }
    }
}

fn default_relay() -> String {
    "wss://connect.proxyhub.cloud/_proxyhub/tunnel".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_local_timeout() -> u64 {
    5
}

fn default_reconnect_attempts() -> u32 {
    3
}

fn default_reconnect_delay() -> u64 {
    500
}

impl ClientConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: ClientConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !(self.relay.starts_with("ws://") || self.relay.starts_with("wss://")) {
            anyhow::bail!("Relay URL must start with ws:// or wss://: {}", self.relay);
        }
        if self.port == Some(0) {
            anyhow::bail!("Invalid local port 0");
        }
        if self.port.is_none() && self.mocks.is_empty() {
            anyhow::bail!("Nothing to serve: set a local port or define mocks");
        }
        if self.local_timeout_secs == 0 {
            anyhow::bail!("local_timeout_secs must be at least 1");
        }
        Ok(())
    }

    pub fn local_timeout(&self) -> Duration {
        Duration::from_secs(self.local_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<PathBuf> {
        let candidates = [
            "proxyhub.yml",
            "proxyhub.yaml",
            ".proxyhub.yml",
            ".proxyhub.yaml",
        ];

        // Check current directory
        for name in &candidates {
            let path = PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        // Check home directory
        if let Some(home) = dirs::home_dir() {
            for name in &candidates {
                let path = home.join(name);
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MatchKind;

    #[test]
    fn test_parse_config() {
        let yaml = r#"
relay: wss://relay.example.com/_proxyhub/tunnel
port: 3000
token: "test-token"
stable_id: my-api-01
reconnect_attempts: 5
mocks:
  - path: /api/users
    body: '[]'
  - path: ^/api/orders/\d+$
    path_type: regex
    status_code: 404
"#;
        let config: ClientConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.port, Some(3000));
        assert_eq!(config.local_host, "127.0.0.1");
        assert_eq!(config.token.as_deref(), Some("test-token"));
        assert_eq!(config.reconnect_attempts, 5);
        assert_eq!(config.reconnect_delay(), Duration::from_millis(500));
        assert_eq!(config.local_timeout(), Duration::from_secs(5));
        assert_eq!(config.mocks.len(), 2);
        assert_eq!(config.mocks[1].match_kind, MatchKind::Regex);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        let config = ClientConfig::default();
        assert!(config.validate().is_err(), "no port and no mocks");

        let config = ClientConfig {
            port: Some(8080),
            relay: "http://relay".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ClientConfig {
            port: Some(8080),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
