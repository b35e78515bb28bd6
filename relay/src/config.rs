//! Relay configuration, read once from the environment.

use std::time::Duration;
use tracing::warn;

use crate::correlator::DEFAULT_BUFFER_LIMIT;

/// Relay settings
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen port (`PORT`)
    pub port: u16,
    /// Domain tunnels are served under (`BASE_DOMAIN`)
    pub base_domain: String,
    /// Scheme used in announced tunnel URLs (`PROTOCOL`)
    pub protocol: String,
    /// WebSocket upgrade path for tunnel clients (`TUNNEL_PATH`)
    pub tunnel_path: String,
    /// Session length in minutes, <= 0 disables expiry (`CONNECTION_TIMEOUT_MINUTES`)
    pub session_timeout_minutes: i64,
    /// Grace period between the timeout warning and the forced disconnect
    pub session_grace: Duration,
    /// Hard deadline for one tunneled request (`REQUEST_TIMEOUT_SECS`)
    pub request_timeout: Duration,
    /// Largest inbound request body forwarded to a tunnel (`MAX_BODY_BYTES`)
    pub max_body_bytes: usize,
    /// Response bytes held per request while the caller is not reading
    /// (`MAX_BUFFERED_BYTES`)
    pub max_buffered_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 4000,
            base_domain: "proxyhub.cloud".to_string(),
            protocol: "https".to_string(),
            tunnel_path: "/_proxyhub/tunnel".to_string(),
            session_timeout_minutes: 30,
            session_grace: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            max_body_bytes: 10 * 1024 * 1024,
            max_buffered_bytes: DEFAULT_BUFFER_LIMIT,
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup. Unparseable values keep the default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(port) = parsed(&lookup, "PORT") {
            config.port = port;
        }
        if let Some(domain) = non_empty(&lookup, "BASE_DOMAIN") {
            config.base_domain = domain;
        }
        if let Some(protocol) = non_empty(&lookup, "PROTOCOL") {
            config.protocol = protocol;
        }
        if let Some(path) = non_empty(&lookup, "TUNNEL_PATH") {
            config.tunnel_path = if path.starts_with('/') {
                path
            } else {
                format!("/{}", path)
            };
        }
        if let Some(minutes) = parsed(&lookup, "CONNECTION_TIMEOUT_MINUTES") {
            config.session_timeout_minutes = minutes;
        }
        if let Some(secs) = parsed::<u64, _>(&lookup, "REQUEST_TIMEOUT_SECS") {
            config.request_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(bytes) = parsed(&lookup, "MAX_BODY_BYTES") {
            config.max_body_bytes = bytes;
        }
        if let Some(bytes) = parsed(&lookup, "MAX_BUFFERED_BYTES") {
            config.max_buffered_bytes = bytes;
        }

        config
    }

    /// Public URL for a sanitized stable id.
    pub fn tunnel_url(&self, stable_id: &str) -> String {
        format!("{}://{}.{}", self.protocol, stable_id, self.base_domain)
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = non_empty(lookup, key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring invalid {}={:?}", key, raw);
            None
        }
    }
}
