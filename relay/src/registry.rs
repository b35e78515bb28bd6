//! Stable id → live tunnel connection mapping.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::info;

use crate::connection::{ConnectionId, TunnelConnection};

#[derive(Clone)]
pub struct TunnelMapping {
    pub stable_id: String,
    pub connection: Arc<TunnelConnection>,
    pub local_port: Option<u16>,
    pub auth_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl TunnelMapping {
    pub fn new(
        stable_id: impl Into<String>,
        connection: Arc<TunnelConnection>,
        local_port: Option<u16>,
        auth_token: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            stable_id: stable_id.into(),
            connection,
            local_port,
            auth_token: auth_token.filter(|t| !t.is_empty()),
            created_at: now,
            last_activity_at: now,
        }
    }

    pub fn is_token_protected(&self) -> bool {
        self.auth_token.is_some()
    }
}

impl std::fmt::Debug for TunnelMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelMapping")
            .field("stable_id", &self.stable_id)
            .field("connection", &self.connection.id())
            .field("local_port", &self.local_port)
            .field("token_protected", &self.is_token_protected())
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// All live tunnels, keyed by sanitized stable id.
#[derive(Default)]
pub struct TunnelRegistry {
    tunnels: DashMap<String, TunnelMapping>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a mapping. When another connection loses its last
    /// mapping this way, it is marked superseded.
    pub fn register(&self, mapping: TunnelMapping) -> Option<TunnelMapping> {
        let stable_id = mapping.stable_id.clone();
        let new_conn = mapping.connection.id();
        let previous = self.tunnels.insert(stable_id.clone(), mapping);

        if let Some(old) = &previous {
            let old_conn = old.connection.id();
            if old_conn != new_conn {
                info!(
                    %stable_id,
                    old_connection = old_conn,
                    new_connection = new_conn,
                    "Tunnel taken over by new connection"
                );
                if !self.owns_any(old_conn) {
                    old.connection.mark_superseded();
                }
            }
        }
        previous
    }

    fn owns_any(&self, connection: ConnectionId) -> bool {
        self.tunnels
            .iter()
            .any(|entry| entry.value().connection.id() == connection)
    }

    /// Current mapping for a stable id. Refreshes its activity timestamp.
    pub fn lookup(&self, stable_id: &str) -> Option<TunnelMapping> {
        let mut entry = self.tunnels.get_mut(stable_id)?;
        entry.last_activity_at = Utc::now();
        Some(entry.clone())
    }

    /// Drop every mapping that points at `connection`. Mappings already
    /// taken over by another connection are left alone.
    pub fn remove_all(&self, connection: ConnectionId) -> Vec<String> {
        let mut removed = Vec::new();
        self.tunnels.retain(|id, mapping| {
            if mapping.connection.id() == connection {
                removed.push(id.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    pub fn snapshot(&self) -> Vec<TunnelMapping> {
        self.tunnels.iter().map(|e| e.value().clone()).collect()
    }
}
