//! Per-connection session expiry.

use std::sync::Arc;
use std::time::Duration;

use proxyhub_shared::protocol::{SessionTimeout, TimeoutNotice};
use proxyhub_shared::Frame;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::connection::TunnelConnection;

/// Starts and describes session timers for tunnel connections.
#[derive(Debug, Clone)]
pub struct SessionSupervisor {
    minutes: i64,
    grace: Duration,
}

impl SessionSupervisor {
    /// `minutes <= 0` disables expiry.
    pub fn new(minutes: i64, grace: Duration) -> Self {
        Self { minutes, grace }
    }

    pub fn enabled(&self) -> bool {
        self.minutes > 0
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.minutes.max(0) as u64 * 60)
    }

    /// Expiry details announced to the client on registration.
    pub fn describe(&self, conn: &TunnelConnection) -> SessionTimeout {
        SessionTimeout {
            minutes: self.minutes,
            enabled: self.enabled(),
            session_start_time: conn.connected_at().timestamp_millis(),
            duration_ms: self.duration().as_millis() as u64,
        }
    }

    /// Schedule the warning and forced close for `conn`. Returns `None` when
    /// expiry is disabled.
    pub fn start(&self, conn: Arc<TunnelConnection>) -> Option<SessionTimer> {
        if !self.enabled() {
            return None;
        }
        let minutes = self.minutes;
        let after = self.duration();
        let grace = self.grace;

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(after) => {}
                _ = conn.superseded() => return,
            }
            if !conn.is_connected() {
                return;
            }

            warn!(connection = conn.id(), minutes, "Session expired, notifying client");
            let notice = Frame::ConnectionTimeout(TimeoutNotice {
                message: format!(
                    "Connection has been active for {} minutes and will be disconnected.",
                    minutes
                ),
                timeout_minutes: minutes,
            });
            if conn.send(notice).await.is_err() {
                return;
            }

            tokio::select! {
                _ = tokio::time::sleep(grace) => {}
                _ = conn.superseded() => return,
            }
            if conn.is_connected() {
                info!(connection = conn.id(), "Closing expired session");
                conn.request_close();
            }
        });

        Some(SessionTimer { handle })
    }
}

/// Running session timer. Dropping it cancels the timer.
pub struct SessionTimer {
    handle: JoinHandle<()>,
}

impl SessionTimer {
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for SessionTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
