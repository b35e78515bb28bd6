//! Client-side countdown for relay session expiry.

use chrono::{Local, TimeZone, Utc};
use proxyhub_shared::protocol::SessionTimeout;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

/// Minutes before expiry at which a warning is logged.
pub const WARNING_MARKS: [u64; 4] = [10, 5, 2, 1];

/// `1h 5m`, `4m 30s` or `12s`.
pub fn format_remaining(remaining: Duration) -> String {
    let total = remaining.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Warning marks still ahead, as (delay from now, minutes left) pairs.
pub fn warning_schedule(remaining: Duration) -> Vec<(Duration, u64)> {
    WARNING_MARKS
        .iter()
        .filter_map(|&minutes| {
            let mark = Duration::from_secs(minutes * 60);
            remaining.checked_sub(mark).map(|delay| (delay, minutes))
        })
        .collect()
}

/// Time left in the session as of now.
pub fn remaining(timeout: &SessionTimeout) -> Duration {
    let expires_at = timeout.session_start_time + timeout.duration_ms as i64;
    let left = expires_at - Utc::now().timestamp_millis();
    Duration::from_millis(left.max(0) as u64)
}

fn expiry_clock(timeout: &SessionTimeout) -> String {
    let expires_at = timeout.session_start_time + timeout.duration_ms as i64;
    match Local.timestamp_millis_opt(expires_at).single() {
        Some(t) => t.format("%H:%M:%S").to_string(),
        None => "unknown".to_string(),
    }
}

/// Log warnings as the session nears expiry. Returns `None` when the relay
/// does not expire sessions. Abort the handle to cancel.
pub fn start_countdown(timeout: SessionTimeout) -> Option<JoinHandle<()>> {
    if !timeout.enabled {
        return None;
    }
    let left = remaining(&timeout);
    let clock = expiry_clock(&timeout);

    Some(tokio::spawn(async move {
        let start = tokio::time::Instant::now();
        for (delay, minutes) in warning_schedule(left) {
            tokio::time::sleep_until(start + delay).await;
            let remaining = Duration::from_secs(minutes * 60);
            warn!(
                "Session expires at {} ({} left){}",
                clock,
                format_remaining(remaining),
                if minutes <= 1 { " - connection will be terminated soon" } else { "" }
            );
        }
        tokio::time::sleep_until(start + left).await;
        warn!("Session expired - connection will be terminated");
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_remaining() {
        assert_eq!(format_remaining(Duration::from_secs(3900)), "1h 5m");
        assert_eq!(format_remaining(Duration::from_secs(270)), "4m 30s");
        assert_eq!(format_remaining(Duration::from_secs(12)), "12s");
        assert_eq!(format_remaining(Duration::ZERO), "0s");
    }

    #[test]
    fn test_warning_schedule() {
        let schedule = warning_schedule(Duration::from_secs(30 * 60));
        assert_eq!(
            schedule,
            vec![
                (Duration::from_secs(20 * 60), 10),
                (Duration::from_secs(25 * 60), 5),
                (Duration::from_secs(28 * 60), 2),
                (Duration::from_secs(29 * 60), 1),
            ]
        );

        // Joining late skips marks already passed.
        let late = warning_schedule(Duration::from_secs(3 * 60));
        assert_eq!(late.iter().map(|(_, m)| *m).collect::<Vec<_>>(), vec![2, 1]);
        assert!(warning_schedule(Duration::from_secs(30)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_disabled_and_cancel() {
        let disabled = SessionTimeout {
            minutes: 0,
            enabled: false,
            session_start_time: Utc::now().timestamp_millis(),
            duration_ms: 0,
        };
        assert!(start_countdown(disabled).is_none());

        let enabled = SessionTimeout {
            minutes: 30,
            enabled: true,
            session_start_time: Utc::now().timestamp_millis(),
            duration_ms: 30 * 60 * 1000,
        };
        let handle = start_countdown(enabled).unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!handle.is_finished());
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
    }
}
