//! Connection lifecycle states and recovery settings.
//!
//! # State Machine
//!
//! ```text
//!                 connect()
//! Disconnected ─────────────────> Connected
//!      ▲  │                           │
//!      │  │ command requested         │ I/O error / failed heartbeat
//!      │  ▼                           ▼
//!      │ Reconnecting{n} <──────── Disconnected
//!      │  │
//!      └──┘ attempts exhausted (fail fast until connect())
//!
//! any state ──close()──> Closed
//! ```

use std::fmt;
use std::time::{Duration, Instant};

/// Lifecycle state of the link to the hardware server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket open.
    Disconnected,
    /// Socket open and usable.
    Connected,
    /// Background worker is re-establishing the socket.
    Reconnecting {
        /// Current attempt number (1-based)
        attempt: u32,
    },
    /// Shut down; no further commands are accepted.
    Closed,
}

impl ConnectionState {
    /// Returns true if connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Returns a short status label for display.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connected => "CONNECTED",
            Self::Reconnecting { .. } => "RECONNECTING",
            Self::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reconnecting { attempt } => write!(f, "RECONNECTING (attempt {attempt})"),
            other => f.write_str(other.label()),
        }
    }
}

/// Configuration for automatic reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Fixed delay before every attempt.
    pub delay: Duration,
    /// Maximum number of attempts per outage.
    pub max_attempts: u32,
    /// Whether auto-reconnect is enabled.
    pub enabled: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            max_attempts: 3,
            enabled: true,
        }
    }
}

impl ReconnectConfig {
    /// Delay before the given attempt (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, _attempt: u32) -> Duration {
        self.delay
    }

    /// Check if another attempt should be made after `attempts_made`.
    #[must_use]
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        self.enabled && attempts_made < self.max_attempts
    }
}

/// Configuration for idle heartbeats.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// How often idleness is checked; also the idle threshold.
    pub interval: Duration,
    /// Whether heartbeats are sent at all.
    pub enabled: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            enabled: true,
        }
    }
}

/// Heartbeat bookkeeping, readable through the connection.
#[derive(Debug, Clone, Default)]
pub struct HealthStatus {
    /// When the last heartbeat was sent.
    pub last_check: Option<Instant>,
    /// When the last heartbeat succeeded.
    pub last_success: Option<Instant>,
    /// Heartbeats sent since the connection was created.
    pub checks: u32,
    /// Consecutive heartbeat failures.
    pub consecutive_failures: u32,
    /// The last heartbeat error, for diagnostics.
    pub last_error_message: Option<String>,
}

impl HealthStatus {
    pub(crate) fn record_success(&mut self, at: Instant) {
        self.last_check = Some(at);
        self.last_success = Some(at);
        self.checks += 1;
        self.consecutive_failures = 0;
    }

    pub(crate) fn record_failure(&mut self, at: Instant, error: String) {
        self.last_check = Some(at);
        self.checks += 1;
        self.consecutive_failures += 1;
        self.last_error_message = Some(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_retry_stops_at_max() {
        let config = ReconnectConfig {
            delay: Duration::from_millis(10),
            max_attempts: 3,
            enabled: true,
        };
        assert!(config.should_retry(0));
        assert!(config.should_retry(2));
        assert!(!config.should_retry(3));
        assert!(!config.should_retry(4));
    }

    #[test]
    fn test_disabled_never_retries() {
        let config = ReconnectConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(!config.should_retry(0));
    }

    #[test]
    fn test_fixed_delay() {
        let config = ReconnectConfig::default();
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(5));
    }

    #[test]
    fn test_state_labels() {
        assert_eq!(ConnectionState::Connected.label(), "CONNECTED");
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Closed.is_connected());
        assert_eq!(
            ConnectionState::Reconnecting { attempt: 2 }.to_string(),
            "RECONNECTING (attempt 2)"
        );
    }

    #[test]
    fn test_health_status_counts() {
        let mut status = HealthStatus::default();
        let now = Instant::now();
        status.record_failure(now, "timeout".into());
        status.record_failure(now, "timeout".into());
        assert_eq!(status.consecutive_failures, 2);
        status.record_success(now);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.checks, 3);
    }
}
