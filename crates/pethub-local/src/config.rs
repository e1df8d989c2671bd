use pethub_core::Backoff;
use pethub_core::constants::{
    DEFAULT_COMMAND_ATTEMPTS, DEFAULT_COMMAND_RETRY_DELAY_MS, DEFAULT_COMMAND_TIMEOUT_MS,
    DEFAULT_CONNECT_ATTEMPTS, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_HEARTBEAT_INTERVAL_MS,
    DEFAULT_STATUS_ATTEMPTS, DEFAULT_STATUS_TIMEOUT_MS,
};
use std::time::Duration;

/// Timing and retry policy of the [`DeviceManager`](crate::DeviceManager).
///
/// # Examples
///
/// ```
/// use pethub_local::LocalManagerConfig;
/// use std::time::Duration;
///
/// let config = LocalManagerConfig::default()
///     .command_attempts(5)
///     .heartbeat_interval(None);
///
/// assert_eq!(config.command_attempts, 5);
/// assert_eq!(config.status_attempts, 2);
/// assert_eq!(config.connect_timeout, Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalManagerConfig {
    /// Deadline of one connect attempt.
    pub connect_timeout: Duration,

    /// Synchronous connect attempts made by a command or status call.
    pub connect_attempts: u32,

    /// Base of the linear delay between attempts (`delay * attempt`).
    pub retry_delay: Duration,

    /// Attempts made by `send_command`.
    pub command_attempts: u32,

    /// Deadline of one data point write.
    pub command_timeout: Duration,

    /// Attempts made by `get_status`.
    pub status_attempts: u32,

    /// Wall-clock deadline of one status attempt, connect included.
    pub status_timeout: Duration,

    /// Interval between heartbeat reads; `None` disables heartbeats.
    pub heartbeat_interval: Option<Duration>,

    /// Background reconnect policy.
    pub reconnect: Backoff,

    /// Grace period for closing a session.
    pub close_timeout: Duration,
}

impl Default for LocalManagerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            retry_delay: Duration::from_millis(DEFAULT_COMMAND_RETRY_DELAY_MS),
            command_attempts: DEFAULT_COMMAND_ATTEMPTS,
            command_timeout: Duration::from_millis(DEFAULT_COMMAND_TIMEOUT_MS),
            status_attempts: DEFAULT_STATUS_ATTEMPTS,
            status_timeout: Duration::from_millis(DEFAULT_STATUS_TIMEOUT_MS),
            heartbeat_interval: Some(Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS)),
            reconnect: Backoff::default(),
            close_timeout: Duration::from_millis(500),
        }
    }
}

impl LocalManagerConfig {
    /// Set the per-attempt connect deadline
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the synchronous connect attempt count (at least 1)
    pub fn connect_attempts(mut self, attempts: u32) -> Self {
        self.connect_attempts = attempts.max(1);
        self
    }

    /// Set the linear retry delay base
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set the command attempt count (at least 1)
    pub fn command_attempts(mut self, attempts: u32) -> Self {
        self.command_attempts = attempts.max(1);
        self
    }

    /// Set the per-write deadline
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the status attempt count (at least 1)
    pub fn status_attempts(mut self, attempts: u32) -> Self {
        self.status_attempts = attempts.max(1);
        self
    }

    /// Set the per-attempt status deadline
    pub fn status_timeout(mut self, timeout: Duration) -> Self {
        self.status_timeout = timeout;
        self
    }

    /// Set or disable the heartbeat
    pub fn heartbeat_interval(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the reconnect policy
    pub fn reconnect(mut self, backoff: Backoff) -> Self {
        self.reconnect = backoff;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = LocalManagerConfig::default();
        assert_eq!(config.command_attempts, 3);
        assert!(config.status_attempts < config.command_attempts);
        assert!(config.status_timeout < config.command_timeout);
        assert_eq!(config.heartbeat_interval, Some(Duration::from_secs(30)));
        assert_eq!(config.reconnect.max_attempts, Some(10));
    }

    #[test]
    fn test_attempts_never_zero() {
        let config = LocalManagerConfig::default()
            .command_attempts(0)
            .status_attempts(0)
            .connect_attempts(0);
        assert_eq!(config.command_attempts, 1);
        assert_eq!(config.status_attempts, 1);
        assert_eq!(config.connect_attempts, 1);
    }
}
