use pethub_core::Backoff;
use pethub_core::constants::{
    CALIBRATION_SETTLE_MS, DEFAULT_BLACKLIST_THRESHOLD, DEFAULT_LAMP_CONNECT_TIMEOUT_MS,
    DEFAULT_LAMP_IO_TIMEOUT_MS, DEFAULT_LAMP_POLL_INTERVAL_MS, DEFAULT_LAMP_RECONNECT_INITIAL_MS,
    DEFAULT_LAMP_RECONNECT_MAX_MS, DEFAULT_LAMP_VERIFY_TIMEOUT_MS, DEFAULT_SCAN_INTERVAL_MS,
    DEFAULT_SCAN_WINDOW_MS,
};
use std::time::Duration;

/// Timing and discovery policy of the [`LampManager`](crate::LampManager).
///
/// # Examples
///
/// ```
/// use pethub_ble::LampManagerConfig;
/// use std::time::Duration;
///
/// let config = LampManagerConfig::default()
///     .scan_interval(None)
///     .blacklist_threshold(3);
///
/// assert_eq!(config.scan_window, Duration::from_secs(5));
/// assert_eq!(config.reconnect.max_attempts, None);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LampManagerConfig {
    /// Deadline for the whole connect pipeline: GATT connect, discovery,
    /// subscriptions, calibration and the initial reads. Each step is also
    /// bounded by `io_timeout`.
    pub connect_timeout: Duration,

    /// Deadline for one characteristic read or write.
    pub io_timeout: Duration,

    /// Deadline for the reachability probe after a scan.
    pub verify_timeout: Duration,

    /// Length of one active scan burst.
    pub scan_window: Duration,

    /// Interval between scan bursts; `None` disables the scan loop.
    pub scan_interval: Option<Duration>,

    /// Interval between state polls; `None` disables the poll loop.
    pub poll_interval: Option<Duration>,

    /// Consecutive failures after which a lamp that never connected is
    /// blacklisted.
    pub blacklist_threshold: u32,

    /// Background reconnect policy. Unlimited by default.
    pub reconnect: Backoff,

    /// Pause between the calibration write and its read-back.
    pub calibration_settle: Duration,

    /// Connect newly discovered lamps right away.
    pub auto_connect: bool,
}

impl Default for LampManagerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(DEFAULT_LAMP_CONNECT_TIMEOUT_MS),
            io_timeout: Duration::from_millis(DEFAULT_LAMP_IO_TIMEOUT_MS),
            verify_timeout: Duration::from_millis(DEFAULT_LAMP_VERIFY_TIMEOUT_MS),
            scan_window: Duration::from_millis(DEFAULT_SCAN_WINDOW_MS),
            scan_interval: Some(Duration::from_millis(DEFAULT_SCAN_INTERVAL_MS)),
            poll_interval: Some(Duration::from_millis(DEFAULT_LAMP_POLL_INTERVAL_MS)),
            blacklist_threshold: DEFAULT_BLACKLIST_THRESHOLD,
            reconnect: Backoff::new(
                Duration::from_millis(DEFAULT_LAMP_RECONNECT_INITIAL_MS),
                Duration::from_millis(DEFAULT_LAMP_RECONNECT_MAX_MS),
            )
            .unlimited(),
            calibration_settle: Duration::from_millis(CALIBRATION_SETTLE_MS),
            auto_connect: true,
        }
    }
}

impl LampManagerConfig {
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn verify_timeout(mut self, timeout: Duration) -> Self {
        self.verify_timeout = timeout;
        self
    }

    pub fn scan_window(mut self, window: Duration) -> Self {
        self.scan_window = window;
        self
    }

    /// Set or disable the scan loop
    pub fn scan_interval(mut self, interval: Option<Duration>) -> Self {
        self.scan_interval = interval;
        self
    }

    /// Set or disable the poll loop
    pub fn poll_interval(mut self, interval: Option<Duration>) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the blacklist threshold (at least 1)
    pub fn blacklist_threshold(mut self, threshold: u32) -> Self {
        self.blacklist_threshold = threshold.max(1);
        self
    }

    pub fn reconnect(mut self, backoff: Backoff) -> Self {
        self.reconnect = backoff;
        self
    }

    pub fn auto_connect(mut self, enabled: bool) -> Self {
        self.auto_connect = enabled;
        self
    }
}
