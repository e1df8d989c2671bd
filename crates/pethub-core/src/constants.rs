//! Timing and sizing defaults shared by the device managers.
//!
//! Values are in milliseconds unless the name says otherwise. Manager
//! configuration structs start from these and may override any of them.

// ============================================================================
// Local-protocol appliances
// ============================================================================

/// Default TCP port of a local-protocol appliance.
pub const DEFAULT_DEVICE_PORT: u16 = 6668;

/// Default local protocol version.
pub const DEFAULT_PROTOCOL_VERSION: &str = "3.3";

/// Deadline for a single connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Synchronous connect attempts made by a command or status call.
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 3;

/// Attempts made by `send_command` before giving up.
pub const DEFAULT_COMMAND_ATTEMPTS: u32 = 3;

/// Base of the linear delay between command attempts (`base * attempt`).
pub const DEFAULT_COMMAND_RETRY_DELAY_MS: u64 = 500;

/// Deadline for a single command write.
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 5_000;

/// Attempts made by `get_status`; smaller than the command budget so polling
/// fails fast.
pub const DEFAULT_STATUS_ATTEMPTS: u32 = 2;

/// Deadline for a single status read.
pub const DEFAULT_STATUS_TIMEOUT_MS: u64 = 3_000;

/// Interval between heartbeat status reads on a connected appliance.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;

// ============================================================================
// Reconnect backoff
// ============================================================================

/// First reconnect delay.
pub const DEFAULT_RECONNECT_INITIAL_MS: u64 = 1_000;

/// Reconnect delay cap (before jitter).
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 60_000;

/// Upper bound of the uniform random jitter added to each reconnect delay.
pub const DEFAULT_RECONNECT_JITTER_MS: u64 = 1_000;

/// Background reconnect attempts before an appliance is left alone until the
/// next explicit command.
pub const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 10;

// ============================================================================
// BLE lamps
// ============================================================================

/// Deadline for the full lamp connect pipeline (GATT connect, discovery,
/// subscriptions, initial reads).
pub const DEFAULT_LAMP_CONNECT_TIMEOUT_MS: u64 = 15_000;

/// Deadline for a single characteristic read or write.
pub const DEFAULT_LAMP_IO_TIMEOUT_MS: u64 = 3_000;

/// Deadline for the reachability probe run after each scan.
pub const DEFAULT_LAMP_VERIFY_TIMEOUT_MS: u64 = 2_000;

/// First lamp reconnect delay. Lamps retry without an attempt limit.
pub const DEFAULT_LAMP_RECONNECT_INITIAL_MS: u64 = 2_000;

/// Lamp reconnect delay cap (before jitter).
pub const DEFAULT_LAMP_RECONNECT_MAX_MS: u64 = 300_000;

/// Length of one active scan burst.
pub const DEFAULT_SCAN_WINDOW_MS: u64 = 5_000;

/// Interval between scan bursts.
pub const DEFAULT_SCAN_INTERVAL_MS: u64 = 60_000;

/// Interval between state polls of connected lamps.
pub const DEFAULT_LAMP_POLL_INTERVAL_MS: u64 = 30_000;

/// Consecutive failures after which a never-connected lamp is blacklisted.
pub const DEFAULT_BLACKLIST_THRESHOLD: u32 = 5;

/// Settle time between the calibration write and its read-back.
pub const CALIBRATION_SETTLE_MS: u64 = 300;
