//! Error types shared by the pethub crates.
//!
//! Failures fall into three groups:
//!
//! - **Caller errors** (`NotFound`, `Encoding`, `Decoding`, `Validation`,
//!   `Unsupported`): surfaced immediately and never retried.
//! - **Transport faults** (`NotConnectable`, `ConnectionTimeout`,
//!   `Transport`, `CorruptedPayload`, `AuthorizationRequired`): retried by
//!   the managers, or used to drive a device's connection state.
//! - **Exhaustion** (`CommandFailed`, `StatusTimeout`): every attempt of a
//!   caller-invoked operation failed; the last underlying cause is attached.

/// Result type alias for pethub operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while managing appliances and lamps.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Unknown device or lamp identifier.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The transport refused or failed to establish a connection.
    #[error("Device {device} not connectable: {message}")]
    NotConnectable { device: String, message: String },

    /// A connection attempt did not complete in time.
    #[error("Connection to {device} timed out after {duration_ms}ms")]
    ConnectionTimeout { device: String, duration_ms: u64 },

    /// Inbound data contained control characters and was discarded.
    #[error("Corrupted payload from {device}")]
    CorruptedPayload { device: String },

    /// The peripheral rejected the connection pending pairing/authorization.
    #[error("Authorization required by {device}: {message}")]
    AuthorizationRequired { device: String, message: String },

    /// A command failed on every attempt.
    #[error("Command to {device} failed after {attempts} attempts: {cause}")]
    CommandFailed {
        device: String,
        attempts: u32,
        #[source]
        cause: Box<Error>,
    },

    /// A status request failed on every attempt.
    #[error("Status request to {device} failed after {attempts} attempts: {cause}")]
    StatusTimeout {
        device: String,
        attempts: u32,
        #[source]
        cause: Box<Error>,
    },

    /// An operation on an established connection exceeded its deadline.
    #[error("Operation timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Meal plan could not be encoded.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Meal plan payload could not be decoded.
    #[error("Decoding error: {0}")]
    Decoding(String),

    /// Caller input failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Operation is not supported by this device.
    #[error("Unsupported operation on {device}: {operation}")]
    Unsupported { device: String, operation: String },

    /// Low-level transport failure on an otherwise established link.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The manager is shutting down and refuses new work.
    #[error("Manager is shutting down")]
    ShuttingDown,

    /// Persisted state could not be read or written.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a new not-found error for an appliance.
    pub fn device_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "Device",
            id: id.into(),
        }
    }

    /// Create a new not-found error for a lamp.
    pub fn lamp_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "Lamp",
            id: id.into(),
        }
    }

    /// Create a new not-connectable error.
    pub fn not_connectable(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NotConnectable {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Create a new connection timeout error.
    pub fn connection_timeout(device: impl Into<String>, duration_ms: u64) -> Self {
        Self::ConnectionTimeout {
            device: device.into(),
            duration_ms,
        }
    }

    /// Create a new operation timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create a new corrupted payload error.
    pub fn corrupted(device: impl Into<String>) -> Self {
        Self::CorruptedPayload {
            device: device.into(),
        }
    }

    /// Create a new authorization-required error.
    pub fn authorization(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AuthorizationRequired {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Wrap the last failure of a command retry loop.
    pub fn command_failed(device: impl Into<String>, attempts: u32, cause: Error) -> Self {
        Self::CommandFailed {
            device: device.into(),
            attempts,
            cause: Box::new(cause),
        }
    }

    /// Wrap the last failure of a status retry loop.
    pub fn status_timeout(device: impl Into<String>, attempts: u32, cause: Error) -> Self {
        Self::StatusTimeout {
            device: device.into(),
            attempts,
            cause: Box::new(cause),
        }
    }

    /// Create a new unsupported operation error.
    pub fn unsupported(device: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Unsupported {
            device: device.into(),
            operation: operation.into(),
        }
    }

    /// Create a new transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Create a new validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Whether retrying the same operation later could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NotConnectable { .. }
                | Self::ConnectionTimeout { .. }
                | Self::Timeout { .. }
                | Self::Transport(_)
                | Self::CorruptedPayload { .. }
                | Self::Io(_)
        )
    }

    /// Whether this is a timeout of any kind.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ConnectionTimeout { .. } | Self::Timeout { .. })
    }

    /// Whether the peer asked for pairing or rejected our credentials.
    pub fn is_authorization(&self) -> bool {
        matches!(self, Self::AuthorizationRequired { .. })
    }

    /// The innermost cause, looking through exhaustion wrappers.
    pub fn root_cause(&self) -> &Error {
        match self {
            Self::CommandFailed { cause, .. } | Self::StatusTimeout { cause, .. } => {
                cause.root_cause()
            }
            other => other,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Self::Storage(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_error() {
        let error = Error::device_not_found("feeder-1");
        assert!(matches!(error, Error::NotFound { .. }));
        assert_eq!(error.to_string(), "Device not found: feeder-1");

        let error = Error::lamp_not_found("AA:BB");
        assert_eq!(error.to_string(), "Lamp not found: AA:BB");
    }

    #[test]
    fn test_command_failed_keeps_cause() {
        let error = Error::command_failed("feeder-1", 3, Error::timeout(500));
        assert_eq!(
            error.to_string(),
            "Command to feeder-1 failed after 3 attempts: Operation timeout after 500ms"
        );

        let source = std::error::Error::source(&error).unwrap();
        assert_eq!(source.to_string(), "Operation timeout after 500ms");
        assert!(error.root_cause().is_timeout());
    }

    #[test]
    fn test_classification() {
        assert!(Error::connection_timeout("x", 10).is_transient());
        assert!(Error::transport("reset by peer").is_transient());
        assert!(!Error::validation("bad").is_transient());
        assert!(!Error::Encoding("bad".into()).is_transient());
        assert!(Error::authorization("lamp", "pairing").is_authorization());
        assert!(!Error::authorization("lamp", "pairing").is_transient());
    }

    #[test]
    fn test_nested_root_cause() {
        let inner = Error::status_timeout("dev", 2, Error::corrupted("dev"));
        let outer = Error::command_failed("dev", 1, inner);
        assert!(matches!(outer.root_cause(), Error::CorruptedPayload { .. }));
    }
}
