use crate::{Result, error::Error};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;
use subtle::ConstantTimeEq;

/// Raw data point map reported by a local-protocol appliance.
///
/// Keys are the numeric field ids as strings ("1", "104", ...). Values keep
/// whatever JSON type the device reported.
pub type DpsMap = BTreeMap<String, serde_json::Value>;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Create a new identifier, trimming surrounding whitespace.
            ///
            /// # Errors
            /// Returns `Error::Validation` if the identifier is empty.
            pub fn new(id: impl AsRef<str>) -> Result<Self> {
                let id = id.as_ref().trim();
                if id.is_empty() {
                    return Err(Error::validation(concat!($label, " id must not be empty")));
                }
                Ok(Self(id.to_string()))
            }

            /// Get the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = Error;

            fn try_from(value: String) -> Result<Self> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Stable identifier of a local-protocol appliance.
    DeviceId,
    "Device"
);

string_id!(
    /// Stable identifier of a BLE lamp (radio address or platform peripheral id).
    LampId,
    "Lamp"
);

/// Shared session key of a local-protocol appliance.
///
/// # Security
/// `Debug` never prints the key, and equality is constant-time so key
/// comparisons do not leak how many leading bytes matched.
#[derive(Clone, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalKey(String);

impl LocalKey {
    /// Wrap a session key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Expose the raw key bytes to a transport.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for LocalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalKey(***)")
    }
}

impl PartialEq for LocalKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes().ct_eq(other.0.as_bytes()).into()
    }
}

/// Connection state of a device or lamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        };
        f.write_str(status)
    }
}

/// Appliance kind inferred from the product category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    Feeder,
    LitterBox,
    Fountain,
    #[default]
    Unknown,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Feeder => "feeder",
            Self::LitterBox => "litter-box",
            Self::Fountain => "fountain",
            Self::Unknown => "unknown",
        };
        f.write_str(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_device_id_trims_and_rejects_empty() {
        let id = DeviceId::new("  feeder-1 ").unwrap();
        assert_eq!(id.as_str(), "feeder-1");
        assert!(DeviceId::new("   ").is_err());
        assert!(LampId::new("").is_err());
    }

    #[test]
    fn test_device_id_serde_validates() {
        let id: DeviceId = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(id.to_string(), "abc");
        assert!(serde_json::from_str::<DeviceId>("\"\"").is_err());
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
    }

    #[test]
    fn test_id_borrow_lookup() {
        let mut map = HashMap::new();
        map.insert(DeviceId::new("a").unwrap(), 1);
        assert_eq!(map.get("a"), Some(&1));
    }

    #[test]
    fn test_local_key_debug_is_redacted() {
        let key = LocalKey::new("0123456789abcdef");
        assert_eq!(format!("{key:?}"), "LocalKey(***)");
        assert_eq!(key, LocalKey::new("0123456789abcdef"));
        assert_ne!(key, LocalKey::new("0123456789abcdeX"));
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&ConnectionStatus::Connecting).unwrap();
        assert_eq!(json, "\"connecting\"");
        let kind = serde_json::to_string(&DeviceKind::LitterBox).unwrap();
        assert_eq!(kind, "\"litter-box\"");
        assert_eq!(DeviceKind::LitterBox.to_string(), "litter-box");
    }
}
