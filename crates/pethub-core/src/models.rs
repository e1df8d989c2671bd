//! Persisted configuration records.
//!
//! Both records are stored as plain JSON arrays with camelCase keys so the
//! files stay hand-editable.

use crate::constants::{DEFAULT_DEVICE_PORT, DEFAULT_PROTOCOL_VERSION};
use crate::types::{DeviceId, LampId, LocalKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Static configuration of one local-protocol appliance.
///
/// Loaded once at startup and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    /// Stable device id.
    pub id: DeviceId,

    /// Display name; falls back to the id when absent.
    #[serde(default)]
    pub name: Option<String>,

    /// Shared session key.
    pub local_key: LocalKey,

    /// Network address of the appliance.
    pub ip: String,

    /// TCP port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Local protocol version ("3.1", "3.3", ...).
    #[serde(default = "default_version")]
    pub version: String,

    /// Vendor product category code (e.g. "cwwsq").
    #[serde(default)]
    pub category: Option<String>,

    /// Free-text product name, used as a fallback for kind inference.
    #[serde(default)]
    pub product_name: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_DEVICE_PORT
}

fn default_version() -> String {
    DEFAULT_PROTOCOL_VERSION.to_string()
}

impl DeviceConfig {
    /// Create a configuration with default port and protocol version.
    pub fn new(id: DeviceId, local_key: LocalKey, ip: impl Into<String>) -> Self {
        Self {
            id,
            name: None,
            local_key,
            ip: ip.into(),
            port: DEFAULT_DEVICE_PORT,
            version: DEFAULT_PROTOCOL_VERSION.to_string(),
            category: None,
            product_name: None,
        }
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the product category code.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Set the product name.
    pub fn with_product_name(mut self, product_name: impl Into<String>) -> Self {
        self.product_name = Some(product_name.into());
        self
    }

    /// Display name, or the id when no name was configured.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.id.as_str())
    }
}

/// Persisted record of a discovered BLE lamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LampConfig {
    /// Stable lamp id (radio address or platform peripheral id).
    pub id: LampId,

    /// Display name.
    pub name: String,

    /// BLE address.
    pub address: String,

    /// Model string read from the device information service.
    #[serde(default)]
    pub model: Option<String>,

    /// Set after the first fully successful connection. Lamps that have
    /// connected once are never blacklisted automatically.
    #[serde(default)]
    pub has_connected_once: bool,

    /// Last time an advertisement from this lamp was seen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl LampConfig {
    /// Create a record for a freshly discovered lamp.
    pub fn new(id: LampId, name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            address: address.into(),
            model: None,
            has_connected_once: false,
            last_seen: None,
        }
    }

    /// Set the model string.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_config_defaults_from_json() {
        let json = r#"{"id":"feeder-1","localKey":"secret","ip":"192.168.1.20"}"#;
        let config: DeviceConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.id.as_str(), "feeder-1");
        assert_eq!(config.port, 6668);
        assert_eq!(config.version, "3.3");
        assert_eq!(config.display_name(), "feeder-1");
        assert_eq!(config.category, None);
    }

    #[test]
    fn test_device_config_builder() {
        let config = DeviceConfig::new(
            DeviceId::new("f").unwrap(),
            LocalKey::new("k"),
            "10.0.0.2",
        )
        .with_name("Kitchen feeder")
        .with_category("cwwsq");

        assert_eq!(config.display_name(), "Kitchen feeder");
        assert_eq!(config.category.as_deref(), Some("cwwsq"));
    }

    #[test]
    fn test_lamp_config_camel_case() {
        let lamp = LampConfig::new(LampId::new("AA:BB").unwrap(), "Desk", "AA:BB").with_model("X1");
        let json = serde_json::to_value(&lamp).unwrap();

        assert_eq!(json["hasConnectedOnce"], false);
        assert_eq!(json["model"], "X1");
        assert!(json.get("lastSeen").is_none());

        let back: LampConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, lamp);
    }
}
