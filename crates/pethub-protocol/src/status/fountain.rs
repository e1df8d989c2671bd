//! Water fountain data points.

use super::{WireEnum, format_minutes, read_bool, read_enum, read_u32};
use pethub_core::DpsMap;
use serde::{Deserialize, Serialize};

/// Fountain data point ids.
pub mod dp {
    pub const POWER: &str = "1";
    pub const MODE: &str = "2";
    pub const FILTER_LIFE: &str = "3";
    pub const PUMP_RUNTIME: &str = "4";
    pub const WATER_LEVEL: &str = "5";
    pub const UV_LIGHT: &str = "6";
    pub const FAULT: &str = "101";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FountainMode {
    Normal,
    Smart,
    Eco,
    Unknown,
}

impl WireEnum for FountainMode {
    const ABSENT: Self = Self::Normal;
    const UNKNOWN: Self = Self::Unknown;

    fn from_wire(value: &str) -> Option<Self> {
        match value {
            "normal" => Some(Self::Normal),
            "smart" => Some(Self::Smart),
            "eco" => Some(Self::Eco),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaterLevel {
    Normal,
    Low,
    Empty,
    Unknown,
}

impl WireEnum for WaterLevel {
    const ABSENT: Self = Self::Normal;
    const UNKNOWN: Self = Self::Unknown;

    fn from_wire(value: &str) -> Option<Self> {
        match value {
            "normal" => Some(Self::Normal),
            "low" => Some(Self::Low),
            "empty" => Some(Self::Empty),
            _ => None,
        }
    }
}

/// Fountain status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FountainStatus {
    pub power: Option<bool>,
    /// Defaults to `Normal`.
    pub mode: FountainMode,
    /// Remaining filter life in days.
    pub filter_life_days: Option<u32>,
    pub pump_runtime_minutes: Option<u32>,
    pub pump_runtime: Option<String>,
    /// Defaults to `Normal`.
    pub water_level: WaterLevel,
    pub uv_light: Option<bool>,
    pub fault: Option<u32>,
}

impl FountainStatus {
    pub fn from_dps(dps: &DpsMap) -> Self {
        let pump_runtime_minutes = read_u32(dps, dp::PUMP_RUNTIME);

        Self {
            power: read_bool(dps, dp::POWER),
            mode: read_enum(dps, dp::MODE),
            filter_life_days: read_u32(dps, dp::FILTER_LIFE),
            pump_runtime_minutes,
            pump_runtime: pump_runtime_minutes.map(|m| format_minutes(m.into())),
            water_level: read_enum(dps, dp::WATER_LEVEL),
            uv_light: read_bool(dps, dp::UV_LIGHT),
            fault: read_u32(dps, dp::FAULT),
        }
    }

    /// Whether the fountain needs attention (fault or no water).
    pub fn needs_attention(&self) -> bool {
        self.water_level == WaterLevel::Empty || self.fault.is_some_and(|f| f != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_full_status() {
        let dps: DpsMap = serde_json::from_value(json!({
            "1": true,
            "2": "eco",
            "3": 21,
            "4": 3060,
            "5": "low",
            "6": false,
            "101": 0,
        }))
        .unwrap();
        let status = FountainStatus::from_dps(&dps);

        assert_eq!(status.power, Some(true));
        assert_eq!(status.mode, FountainMode::Eco);
        assert_eq!(status.filter_life_days, Some(21));
        assert_eq!(status.pump_runtime.as_deref(), Some("2 d 3 h"));
        assert_eq!(status.water_level, WaterLevel::Low);
        assert_eq!(status.uv_light, Some(false));
        assert!(!status.needs_attention());
    }

    #[test]
    fn test_defaults_and_unknowns() {
        let status = FountainStatus::from_dps(&DpsMap::new());
        assert_eq!(status.mode, FountainMode::Normal);
        assert_eq!(status.water_level, WaterLevel::Normal);
        assert_eq!(status.power, None);

        let dps: DpsMap =
            serde_json::from_value(json!({"2": "turbo", "5": "empty", "4": -3})).unwrap();
        let status = FountainStatus::from_dps(&dps);
        assert_eq!(status.mode, FountainMode::Unknown);
        assert_eq!(status.pump_runtime, None);
        assert!(status.needs_attention());
    }
}
