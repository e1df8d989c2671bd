//! Litter box data points.

use super::{WireEnum, format_minutes, read_bool, read_enum, read_u32};
use pethub_core::DpsMap;
use serde::{Deserialize, Serialize};

/// Litter box data point ids.
pub mod dp {
    pub const CLEAN_STATE: &str = "101";
    pub const AUTO_CLEAN: &str = "102";
    pub const CLEAN_DELAY: &str = "103";
    pub const LITTER_LEVEL: &str = "104";
    pub const CAT_WEIGHT: &str = "105";
    pub const USAGE_COUNT: &str = "106";
    pub const FAULT: &str = "107";
    pub const LAST_USE_DURATION: &str = "108";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanState {
    Idle,
    Cleaning,
    Paused,
    Error,
    Unknown,
}

impl WireEnum for CleanState {
    const ABSENT: Self = Self::Idle;
    const UNKNOWN: Self = Self::Unknown;

    fn from_wire(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(Self::Idle),
            "cleaning" => Some(Self::Cleaning),
            "paused" => Some(Self::Paused),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LitterLevel {
    Full,
    Half,
    Low,
    Unknown,
}

impl WireEnum for LitterLevel {
    const ABSENT: Self = Self::Full;
    const UNKNOWN: Self = Self::Unknown;

    fn from_wire(value: &str) -> Option<Self> {
        match value {
            "full" => Some(Self::Full),
            "half" => Some(Self::Half),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

/// Litter box status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LitterBoxStatus {
    /// Defaults to `Idle`.
    pub clean_state: CleanState,
    pub auto_clean: Option<bool>,
    /// Delay between a visit and the automatic clean, in minutes.
    pub clean_delay_minutes: Option<u32>,
    pub clean_delay: Option<String>,
    /// Defaults to `Full`.
    pub litter_level: LitterLevel,
    pub cat_weight_grams: Option<u32>,
    /// Visits today.
    pub usage_count: Option<u32>,
    pub fault: Option<u32>,
    pub last_use_minutes: Option<u32>,
    pub last_use: Option<String>,
}

impl LitterBoxStatus {
    pub fn from_dps(dps: &DpsMap) -> Self {
        let clean_delay_minutes = read_u32(dps, dp::CLEAN_DELAY);
        let last_use_minutes = read_u32(dps, dp::LAST_USE_DURATION);

        Self {
            clean_state: read_enum(dps, dp::CLEAN_STATE),
            auto_clean: read_bool(dps, dp::AUTO_CLEAN),
            clean_delay_minutes,
            clean_delay: clean_delay_minutes.map(|m| format_minutes(m.into())),
            litter_level: read_enum(dps, dp::LITTER_LEVEL),
            cat_weight_grams: read_u32(dps, dp::CAT_WEIGHT),
            usage_count: read_u32(dps, dp::USAGE_COUNT),
            fault: read_u32(dps, dp::FAULT),
            last_use_minutes,
            last_use: last_use_minutes.map(|m| format_minutes(m.into())),
        }
    }

    pub fn has_fault(&self) -> bool {
        self.clean_state == CleanState::Error || self.fault.is_some_and(|f| f != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_full_status() {
        let dps: DpsMap = serde_json::from_value(json!({
            "101": "cleaning",
            "102": true,
            "103": 5,
            "104": "half",
            "105": 4200,
            "106": 3,
            "107": 0,
            "108": 95,
        }))
        .unwrap();
        let status = LitterBoxStatus::from_dps(&dps);

        assert_eq!(status.clean_state, CleanState::Cleaning);
        assert_eq!(status.auto_clean, Some(true));
        assert_eq!(status.clean_delay.as_deref(), Some("5 min"));
        assert_eq!(status.litter_level, LitterLevel::Half);
        assert_eq!(status.cat_weight_grams, Some(4200));
        assert_eq!(status.usage_count, Some(3));
        assert_eq!(status.last_use.as_deref(), Some("1 h 35 min"));
        assert!(!status.has_fault());
    }

    #[test]
    fn test_defaults_and_unknowns() {
        let status = LitterBoxStatus::from_dps(&DpsMap::new());
        assert_eq!(status.clean_state, CleanState::Idle);
        assert_eq!(status.litter_level, LitterLevel::Full);
        assert_eq!(status.clean_delay, None);

        let dps: DpsMap =
            serde_json::from_value(json!({"101": "exploded", "104": 2, "105": "heavy"})).unwrap();
        let status = LitterBoxStatus::from_dps(&dps);
        assert_eq!(status.clean_state, CleanState::Unknown);
        assert_eq!(status.litter_level, LitterLevel::Unknown);
        assert_eq!(status.cat_weight_grams, None);
    }

    #[test]
    fn test_error_state_is_fault() {
        let dps: DpsMap = serde_json::from_value(json!({"101": "error"})).unwrap();
        assert!(LitterBoxStatus::from_dps(&dps).has_fault());
    }
}
