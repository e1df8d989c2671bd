//! Feeder data points.

use super::{WireEnum, read_bool, read_enum, read_str, read_u32};
use crate::meal_plan::{self, MealPlanEntry};
use chrono::{DateTime, Utc};
use pethub_core::DpsMap;
use serde::{Deserialize, Serialize};

/// Feeder data point ids.
pub mod dp {
    pub const MEAL_PLAN: &str = "1";
    pub const MANUAL_FEED: &str = "3";
    pub const FEED_STATE: &str = "4";
    pub const FAULT: &str = "14";
    pub const FEED_REPORT: &str = "15";
    pub const FOOD_LEVEL: &str = "101";
    pub const BATTERY: &str = "102";
    pub const FEED_HISTORY: &str = "104";
    pub const SLOW_FEED: &str = "106";
}

/// Timestamps above this are taken as milliseconds.
const MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedState {
    Standby,
    Feeding,
    Done,
    Unknown,
}

impl WireEnum for FeedState {
    const ABSENT: Self = Self::Standby;
    const UNKNOWN: Self = Self::Unknown;

    fn from_wire(value: &str) -> Option<Self> {
        match value {
            "standby" => Some(Self::Standby),
            "feeding" => Some(Self::Feeding),
            "done" => Some(Self::Done),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FoodLevel {
    Full,
    Low,
    Empty,
    Unknown,
}

impl WireEnum for FoodLevel {
    const ABSENT: Self = Self::Full;
    const UNKNOWN: Self = Self::Unknown;

    fn from_wire(value: &str) -> Option<Self> {
        match value {
            "full" => Some(Self::Full),
            "low" => Some(Self::Low),
            "empty" => Some(Self::Empty),
            _ => None,
        }
    }
}

/// Parsed feed history counters (`R:<remaining>  C:<count>  T:<ts>`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedHistory {
    /// Portions still scheduled today.
    pub remaining: u32,
    /// Feedings dispensed today.
    pub count: u32,
    /// Time of the last feeding.
    pub timestamp: Option<DateTime<Utc>>,
}

impl FeedHistory {
    /// Parse the history string. Fields may appear in any order, separated
    /// by any whitespace; `R` and `C` are required.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut remaining = None;
        let mut count = None;
        let mut timestamp = None;

        for token in raw.split_whitespace() {
            let (key, value) = token.split_once(':')?;
            match key {
                "R" => remaining = Some(value.parse().ok()?),
                "C" => count = Some(value.parse().ok()?),
                "T" => timestamp = value.parse::<i64>().ok().and_then(timestamp_from_unix),
                _ => {}
            }
        }

        Some(Self {
            remaining: remaining?,
            count: count?,
            timestamp,
        })
    }
}

/// Convert a unix timestamp given in seconds or milliseconds.
pub fn timestamp_from_unix(value: i64) -> Option<DateTime<Utc>> {
    if value > MILLIS_THRESHOLD {
        DateTime::from_timestamp_millis(value)
    } else {
        DateTime::from_timestamp(value, 0)
    }
}

/// Feeder status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeederStatus {
    /// Decoded schedule; `None` when absent or undecodable.
    pub meal_plan: Option<Vec<MealPlanEntry>>,
    /// Raw encoded schedule as reported.
    pub meal_plan_raw: Option<String>,
    /// Portions of the last manual feed request.
    pub manual_feed: Option<u32>,
    /// Defaults to `Standby`.
    pub feed_state: FeedState,
    /// Fault bitmap; `0` means healthy.
    pub fault: Option<u32>,
    /// Portions dispensed by the last feeding.
    pub last_feed_portions: Option<u32>,
    /// Defaults to `Full`.
    pub food_level: FoodLevel,
    /// Battery charge in percent, `None` outside 0..=100.
    pub battery: Option<u8>,
    pub history: Option<FeedHistory>,
    pub slow_feed: Option<bool>,
}

impl FeederStatus {
    pub fn from_dps(dps: &DpsMap) -> Self {
        let meal_plan_raw = read_str(dps, dp::MEAL_PLAN).map(str::to_string);
        let meal_plan = meal_plan_raw
            .as_deref()
            .and_then(|raw| meal_plan::decode(raw).ok());

        Self {
            meal_plan,
            meal_plan_raw,
            manual_feed: read_u32(dps, dp::MANUAL_FEED),
            feed_state: read_enum(dps, dp::FEED_STATE),
            fault: read_u32(dps, dp::FAULT),
            last_feed_portions: read_u32(dps, dp::FEED_REPORT),
            food_level: read_enum(dps, dp::FOOD_LEVEL),
            battery: read_u32(dps, dp::BATTERY)
                .filter(|b| *b <= 100)
                .and_then(|b| u8::try_from(b).ok()),
            history: read_str(dps, dp::FEED_HISTORY).and_then(FeedHistory::parse),
            slow_feed: read_bool(dps, dp::SLOW_FEED),
        }
    }

    /// Whether the fault bitmap reports anything.
    pub fn has_fault(&self) -> bool {
        self.fault.is_some_and(|f| f != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meal_plan::{EntryStatus, MealTime, Weekday};
    use chrono::TimeZone;
    use rstest::rstest;
    use serde_json::json;

    fn dps(value: serde_json::Value) -> DpsMap {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_full_status() {
        let status = FeederStatus::from_dps(&dps(json!({
            "1": "EQceAgE=",
            "3": 2,
            "4": "done",
            "14": 0,
            "15": 2,
            "101": "low",
            "102": 87,
            "104": "R:3  C:1  T:1700000000",
            "106": true,
        })));

        assert_eq!(
            status.meal_plan,
            Some(vec![MealPlanEntry::new(
                [Weekday::Monday, Weekday::Friday],
                MealTime::new(7, 30).unwrap(),
                2,
                EntryStatus::Enabled,
            )])
        );
        assert_eq!(status.feed_state, FeedState::Done);
        assert_eq!(status.food_level, FoodLevel::Low);
        assert_eq!(status.battery, Some(87));
        assert_eq!(status.slow_feed, Some(true));
        assert!(!status.has_fault());

        let history = status.history.unwrap();
        assert_eq!(history.remaining, 3);
        assert_eq!(history.count, 1);
        assert_eq!(
            history.timestamp,
            Some(Utc.with_ymd_and_hms(2023, 11, 14, 22, 13, 20).unwrap())
        );
    }

    #[test]
    fn test_empty_map_uses_defaults() {
        let status = FeederStatus::from_dps(&DpsMap::new());
        assert_eq!(status.feed_state, FeedState::Standby);
        assert_eq!(status.food_level, FoodLevel::Full);
        assert_eq!(status.meal_plan, None);
        assert_eq!(status.battery, None);
        assert_eq!(status.history, None);
    }

    #[test]
    fn test_mismatched_values_degrade_to_unknown() {
        let status = FeederStatus::from_dps(&dps(json!({
            "1": "%%%",
            "4": 3,
            "101": "overflowing",
            "102": 140,
            "104": "garbage",
            "106": "yes",
        })));
        assert_eq!(status.feed_state, FeedState::Unknown);
        assert_eq!(status.food_level, FoodLevel::Unknown);
        assert_eq!(status.meal_plan, None);
        assert_eq!(status.meal_plan_raw.as_deref(), Some("%%%"));
        assert_eq!(status.battery, None);
        assert_eq!(status.history, None);
        assert_eq!(status.slow_feed, None);
    }

    #[rstest]
    #[case(1_700_000_000, 1_700_000_000_000)]
    #[case(1_700_000_000_123, 1_700_000_000_123)]
    fn test_timestamp_magnitude(#[case] raw: i64, #[case] expected_ms: i64) {
        let ts = timestamp_from_unix(raw).unwrap();
        assert_eq!(ts.timestamp_millis(), expected_ms);
    }

    #[test]
    fn test_history_without_timestamp() {
        let history = FeedHistory::parse("C:4 R:0").unwrap();
        assert_eq!(history.remaining, 0);
        assert_eq!(history.count, 4);
        assert_eq!(history.timestamp, None);
        assert_eq!(FeedHistory::parse("R:1"), None);
    }

    #[test]
    fn test_history_serializes_iso_timestamp() {
        let history = FeedHistory::parse("R:1  C:2  T:1700000000").unwrap();
        let json = serde_json::to_value(&history).unwrap();
        assert_eq!(json["timestamp"], "2023-11-14T22:13:20Z");
    }
}
