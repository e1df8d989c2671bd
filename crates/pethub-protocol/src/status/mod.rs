//! Status translators.
//!
//! Each appliance kind reports its state as a map of numbered data points.
//! The translators here turn such a map into a named structure and never
//! fail:
//!
//! - absent enumerated fields take the documented default state, absent
//!   numeric and boolean fields are `None`;
//! - a value of the wrong type, or a string outside the known set, becomes
//!   the `Unknown` state (enumerations) or `None` (everything else).

pub mod feeder;
pub mod fountain;
pub mod litter_box;

pub use feeder::{FeedHistory, FeedState, FeederStatus, FoodLevel};
pub use fountain::{FountainMode, FountainStatus, WaterLevel};
pub use litter_box::{CleanState, LitterBoxStatus, LitterLevel};

use pethub_core::{DeviceKind, DpsMap};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Typed status of an appliance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "status", rename_all = "kebab-case")]
pub enum DeviceStatus {
    Feeder(FeederStatus),
    LitterBox(LitterBoxStatus),
    Fountain(FountainStatus),
    /// Raw data points of an appliance we have no translator for.
    Unknown(DpsMap),
}

impl DeviceStatus {
    pub fn kind(&self) -> DeviceKind {
        match self {
            Self::Feeder(_) => DeviceKind::Feeder,
            Self::LitterBox(_) => DeviceKind::LitterBox,
            Self::Fountain(_) => DeviceKind::Fountain,
            Self::Unknown(_) => DeviceKind::Unknown,
        }
    }
}

/// Translate a raw data point map for the given appliance kind.
///
/// # Examples
///
/// ```
/// use pethub_core::{DeviceKind, DpsMap};
/// use pethub_protocol::status::{DeviceStatus, FeedState, translate};
///
/// let dps: DpsMap = serde_json::from_str(r#"{"4": "feeding", "102": 64}"#).unwrap();
/// let DeviceStatus::Feeder(status) = translate(DeviceKind::Feeder, &dps) else {
///     unreachable!()
/// };
/// assert_eq!(status.feed_state, FeedState::Feeding);
/// assert_eq!(status.battery, Some(64));
/// ```
pub fn translate(kind: DeviceKind, dps: &DpsMap) -> DeviceStatus {
    match kind {
        DeviceKind::Feeder => DeviceStatus::Feeder(FeederStatus::from_dps(dps)),
        DeviceKind::LitterBox => DeviceStatus::LitterBox(LitterBoxStatus::from_dps(dps)),
        DeviceKind::Fountain => DeviceStatus::Fountain(FountainStatus::from_dps(dps)),
        DeviceKind::Unknown => DeviceStatus::Unknown(dps.clone()),
    }
}

/// Render a duration given in minutes.
///
/// ```
/// use pethub_protocol::status::format_minutes;
///
/// assert_eq!(format_minutes(45), "45 min");
/// assert_eq!(format_minutes(90), "1 h 30 min");
/// assert_eq!(format_minutes(3060), "2 d 3 h");
/// ```
pub fn format_minutes(minutes: u64) -> String {
    const HOUR: u64 = 60;
    const DAY: u64 = 24 * HOUR;

    if minutes < HOUR {
        format!("{minutes} min")
    } else if minutes < DAY {
        match minutes % HOUR {
            0 => format!("{} h", minutes / HOUR),
            rest => format!("{} h {rest} min", minutes / HOUR),
        }
    } else {
        match (minutes % DAY) / HOUR {
            0 => format!("{} d", minutes / DAY),
            hours => format!("{} d {hours} h", minutes / DAY),
        }
    }
}

/// Enumerated data point carried as a string.
pub(crate) trait WireEnum: Sized {
    /// State assumed when the field is absent.
    const ABSENT: Self;
    /// State used for unrecognised or mistyped values.
    const UNKNOWN: Self;

    fn from_wire(value: &str) -> Option<Self>;
}

pub(crate) fn read_enum<T: WireEnum>(dps: &DpsMap, id: &str) -> T {
    match dps.get(id) {
        None | Some(Value::Null) => T::ABSENT,
        Some(Value::String(s)) => T::from_wire(s.trim()).unwrap_or(T::UNKNOWN),
        Some(_) => T::UNKNOWN,
    }
}

pub(crate) fn read_u32(dps: &DpsMap, id: &str) -> Option<u32> {
    dps.get(id)
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
}

pub(crate) fn read_bool(dps: &DpsMap, id: &str) -> Option<bool> {
    dps.get(id).and_then(Value::as_bool)
}

pub(crate) fn read_str<'a>(dps: &'a DpsMap, id: &str) -> Option<&'a str> {
    dps.get(id).and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case(0, "0 min")]
    #[case(59, "59 min")]
    #[case(60, "1 h")]
    #[case(61, "1 h 1 min")]
    #[case(1439, "23 h 59 min")]
    #[case(1440, "1 d")]
    #[case(1500, "1 d 1 h")]
    fn test_format_minutes(#[case] minutes: u64, #[case] expected: &str) {
        assert_eq!(format_minutes(minutes), expected);
    }

    #[test]
    fn test_unknown_kind_passes_raw_map() {
        let dps: DpsMap = serde_json::from_value(json!({"20": true, "21": "white"})).unwrap();
        let status = translate(DeviceKind::Unknown, &dps);
        assert_eq!(status, DeviceStatus::Unknown(dps));
        assert_eq!(status.kind(), DeviceKind::Unknown);
    }

    #[test]
    fn test_status_serializes_with_kind_tag() {
        let status = translate(DeviceKind::Fountain, &DpsMap::new());
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["kind"], "fountain");
        assert_eq!(json["status"]["mode"], "normal");
    }

    #[test]
    fn test_numeric_helpers_reject_mismatched_types() {
        let dps: DpsMap =
            serde_json::from_value(json!({"a": -1, "b": "12", "c": 4_294_967_296u64, "d": 7}))
                .unwrap();
        assert_eq!(read_u32(&dps, "a"), None);
        assert_eq!(read_u32(&dps, "b"), None);
        assert_eq!(read_u32(&dps, "c"), None);
        assert_eq!(read_u32(&dps, "d"), Some(7));
        assert_eq!(read_bool(&dps, "d"), None);
    }
}
