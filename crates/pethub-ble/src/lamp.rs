//! Lamp state and wire format.
//!
//! | Characteristic | Payload |
//! |---|---|
//! | power | `[0]` off, `[1]` on |
//! | brightness | raw `1..=255` |
//! | temperature | raw `0..=255`, 255 = coolest |
//! | control / state | `[0xA5, on, brightness, temperature]` |
//!
//! Callers speak percentages `1..=100`. Temperature percentages map onto the
//! range the lamp actually supports, see [`TemperatureBounds`].

use pethub_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Header byte of the combined control frame.
pub const CONTROL_HEADER: u8 = 0xA5;

/// Length of the combined control frame.
pub const CONTROL_LEN: usize = 4;

pub const MIN_PERCENT: u8 = 1;
pub const MAX_PERCENT: u8 = 100;

/// Lowest brightness raw value; 0 is not a valid brightness.
pub const BRIGHTNESS_RAW_MIN: u8 = 1;
pub const BRIGHTNESS_RAW_MAX: u8 = 255;

/// Warmest temperature raw value in the protocol.
pub const TEMPERATURE_RAW_WARMEST: u8 = 0;
/// Coolest temperature raw value in the protocol.
pub const TEMPERATURE_RAW_COOLEST: u8 = 255;

/// Last known state of a lamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LampState {
    pub is_on: bool,
    /// Percent `1..=100`.
    pub brightness: u8,
    /// Percent `1..=100`; absent for lamps without colour temperature.
    pub temperature: Option<u8>,
}

impl Default for LampState {
    fn default() -> Self {
        Self {
            is_on: false,
            brightness: MAX_PERCENT,
            temperature: None,
        }
    }
}

/// Raw temperature range a lamp physically supports.
///
/// Many lamps accept the full `0..=255` range but clamp to a narrower warm
/// end. The warm bound is discovered by calibration; the cool end is always
/// available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemperatureBounds {
    pub warm_raw: u8,
    pub cool_raw: u8,
}

impl Default for TemperatureBounds {
    fn default() -> Self {
        Self {
            warm_raw: TEMPERATURE_RAW_WARMEST,
            cool_raw: TEMPERATURE_RAW_COOLEST,
        }
    }
}

impl TemperatureBounds {
    /// Bounds from a calibration read-back of the warmest raw value.
    pub fn calibrated(reported_warm: u8) -> Self {
        Self {
            warm_raw: reported_warm.min(TEMPERATURE_RAW_COOLEST - 1),
            cool_raw: TEMPERATURE_RAW_COOLEST,
        }
    }

    pub fn to_raw(&self, percent: u8) -> u8 {
        percent_to_raw(percent, self.warm_raw, self.cool_raw)
    }

    pub fn to_percent(&self, raw: u8) -> u8 {
        raw_to_percent(raw, self.warm_raw, self.cool_raw)
    }
}

/// Check a caller-supplied percentage.
pub fn validate_percent(what: &str, percent: u8) -> Result<u8> {
    if (MIN_PERCENT..=MAX_PERCENT).contains(&percent) {
        Ok(percent)
    } else {
        Err(Error::validation(format!(
            "{what} must be between {MIN_PERCENT} and {MAX_PERCENT}, got {percent}"
        )))
    }
}

/// Map `1..=100` linearly onto `min..=max`.
pub fn percent_to_raw(percent: u8, min: u8, max: u8) -> u8 {
    let percent = u32::from(percent.clamp(MIN_PERCENT, MAX_PERCENT));
    let (min, max) = (u32::from(min.min(max)), u32::from(max.max(min)));
    let span = max - min;
    let raw = min + (span * (percent - 1) + 99 / 2) / 99;
    u8::try_from(raw).unwrap_or(u8::MAX)
}

/// Inverse of [`percent_to_raw`], clamping raw values outside `min..=max`.
pub fn raw_to_percent(raw: u8, min: u8, max: u8) -> u8 {
    let (min, max) = (min.min(max), max.max(min));
    if max == min {
        return MAX_PERCENT;
    }
    let raw = u32::from(raw.clamp(min, max));
    let (min, span) = (u32::from(min), u32::from(max - min));
    let percent = 1 + ((raw - min) * 99 + span / 2) / span;
    u8::try_from(percent).unwrap_or(MAX_PERCENT)
}

pub fn brightness_to_raw(percent: u8) -> u8 {
    percent_to_raw(percent, BRIGHTNESS_RAW_MIN, BRIGHTNESS_RAW_MAX)
}

pub fn brightness_to_percent(raw: u8) -> u8 {
    raw_to_percent(raw, BRIGHTNESS_RAW_MIN, BRIGHTNESS_RAW_MAX)
}

pub fn power_payload(on: bool) -> [u8; 1] {
    [u8::from(on)]
}

pub fn parse_power(payload: &[u8]) -> Option<bool> {
    payload.first().map(|byte| *byte != 0)
}

/// Encode a full state into a control frame.
///
/// Lamps without colour temperature get the coolest raw value, which they
/// ignore.
pub fn control_payload(state: &LampState, bounds: &TemperatureBounds) -> [u8; CONTROL_LEN] {
    let temperature = state
        .temperature
        .map_or(TEMPERATURE_RAW_COOLEST, |percent| bounds.to_raw(percent));
    [
        CONTROL_HEADER,
        u8::from(state.is_on),
        brightness_to_raw(state.brightness),
        temperature,
    ]
}

/// Decoded control or state frame, raw values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlFrame {
    pub is_on: bool,
    pub brightness_raw: u8,
    pub temperature_raw: u8,
}

impl ControlFrame {
    pub fn to_state(self, bounds: Option<&TemperatureBounds>) -> LampState {
        LampState {
            is_on: self.is_on,
            brightness: brightness_to_percent(self.brightness_raw),
            temperature: bounds.map(|b| b.to_percent(self.temperature_raw)),
        }
    }
}

/// Parse a control or state frame. Frames with a wrong header or length are
/// rejected.
pub fn parse_control(payload: &[u8]) -> Option<ControlFrame> {
    match payload {
        [CONTROL_HEADER, on, brightness, temperature, ..] => Some(ControlFrame {
            is_on: *on != 0,
            brightness_raw: *brightness,
            temperature_raw: *temperature,
        }),
        _ => None,
    }
}

/// Decode a UTF-8 information string, dropping NUL padding.
pub fn parse_text(payload: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(payload);
    let text = text.trim_matches(char::from(0)).trim();
    (!text.is_empty()).then(|| text.to_string())
}
