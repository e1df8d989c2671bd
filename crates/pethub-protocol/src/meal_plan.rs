//! Meal plan codec.
//!
//! A feeder stores its schedule as a list of fixed-width records, base64
//! encoded into a single data point value.
//!
//! # Record Layout
//!
//! ```text
//! ┌──────────┬──────┬────────┬─────────┬────────┐
//! │ day mask │ hour │ minute │ portion │ status │
//! │  1 byte  │  1   │   1    │    1    │   1    │
//! └──────────┴──────┴────────┴─────────┴────────┘
//! ```
//!
//! - `day mask`: bit 0 = Monday ... bit 6 = Sunday, bit 7 unused
//! - `status`: `1` enabled, `0` disabled
//!
//! Decoding reads records until fewer than five bytes remain. A trailing
//! partial record is dropped rather than rejected, because feeders have been
//! seen reporting slightly truncated schedules.
//!
//! # Portion Bounds
//!
//! Two different upper bounds are in use and kept apart on purpose:
//! [`CODEC_MAX_PORTIONS`] is what the wire format accepts, while
//! [`SCHEDULE_MAX_PORTIONS`] is the stricter bound applied to schedules
//! entered by users.
//!
//! # Examples
//!
//! ```
//! use pethub_protocol::meal_plan::{EntryStatus, MealPlanEntry, MealTime, Weekday, decode, encode};
//!
//! let entry = MealPlanEntry::new(
//!     [Weekday::Monday, Weekday::Friday],
//!     MealTime::new(7, 30).unwrap(),
//!     2,
//!     EntryStatus::Enabled,
//! );
//!
//! let encoded = encode(&[entry.clone()]).unwrap();
//! assert_eq!(encoded, "EQceAgE=");
//! assert_eq!(decode(&encoded).unwrap(), vec![entry]);
//! ```

use bytes::{Buf, BufMut, BytesMut};
use data_encoding::{BASE64, BASE64_NOPAD};
use pethub_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Size of one encoded record in bytes.
pub const RECORD_LEN: usize = 5;

/// Maximum number of entries in one plan.
pub const MAX_MEAL_PLAN_ENTRIES: usize = 10;

/// Largest portion count the wire format accepts.
pub const CODEC_MAX_PORTIONS: u8 = 12;

/// Largest portion count accepted for user-entered schedules.
pub const SCHEDULE_MAX_PORTIONS: u8 = 10;

/// Smallest portion count of a scheduled feeding.
pub const MIN_PORTIONS: u8 = 1;

const STATUS_ENABLED: u8 = 1;
const STATUS_DISABLED: u8 = 0;

/// Day of the week, in day-mask bit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Weekday {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl Weekday {
    /// All days, Monday first.
    pub const ALL: [Weekday; 7] = [
        Weekday::Monday,
        Weekday::Tuesday,
        Weekday::Wednesday,
        Weekday::Thursday,
        Weekday::Friday,
        Weekday::Saturday,
        Weekday::Sunday,
    ];

    /// Bit index in the day mask.
    pub fn index(self) -> u8 {
        self as u8
    }

    /// Mask bit for this day.
    pub fn bit(self) -> u8 {
        1 << self.index()
    }

    /// Three-letter name.
    pub fn short_name(self) -> &'static str {
        match self {
            Self::Monday => "Mon",
            Self::Tuesday => "Tue",
            Self::Wednesday => "Wed",
            Self::Thursday => "Thu",
            Self::Friday => "Fri",
            Self::Saturday => "Sat",
            Self::Sunday => "Sun",
        }
    }

    /// Full name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Monday => "Monday",
            Self::Tuesday => "Tuesday",
            Self::Wednesday => "Wednesday",
            Self::Thursday => "Thursday",
            Self::Friday => "Friday",
            Self::Saturday => "Saturday",
            Self::Sunday => "Sunday",
        }
    }

    /// Days present in a mask. Bit 7 is ignored.
    pub fn from_mask(mask: u8) -> BTreeSet<Weekday> {
        Self::ALL
            .into_iter()
            .filter(|day| mask & day.bit() != 0)
            .collect()
    }

    /// Mask with one bit set per day.
    pub fn to_mask<'a>(days: impl IntoIterator<Item = &'a Weekday>) -> u8 {
        days.into_iter().fold(0, |mask, day| mask | day.bit())
    }
}

impl fmt::Display for Weekday {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Weekday {
    type Err = Error;

    /// Accepts full or three-letter names, any case.
    fn from_str(s: &str) -> Result<Self> {
        let needle = s.trim();
        Self::ALL
            .into_iter()
            .find(|day| {
                day.name().eq_ignore_ascii_case(needle)
                    || day.short_name().eq_ignore_ascii_case(needle)
            })
            .ok_or_else(|| Error::validation(format!("Unrecognized day name: '{s}'")))
    }
}

/// Whether a scheduled feeding will run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryStatus {
    Enabled,
    Disabled,
}

impl EntryStatus {
    fn to_byte(self) -> u8 {
        match self {
            Self::Enabled => STATUS_ENABLED,
            Self::Disabled => STATUS_DISABLED,
        }
    }

    fn from_byte(byte: u8) -> Self {
        if byte == STATUS_ENABLED {
            Self::Enabled
        } else {
            Self::Disabled
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enabled => f.write_str("Enabled"),
            Self::Disabled => f.write_str("Disabled"),
        }
    }
}

impl FromStr for EntryStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            v if v.eq_ignore_ascii_case("enabled") => Ok(Self::Enabled),
            v if v.eq_ignore_ascii_case("disabled") => Ok(Self::Disabled),
            _ => Err(Error::validation(format!(
                "Status must be Enabled or Disabled, got '{s}'"
            ))),
        }
    }
}

/// Time of day of a scheduled feeding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MealTime {
    pub hour: u8,
    pub minute: u8,
}

impl MealTime {
    /// Create a validated time of day.
    ///
    /// # Errors
    /// Returns `Error::Validation` if hour > 23 or minute > 59.
    pub fn new(hour: u8, minute: u8) -> Result<Self> {
        if hour > 23 || minute > 59 {
            return Err(Error::validation(format!(
                "Time must be within 00:00-23:59, got {hour:02}:{minute:02}"
            )));
        }
        Ok(Self { hour, minute })
    }

    fn is_valid(&self) -> bool {
        self.hour <= 23 && self.minute <= 59
    }
}

impl fmt::Display for MealTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl FromStr for MealTime {
    type Err = Error;

    /// Parses strict `HH:MM`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::validation(format!("Time must match HH:MM, got '{s}'"));

        let (hour, minute) = s.split_once(':').ok_or_else(invalid)?;
        if hour.len() != 2
            || minute.len() != 2
            || !hour.bytes().chain(minute.bytes()).all(|b| b.is_ascii_digit())
        {
            return Err(invalid());
        }

        let hour = hour.parse().map_err(|_| invalid())?;
        let minute = minute.parse().map_err(|_| invalid())?;
        Self::new(hour, minute)
    }
}

/// One scheduled feeding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MealPlanEntry {
    pub days: BTreeSet<Weekday>,
    pub time: MealTime,
    pub portions: u8,
    pub status: EntryStatus,
}

impl MealPlanEntry {
    /// Create an entry. Validation happens in [`encode`] or [`MealPlanEntry::parse`].
    pub fn new(
        days: impl IntoIterator<Item = Weekday>,
        time: MealTime,
        portions: u8,
        status: EntryStatus,
    ) -> Self {
        Self {
            days: days.into_iter().collect(),
            time,
            portions,
            status,
        }
    }

    /// Build an entry from caller input, enforcing `max_portions`.
    ///
    /// # Errors
    /// Returns `Error::Validation` describing the first invalid field.
    pub fn parse(input: &MealPlanEntryInput, max_portions: u8) -> Result<Self> {
        if input.days.is_empty() {
            return Err(Error::validation("At least one day is required"));
        }
        let days = input
            .days
            .iter()
            .map(|day| day.parse())
            .collect::<Result<BTreeSet<Weekday>>>()?;

        let time: MealTime = input.time.parse()?;

        let portions = u8::try_from(input.portions)
            .ok()
            .filter(|p| (MIN_PORTIONS..=max_portions).contains(p))
            .ok_or_else(|| {
                Error::validation(format!(
                    "Portions must be {MIN_PORTIONS}-{max_portions}, got {}",
                    input.portions
                ))
            })?;

        let status = input.status.parse()?;

        Ok(Self {
            days,
            time,
            portions,
            status,
        })
    }
}

impl TryFrom<&MealPlanEntryInput> for MealPlanEntry {
    type Error = Error;

    fn try_from(input: &MealPlanEntryInput) -> Result<Self> {
        Self::parse(input, SCHEDULE_MAX_PORTIONS)
    }
}

/// Caller-supplied entry, as received from the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MealPlanEntryInput {
    pub days: Vec<String>,
    pub time: String,
    pub portions: u32,
    pub status: String,
}

/// Check caller input against the schedule bounds.
///
/// Rejects an empty or unrecognized day list, a time outside `HH:MM`
/// (hour ≤ 23, minute ≤ 59), portions outside `1..=10` and any status other
/// than `Enabled`/`Disabled`.
pub fn validate(input: &MealPlanEntryInput) -> bool {
    MealPlanEntry::parse(input, SCHEDULE_MAX_PORTIONS).is_ok()
}

/// Same as [`validate`] with a device-specific portion bound.
pub fn validate_with_limit(input: &MealPlanEntryInput, max_portions: u8) -> bool {
    MealPlanEntry::parse(input, max_portions).is_ok()
}

/// Encode a plan into its base64 wire form.
///
/// # Errors
/// Returns `Error::Encoding` if the plan has more than
/// [`MAX_MEAL_PLAN_ENTRIES`] entries, or any entry has an hour > 23, a
/// minute > 59 or portions outside `1..=12`.
pub fn encode(entries: &[MealPlanEntry]) -> Result<String> {
    if entries.len() > MAX_MEAL_PLAN_ENTRIES {
        return Err(Error::Encoding(format!(
            "Meal plan holds at most {MAX_MEAL_PLAN_ENTRIES} entries, got {}",
            entries.len()
        )));
    }

    let mut buf = BytesMut::with_capacity(entries.len() * RECORD_LEN);
    for (index, entry) in entries.iter().enumerate() {
        if !entry.time.is_valid() {
            return Err(Error::Encoding(format!(
                "Entry {index}: time {} out of range",
                entry.time
            )));
        }
        if !(MIN_PORTIONS..=CODEC_MAX_PORTIONS).contains(&entry.portions) {
            return Err(Error::Encoding(format!(
                "Entry {index}: portions must be {MIN_PORTIONS}-{CODEC_MAX_PORTIONS}, got {}",
                entry.portions
            )));
        }

        buf.put_u8(Weekday::to_mask(&entry.days));
        buf.put_u8(entry.time.hour);
        buf.put_u8(entry.time.minute);
        buf.put_u8(entry.portions);
        buf.put_u8(entry.status.to_byte());
    }

    Ok(BASE64.encode(&buf))
}

/// Decode a base64 meal plan.
///
/// Padding is optional. Records are taken at face value; only the base64
/// layer is validated.
///
/// # Errors
/// Returns `Error::Decoding` if the text is not valid base64.
pub fn decode(encoded: &str) -> Result<Vec<MealPlanEntry>> {
    let text = encoded.trim();
    let raw = BASE64
        .decode(text.as_bytes())
        .or_else(|_| BASE64_NOPAD.decode(text.as_bytes()))
        .map_err(|e| Error::Decoding(format!("Invalid base64 meal plan: {e}")))?;

    let mut buf = raw.as_slice();
    let mut entries = Vec::with_capacity(raw.len() / RECORD_LEN);
    while buf.remaining() >= RECORD_LEN {
        let days = Weekday::from_mask(buf.get_u8());
        let hour = buf.get_u8();
        let minute = buf.get_u8();
        let portions = buf.get_u8();
        let status = EntryStatus::from_byte(buf.get_u8());

        entries.push(MealPlanEntry {
            days,
            time: MealTime { hour, minute },
            portions,
            status,
        });
    }

    Ok(entries)
}

/// Render a plan, one line per entry, in input order.
///
/// ```
/// use pethub_protocol::meal_plan::{EntryStatus, MealPlanEntry, MealTime, Weekday, format};
///
/// let entry = MealPlanEntry::new([Weekday::Monday], MealTime::new(8, 5).unwrap(), 1, EntryStatus::Disabled);
/// assert_eq!(format(&[entry]), "Mon 08:05 - 1 portion (Disabled)");
/// ```
pub fn format(entries: &[MealPlanEntry]) -> String {
    entries
        .iter()
        .map(|entry| {
            let days = if entry.days.len() == Weekday::ALL.len() {
                "Every day".to_string()
            } else if entry.days.is_empty() {
                "No days".to_string()
            } else {
                entry
                    .days
                    .iter()
                    .map(|day| day.short_name())
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            let unit = if entry.portions == 1 {
                "portion"
            } else {
                "portions"
            };
            format!(
                "{days} {} - {} {unit} ({})",
                entry.time, entry.portions, entry.status
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
