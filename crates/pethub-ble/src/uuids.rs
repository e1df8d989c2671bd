//! Bluetooth UUID handling.
//!
//! Platforms report the same attribute as `fff1`, `0xFFF1`, `0000fff1` or
//! `0000fff1-0000-1000-8000-00805f9b34fb`. Everything is normalised to the
//! full 128-bit form before comparing.

use uuid::Uuid;

/// The Bluetooth base UUID `00000000-0000-1000-8000-00805F9B34FB`.
pub const BLUETOOTH_BASE: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

const SHORT_MASK: u128 = (1u128 << 96) - 1;

/// Expand a 16-bit assigned number.
pub const fn from_u16(short: u16) -> Uuid {
    from_u32(short as u32)
}

/// Expand a 32-bit assigned number.
pub const fn from_u32(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE | ((short as u128) << 96))
}

/// The 16-bit form of `uuid`, if it is derived from the base UUID.
pub fn short_form(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    if value & SHORT_MASK != BLUETOOTH_BASE {
        return None;
    }
    u16::try_from(value >> 96).ok()
}

/// Parse any textual UUID form.
///
/// Accepts 4 or 8 hex digits (optionally `0x`-prefixed) and the 32-digit
/// form with or without dashes or braces.
pub fn parse(raw: &str) -> Option<Uuid> {
    let trimmed = raw.trim();
    let hex = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    match hex.len() {
        4 => u16::from_str_radix(hex, 16).ok().map(from_u16),
        8 => u32::from_str_radix(hex, 16).ok().map(from_u32),
        _ => Uuid::parse_str(hex).ok(),
    }
}

/// Whether two textual UUIDs name the same attribute.
pub fn same(a: &str, b: &str) -> bool {
    matches!((parse(a), parse(b)), (Some(a), Some(b)) if a == b)
}

/// GATT attributes used by the supported lamps.
pub mod lamp {
    use super::from_u16;
    use uuid::Uuid;

    /// Vendor control service.
    pub const SERVICE: Uuid = from_u16(0xFFF0);
    /// Alternative vendor service advertised by some models.
    pub const ALT_SERVICE: Uuid = from_u16(0xFFE0);

    /// Power `[0|1]`.
    pub const POWER: Uuid = from_u16(0xFFF1);
    /// Brightness, raw `1..=255`.
    pub const BRIGHTNESS: Uuid = from_u16(0xFFF2);
    /// Colour temperature, raw `0..=255`, 255 = cool end.
    pub const TEMPERATURE: Uuid = from_u16(0xFFF3);
    /// Combined control frame `[0xA5, on, brightness, temperature]`.
    pub const CONTROL: Uuid = from_u16(0xFFF4);
    /// State notifications, same frame layout as [`CONTROL`].
    pub const STATE: Uuid = from_u16(0xFFF5);

    /// GAP device name.
    pub const DEVICE_NAME: Uuid = from_u16(0x2A00);
    /// Device information: model number.
    pub const MODEL_NUMBER: Uuid = from_u16(0x2A24);
    /// Device information: firmware revision.
    pub const FIRMWARE_REVISION: Uuid = from_u16(0x2A26);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("fff1")]
    #[case("FFF1")]
    #[case("0xfff1")]
    #[case("0000fff1")]
    #[case("0000fff1-0000-1000-8000-00805f9b34fb")]
    #[case("0000FFF1-0000-1000-8000-00805F9B34FB")]
    #[case("0000fff100001000800000805f9b34fb")]
    fn test_parse_equivalent_forms(#[case] raw: &str) {
        assert_eq!(parse(raw), Some(lamp::POWER));
    }

    #[rstest]
    #[case("")]
    #[case("fff")]
    #[case("zzzz")]
    #[case("0000fff1-0000")]
    fn test_parse_rejects(#[case] raw: &str) {
        assert_eq!(parse(raw), None);
    }

    #[test]
    fn test_short_form() {
        assert_eq!(short_form(&lamp::CONTROL), Some(0xFFF4));
        assert_eq!(short_form(&from_u16(0x2A00)), Some(0x2A00));
        assert_eq!(short_form(&from_u32(0x1234_5678)), None);

        let vendor = Uuid::parse_str("6e400001-b5a3-f393-e0a9-e50e24dcca9e").unwrap();
        assert_eq!(short_form(&vendor), None);
    }

    #[test]
    fn test_same() {
        assert!(same("fff3", "0000FFF3-0000-1000-8000-00805F9B34FB"));
        assert!(!same("fff3", "fff4"));
        assert!(!same("garbage", "garbage"));
    }
}
