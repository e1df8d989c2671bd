//! Corrupted payload detection.
//!
//! A device talking with the wrong session key still pushes frames, but the
//! decrypted values come out as binary noise. Such frames are recognised by
//! control characters other than tab, newline and carriage return.

use pethub_core::DpsMap;
use serde_json::Value;

fn is_control(c: char) -> bool {
    c.is_control() && !matches!(c, '\t' | '\n' | '\r')
}

fn value_is_corrupted(value: &Value) -> bool {
    match value {
        Value::String(s) => s.chars().any(is_control),
        Value::Array(items) => items.iter().any(value_is_corrupted),
        Value::Object(map) => map
            .iter()
            .any(|(key, value)| key.chars().any(is_control) || value_is_corrupted(value)),
        Value::Null | Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Whether any key or string value of a data point map contains a control
/// character.
pub fn is_corrupted(dps: &DpsMap) -> bool {
    dps.iter()
        .any(|(key, value)| key.chars().any(is_control) || value_is_corrupted(value))
}

/// Whether a raw frame contains a control byte.
pub fn is_corrupted_bytes(raw: &[u8]) -> bool {
    raw.iter()
        .any(|&b| (b < 0x20 || b == 0x7F) && !matches!(b, b'\t' | b'\n' | b'\r'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dps(value: Value) -> DpsMap {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_clean_payload() {
        let map = dps(json!({"1": "EQceAgE=", "4": "standby", "102": 80, "106": true}));
        assert!(!is_corrupted(&map));
    }

    #[test]
    fn test_whitespace_is_not_corruption() {
        let map = dps(json!({"104": "R:3  C:2\tT:1700000000\r\n"}));
        assert!(!is_corrupted(&map));
    }

    #[test]
    fn test_control_characters_in_value() {
        let map = dps(json!({"101": "fu\u{0001}ll"}));
        assert!(is_corrupted(&map));

        let nested = dps(json!({"15": {"report": ["ok", "\u{001b}[0m"]}}));
        assert!(is_corrupted(&nested));
    }

    #[test]
    fn test_raw_bytes() {
        assert!(!is_corrupted_bytes(b"{\"dps\":{\"1\":true}}\n"));
        assert!(is_corrupted_bytes(&[b'{', 0x00, b'}']));
        assert!(is_corrupted_bytes(&[0x7F]));
    }
}
