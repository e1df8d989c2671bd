//! Which advertisements are lamps.
//!
//! Checked in priority order: advertised service, name prefix, name
//! substring, manufacturer id. The first rule that fires wins.

use crate::transport::Advertisement;
use crate::uuids;
use serde::Serialize;

/// Name prefixes of known lamp firmwares, compared case-insensitively.
pub const NAME_PREFIXES: &[&str] = &["ELK-", "LEDBLE", "Triones", "QHM-", "MELK", "BJ_LED", "LAMP"];

/// Substrings of user-visible names that suggest a lamp.
pub const NAME_SUBSTRINGS: &[&str] = &["lamp", "light"];

/// Manufacturer ids seen in lamp advertisements.
pub const MANUFACTURER_IDS: &[u16] = &[0x5A4C, 0x05D6];

/// Rule that recognised an advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LampMatch {
    Service,
    NamePrefix,
    NameSubstring,
    Manufacturer,
}

pub fn match_lamp(ad: &Advertisement) -> Option<LampMatch> {
    if ad
        .services
        .iter()
        .any(|s| *s == uuids::lamp::SERVICE || *s == uuids::lamp::ALT_SERVICE)
    {
        return Some(LampMatch::Service);
    }

    if let Some(name) = ad.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
        let lower = name.to_ascii_lowercase();
        if NAME_PREFIXES
            .iter()
            .any(|prefix| lower.starts_with(&prefix.to_ascii_lowercase()))
        {
            return Some(LampMatch::NamePrefix);
        }
        if NAME_SUBSTRINGS.iter().any(|needle| lower.contains(needle)) {
            return Some(LampMatch::NameSubstring);
        }
    }

    ad.manufacturer_ids
        .iter()
        .any(|id| MANUFACTURER_IDS.contains(id))
        .then_some(LampMatch::Manufacturer)
}

pub fn is_lamp(ad: &Advertisement) -> bool {
    match_lamp(ad).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pethub_core::LampId;
    use rstest::rstest;

    fn ad(name: Option<&str>) -> Advertisement {
        Advertisement {
            id: LampId::new("AA:BB:CC:DD:EE:FF").unwrap(),
            address: "AA:BB:CC:DD:EE:FF".into(),
            name: name.map(str::to_string),
            services: Vec::new(),
            manufacturer_ids: Vec::new(),
            rssi: Some(-60),
        }
    }

    #[rstest]
    #[case("ELK-BLEDOM", LampMatch::NamePrefix)]
    #[case("ledble-0042", LampMatch::NamePrefix)]
    #[case("Triones:AB12", LampMatch::NamePrefix)]
    #[case("BJ_LED_M", LampMatch::NamePrefix)]
    #[case("Bedside Lamp", LampMatch::NameSubstring)]
    #[case("Kitchen LIGHT", LampMatch::NameSubstring)]
    fn test_name_rules(#[case] name: &str, #[case] expected: LampMatch) {
        assert_eq!(match_lamp(&ad(Some(name))), Some(expected));
    }

    #[test]
    fn test_service_wins_over_name() {
        let mut seen = ad(Some("Desk lamp"));
        seen.services.push(uuids::parse("fff0").unwrap());
        assert_eq!(match_lamp(&seen), Some(LampMatch::Service));
    }

    #[test]
    fn test_manufacturer_fallback() {
        let mut seen = ad(None);
        seen.manufacturer_ids.push(0x05D6);
        assert_eq!(match_lamp(&seen), Some(LampMatch::Manufacturer));
    }

    #[rstest]
    #[case(None)]
    #[case(Some(""))]
    #[case(Some("Pixel 9"))]
    #[case(Some("Mi Band 8"))]
    fn test_not_lamps(#[case] name: Option<&str>) {
        assert!(!is_lamp(&ad(name)));
    }
}
