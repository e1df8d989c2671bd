//! Appliance kind inference.
//!
//! Known vendor category codes win. Otherwise the category and the product
//! name are searched, case-insensitively, for a keyword.

use pethub_core::{DeviceConfig, DeviceKind};

/// Category codes the vendor assigns to pet appliances.
const CATEGORY_CODES: &[(&str, DeviceKind)] = &[
    ("cwwsq", DeviceKind::Feeder),
    ("cwwsqh", DeviceKind::Feeder),
    ("msp", DeviceKind::LitterBox),
    ("cwysj", DeviceKind::Fountain),
];

/// Keyword fallbacks, checked in order.
const KEYWORDS: &[(&str, DeviceKind)] = &[
    ("feeder", DeviceKind::Feeder),
    ("litter", DeviceKind::LitterBox),
    ("fountain", DeviceKind::Fountain),
    ("water", DeviceKind::Fountain),
];

/// Infer the appliance kind from a category code and product name.
///
/// # Examples
///
/// ```
/// use pethub_core::DeviceKind;
/// use pethub_protocol::classify;
///
/// assert_eq!(classify(Some("msp"), None), DeviceKind::LitterBox);
/// assert_eq!(classify(None, Some("Smart Pet Feeder")), DeviceKind::Feeder);
/// assert_eq!(classify(Some("kg"), Some("Switch")), DeviceKind::Unknown);
/// ```
pub fn classify(category: Option<&str>, product_name: Option<&str>) -> DeviceKind {
    let category = category.map(|c| c.trim().to_ascii_lowercase());

    if let Some(code) = category.as_deref()
        && let Some((_, kind)) = CATEGORY_CODES.iter().find(|(known, _)| *known == code)
    {
        return *kind;
    }

    let product_name = product_name.map(str::to_ascii_lowercase);
    for text in [category.as_deref(), product_name.as_deref()]
        .into_iter()
        .flatten()
    {
        if let Some((_, kind)) = KEYWORDS.iter().find(|(word, _)| text.contains(word)) {
            return *kind;
        }
    }

    DeviceKind::Unknown
}

/// Infer the appliance kind of a configured device.
pub fn classify_config(config: &DeviceConfig) -> DeviceKind {
    classify(config.category.as_deref(), config.product_name.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pethub_core::{DeviceId, LocalKey};
    use rstest::rstest;

    #[rstest]
    #[case(Some("cwwsq"), None, DeviceKind::Feeder)]
    #[case(Some("CWWSQH"), None, DeviceKind::Feeder)]
    #[case(Some("msp"), Some("Pet Fountain"), DeviceKind::LitterBox)]
    #[case(Some("cwysj"), None, DeviceKind::Fountain)]
    #[case(Some(" cwysj "), None, DeviceKind::Fountain)]
    #[case(Some("pet_feeder"), None, DeviceKind::Feeder)]
    #[case(None, Some("Self-cleaning Litter Box"), DeviceKind::LitterBox)]
    #[case(None, Some("Cat Water Dispenser"), DeviceKind::Fountain)]
    #[case(Some("dj"), Some("Ceiling light"), DeviceKind::Unknown)]
    #[case(None, None, DeviceKind::Unknown)]
    fn test_classify(
        #[case] category: Option<&str>,
        #[case] product: Option<&str>,
        #[case] expected: DeviceKind,
    ) {
        assert_eq!(classify(category, product), expected);
    }

    #[test]
    fn test_classify_config() {
        let config = DeviceConfig::new(
            DeviceId::new("f1").unwrap(),
            LocalKey::new("key"),
            "10.0.0.5",
        )
        .with_product_name("Automatic Feeder 6L");
        assert_eq!(classify_config(&config), DeviceKind::Feeder);
    }
}
