//! Postcode to delivery fee lookup.

use model::{DeliveryQuote, DeliveryZone, money};
use rust_decimal::Decimal;

use crate::error::CheckoutError;

const MAX_POSTCODE_LEN: usize = 10;

/// Canonical form used for matching: trimmed, upper-cased.
pub fn normalize_postcode(postcode: &str) -> String {
    postcode.trim().to_uppercase()
}

/// Checks that a postcode is plausible before any fee lookup happens.
pub fn validate_postcode(postcode: &str) -> Result<String, CheckoutError> {
    let normalized = normalize_postcode(postcode);
    if normalized.is_empty() {
        return Err(CheckoutError::Validation("postcode is required".to_string()));
    }
    if normalized.len() > MAX_POSTCODE_LEN
        || !normalized
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == ' ')
    {
        return Err(CheckoutError::Validation(format!(
            "'{}' is not a valid postcode",
            postcode.trim()
        )));
    }
    Ok(normalized)
}

/// Maps a postcode to a fee using the longest active matching prefix.
#[derive(Debug, Clone)]
pub struct DeliveryFeeCalculator {
    default_fee: Decimal,
    default_area: String,
}

impl DeliveryFeeCalculator {
    pub fn new(default_fee: Decimal, default_area: impl Into<String>) -> Self {
        Self {
            default_fee: money(default_fee),
            default_area: default_area.into(),
        }
    }

    /// Pure function of `(zones, postcode)`.
    ///
    /// Inactive zones and zones with a blank prefix never match. When two
    /// active zones share the longest prefix the lower id wins. No match
    /// yields the configured default fee with `matched = false`.
    pub fn compute_fee(&self, zones: &[DeliveryZone], postcode: &str) -> DeliveryQuote {
        let postcode = normalize_postcode(postcode);

        let best = zones
            .iter()
            .filter(|zone| zone.active)
            .filter_map(|zone| {
                let prefix = normalize_postcode(&zone.postcode_prefix);
                (!prefix.is_empty() && postcode.starts_with(&prefix)).then_some((prefix.len(), zone))
            })
            .max_by(|(len_a, a), (len_b, b)| len_a.cmp(len_b).then(b.id.cmp(&a.id)));

        match best {
            Some((_, zone)) => DeliveryQuote {
                fee: money(zone.fee),
                zone_name: zone.area_name.clone(),
                matched: true,
            },
            None => DeliveryQuote {
                fee: self.default_fee,
                zone_name: self.default_area.clone(),
                matched: false,
            },
        }
    }
}
