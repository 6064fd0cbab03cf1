//! Kubernetes resource quantity parsing
//!
//! PVC capacities are compared exactly, so quantities are parsed into
//! integer bytes rather than floats. Fractions round up.

use k8s_openapi::api::core::v1::PersistentVolumeClaim;

use crate::Error;

const BINARY_SUFFIXES: &[(&str, u32)] = &[
    ("Ki", 1),
    ("Mi", 2),
    ("Gi", 3),
    ("Ti", 4),
    ("Pi", 5),
    ("Ei", 6),
];

const DECIMAL_SUFFIXES: &[(&str, u32)] = &[
    ("k", 1),
    ("M", 2),
    ("G", 3),
    ("T", 4),
    ("P", 5),
    ("E", 6),
];

/// Parse a quantity such as `10Gi`, `1.5G`, `500m` or `1e3` into whole units.
pub fn parse_quantity(value: &str) -> Result<u128, Error> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::quantity(value, "empty quantity"));
    }

    let (number, multiplier, divisor) = split_suffix(trimmed)
        .ok_or_else(|| Error::quantity(value, "unknown suffix"))?;

    let (numerator, denominator) =
        parse_decimal(number).ok_or_else(|| Error::quantity(value, "invalid number"))?;

    let scaled = numerator
        .checked_mul(multiplier)
        .ok_or_else(|| Error::quantity(value, "quantity overflows"))?;
    let denominator = denominator
        .checked_mul(divisor)
        .ok_or_else(|| Error::quantity(value, "quantity overflows"))?;

    Ok(scaled.div_ceil(denominator))
}

/// Returns (number, multiplier, divisor)
fn split_suffix(value: &str) -> Option<(&str, u128, u128)> {
    for (suffix, power) in BINARY_SUFFIXES {
        if let Some(number) = value.strip_suffix(suffix) {
            return Some((number, 1024u128.pow(*power), 1));
        }
    }
    for (suffix, power) in DECIMAL_SUFFIXES {
        if let Some(number) = value.strip_suffix(suffix) {
            return Some((number, 1000u128.pow(*power), 1));
        }
    }
    if let Some(number) = value.strip_suffix('m') {
        return Some((number, 1, 1000));
    }
    if let Some((mantissa, exponent)) = value.split_once(['e', 'E']) {
        let exponent: u32 = exponent.parse().ok()?;
        return Some((mantissa, 10u128.checked_pow(exponent)?, 1));
    }
    if value.ends_with(|c: char| c.is_ascii_digit() || c == '.') {
        return Some((value, 1, 1));
    }
    None
}

/// Parse a non-negative decimal into numerator/denominator
fn parse_decimal(number: &str) -> Option<(u128, u128)> {
    let number = number.strip_prefix('+').unwrap_or(number);
    if number.is_empty() {
        return None;
    }
    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    if !whole.chars().chain(fraction.chars()).all(|c| c.is_ascii_digit()) {
        return None;
    }
    let digits = format!("{}{}", whole, fraction);
    let numerator: u128 = digits.parse().ok()?;
    let denominator = 10u128.checked_pow(fraction.len() as u32)?;
    Some((numerator, denominator))
}

/// Check that a string is a usable quantity (for config values)
pub fn validate_quantity(value: &str) -> Result<(), Error> {
    parse_quantity(value).map(|_| ())
}

/// Capacity of a PVC in bytes.
///
/// Bound claims report their real size in `status.capacity`; unbound
/// claims fall back to the requested size.
pub fn pvc_capacity_bytes(pvc: &PersistentVolumeClaim) -> Result<Option<u128>, Error> {
    let from_status = pvc
        .status
        .as_ref()
        .and_then(|s| s.capacity.as_ref())
        .and_then(|c| c.get("storage"));
    let from_spec = pvc
        .spec
        .as_ref()
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get("storage"));

    from_status
        .or(from_spec)
        .map(|q| parse_quantity(&q.0))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        PersistentVolumeClaimSpec, PersistentVolumeClaimStatus, VolumeResourceRequirements,
    };
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use std::collections::BTreeMap;

    #[test]
    fn binary_and_decimal_suffixes() {
        assert_eq!(parse_quantity("1Ki").unwrap(), 1024);
        assert_eq!(parse_quantity("10Gi").unwrap(), 10 * 1024 * 1024 * 1024);
        assert_eq!(parse_quantity("1G").unwrap(), 1_000_000_000);
        assert_eq!(parse_quantity("2k").unwrap(), 2000);
    }

    #[test]
    fn plain_numbers_and_exponents() {
        assert_eq!(parse_quantity("1048576").unwrap(), 1_048_576);
        assert_eq!(parse_quantity("1e3").unwrap(), 1000);
    }

    #[test]
    fn fractions_round_up() {
        assert_eq!(parse_quantity("1.5Ki").unwrap(), 1536);
        assert_eq!(parse_quantity("100m").unwrap(), 1);
        assert_eq!(parse_quantity("0.5").unwrap(), 1);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_quantity("").is_err());
        assert!(parse_quantity("ten").is_err());
        assert!(parse_quantity("10Qi").is_err());
        assert!(parse_quantity("-1Gi").is_err());
        assert!(validate_quantity("700Mi").is_ok());
    }

    fn pvc(spec_size: Option<&str>, status_size: Option<&str>) -> PersistentVolumeClaim {
        let requests = spec_size.map(|s| BTreeMap::from([("storage".to_string(), Quantity(s.to_string()))]));
        let capacity =
            status_size.map(|s| BTreeMap::from([("storage".to_string(), Quantity(s.to_string()))]));
        PersistentVolumeClaim {
            spec: Some(PersistentVolumeClaimSpec {
                resources: Some(VolumeResourceRequirements {
                    requests,
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: Some(PersistentVolumeClaimStatus {
                capacity,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn capacity_prefers_status_over_request() {
        let claim = pvc(Some("1Gi"), Some("2Gi"));
        assert_eq!(pvc_capacity_bytes(&claim).unwrap(), Some(2 * 1024 * 1024 * 1024));

        let claim = pvc(Some("1Gi"), None);
        assert_eq!(pvc_capacity_bytes(&claim).unwrap(), Some(1024 * 1024 * 1024));

        let claim = pvc(None, None);
        assert_eq!(pvc_capacity_bytes(&claim).unwrap(), None);
    }
}
