//! GATT UUID normalisation.
//!
//! Characteristic and service UUIDs arrive in three shapes: 16-bit short
//! form (`2A37`), 32-bit form (`00002a37`), and full 128-bit form with or
//! without dashes. The normal form used throughout the tool is the
//! lower-case 4-hex short form whenever the UUID is an alias of the
//! Bluetooth Base UUID, and lower-case dashless 128-bit hex otherwise.
//! Normalisation is idempotent.

use thiserror::Error;
use uuid::Uuid;

/// Suffix shared by every Bluetooth Base UUID alias.
const BASE_UUID_NODE: [u8; 8] = [0x80, 0x00, 0x00, 0x80, 0x5f, 0x9b, 0x34, 0xfb];

/// A UUID string that fits none of the accepted shapes.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid uuid: {0}")]
pub struct InvalidUuid(pub String);

/// Normalise a UUID string to its canonical form.
///
/// Accepts 4-hex, 8-hex, and 128-bit (dashed or dashless) inputs, with an
/// optional `0x` prefix on the short forms.
///
/// # Errors
///
/// Returns [`InvalidUuid`] if the input parses as none of the accepted
/// shapes.
///
/// # Example
///
/// ```
/// use bletty::gatt::uuid::normalize;
///
/// assert_eq!(normalize("2A37").unwrap(), "2a37");
/// assert_eq!(normalize("00002a37-0000-1000-8000-00805f9b34fb").unwrap(), "2a37");
/// assert_eq!(
///     normalize("6E400001-B5A3-F393-E0A9-E50E24DCCA9E").unwrap(),
///     "6e400001b5a3f393e0a9e50e24dcca9e"
/// );
/// ```
pub fn normalize(input: &str) -> Result<String, InvalidUuid> {
    let full = expand(input)?;
    Ok(match short_alias(&full) {
        Some(short) => format!("{short:04x}"),
        None => full.simple().to_string(),
    })
}

/// Expand any accepted UUID shape into a full 128-bit [`Uuid`].
///
/// # Errors
///
/// Returns [`InvalidUuid`] on unparseable input.
pub fn expand(input: &str) -> Result<Uuid, InvalidUuid> {
    let trimmed = input.trim();
    let hex = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    match hex.len() {
        4 => u16::from_str_radix(hex, 16)
            .map(|short| base_alias(u32::from(short)))
            .map_err(|_| InvalidUuid(input.to_string())),
        8 => u32::from_str_radix(hex, 16)
            .map(base_alias)
            .map_err(|_| InvalidUuid(input.to_string())),
        _ => Uuid::parse_str(hex).map_err(|_| InvalidUuid(input.to_string())),
    }
}

/// Whether two UUID strings refer to the same characteristic or service.
#[must_use]
pub fn matches(a: &str, b: &str) -> bool {
    match (expand(a), expand(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn base_alias(value: u32) -> Uuid {
    Uuid::from_fields(value, 0x0000, 0x1000, &BASE_UUID_NODE)
}

/// The 16-bit alias of `uuid`, if it sits inside the Bluetooth Base UUID
/// range.
fn short_alias(uuid: &Uuid) -> Option<u16> {
    let (value, mid, version, node) = uuid.as_fields();
    if mid == 0x0000 && version == 0x1000 && *node == BASE_UUID_NODE && value <= 0xffff {
        Some(value as u16)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_form_lowercases() {
        assert_eq!(normalize("2A37").unwrap(), "2a37");
        assert_eq!(normalize("0x2A37").unwrap(), "2a37");
    }

    #[test]
    fn test_32_bit_form_shortens_when_possible() {
        assert_eq!(normalize("00002a37").unwrap(), "2a37");
        // Values above 0xffff keep the long form.
        assert_eq!(
            normalize("00012a37").unwrap(),
            "00012a3700001000800000805f9b34fb"
        );
    }

    #[test]
    fn test_long_form_with_base_suffix_shortens() {
        assert_eq!(
            normalize("00002a37-0000-1000-8000-00805f9b34fb").unwrap(),
            "2a37"
        );
    }

    #[test]
    fn test_vendor_uuid_keeps_dashless_long_form() {
        assert_eq!(
            normalize("6E400001-B5A3-F393-E0A9-E50E24DCCA9E").unwrap(),
            "6e400001b5a3f393e0a9e50e24dcca9e"
        );
    }

    #[test]
    fn test_idempotent() {
        for input in ["2A37", "6E400001-B5A3-F393-E0A9-E50E24DCCA9E", "00002a38"] {
            let once = normalize(input).unwrap();
            assert_eq!(normalize(&once).unwrap(), once);
        }
    }

    #[test]
    fn test_equivalent_forms_normalize_identically() {
        let forms = [
            "2a37",
            "2A37",
            "00002a37",
            "00002a37-0000-1000-8000-00805f9b34fb",
            "00002A3700001000800000805F9B34FB",
        ]
        .map(|s| normalize(s).unwrap());
        assert!(forms.iter().all(|f| f == "2a37"));
    }

    #[test]
    fn test_invalid_inputs_rejected() {
        assert!(normalize("zz37").is_err());
        assert!(normalize("123").is_err());
        assert!(normalize("").is_err());
    }

    #[test]
    fn test_matches_across_forms() {
        assert!(matches("2a37", "00002A37-0000-1000-8000-00805F9B34FB"));
        assert!(!matches("2a37", "2a38"));
    }
}
