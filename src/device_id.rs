//! Device ids derived from the identity a CPE reports in its Inform.
//!
//! The id doubles as the document key of the device record and as the lock
//! name that serializes sessions for that device.

use std::fmt::Write;

use serde::Deserialize;
use serde::Serialize;

/// Identity fields from the Inform `DeviceId` structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceIdentity {
    #[serde(rename = "OUI")]
    pub oui: String,
    #[serde(default)]
    pub product_class: Option<String>,
    pub serial_number: String,
}

/// Build the globally unique device id.
///
/// `OUI-ProductClass-SerialNumber`, or `OUI-SerialNumber` without a product
/// class. A non-empty `alternative_serial` replaces the reported serial after
/// stripping every character outside `[A-Za-z0-9_]`.
pub fn generate_device_id(identity: &DeviceIdentity, alternative_serial: &str) -> String {
    let serial = if alternative_serial.is_empty() {
        identity.serial_number.clone()
    } else {
        alternative_serial.chars().filter(|&ch| is_plain(ch)).collect()
    };

    match identity.product_class.as_deref().filter(|class| !class.is_empty()) {
        Some(class) => format!("{}-{}-{}", escape(&identity.oui), escape(class), escape(&serial)),
        None => format!("{}-{}", escape(&identity.oui), escape(&serial)),
    }
}

fn is_plain(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_'
}

/// Percent-encode every UTF-8 byte of characters outside `[A-Za-z0-9_]`.
fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut buf = [0u8; 4];
    for ch in input.chars() {
        if is_plain(ch) {
            out.push(ch);
            continue;
        }
        for byte in ch.encode_utf8(&mut buf).bytes() {
            // Writing to a String cannot fail.
            let _ = write!(out, "%{byte:02X}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(product_class: Option<&str>, serial: &str) -> DeviceIdentity {
        DeviceIdentity {
            oui: "0011AA".into(),
            product_class: product_class.map(str::to_string),
            serial_number: serial.into(),
        }
    }

    #[test]
    fn test_with_product_class() {
        assert_eq!(generate_device_id(&identity(Some("Router"), "SN1"), ""), "0011AA-Router-SN1");
    }

    #[test]
    fn test_without_product_class() {
        assert_eq!(generate_device_id(&identity(None, "SN1"), ""), "0011AA-SN1");
        assert_eq!(generate_device_id(&identity(Some(""), "SN1"), ""), "0011AA-SN1");
    }

    #[test]
    fn test_escapes_reserved_characters() {
        assert_eq!(generate_device_id(&identity(Some("Home Router"), "A-1"), ""), "0011AA-Home%20Router-A%2D1");
        assert_eq!(generate_device_id(&identity(None, "é"), ""), "0011AA-%C3%A9");
    }

    #[test]
    fn test_alternative_serial_is_stripped() {
        assert_eq!(generate_device_id(&identity(None, "SN1"), "AB:CD-12"), "0011AA-ABCD12");
    }

    #[test]
    fn test_identity_deserializes_from_inform_fields() {
        let identity: DeviceIdentity =
            serde_json::from_str(r#"{"OUI": "0011AA", "ProductClass": "Router", "SerialNumber": "SN1"}"#).unwrap();
        assert_eq!(identity.oui, "0011AA");
        assert_eq!(identity.product_class.as_deref(), Some("Router"));
        assert_eq!(identity.serial_number, "SN1");
    }
}
