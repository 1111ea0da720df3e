//! Price-update events and their wire encoding.
//!
//! Payloads are compact JSON over UTF-8 with the field names `Product` and
//! `UpdatedPrice`. The price is written as a JSON number that keeps its
//! decimal scale, so `100.00` is encoded as `100.00` and not `100.0`:
//!
//! ```rust
//! use price_pipeline::codec::{self, PriceUpdate};
//! use rust_decimal::Decimal;
//!
//! let event = PriceUpdate::new("ABC", Decimal::new(10000, 2));
//! let payload = codec::encode(&event);
//! assert_eq!(&payload[..], br#"{"Product":"ABC","UpdatedPrice":100.00}"#);
//! assert_eq!(codec::decode(&payload).unwrap(), event);
//! ```

use crate::error::DecodeError;
use bytes::Bytes;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A product's new price, as published by the admin side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PriceUpdate {
    #[serde(rename = "Product")]
    product_name: String,
    #[serde(rename = "UpdatedPrice", with = "price")]
    updated_price: Decimal,
}

impl PriceUpdate {
    pub fn new(product_name: impl Into<String>, updated_price: Decimal) -> Self {
        Self {
            product_name: product_name.into(),
            updated_price,
        }
    }

    pub fn product_name(&self) -> &str {
        &self.product_name
    }

    pub fn updated_price(&self) -> Decimal {
        self.updated_price
    }
}

impl fmt::Display for PriceUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.product_name, self.updated_price)
    }
}

/// Encodes an event into its payload bytes.
pub fn encode(event: &PriceUpdate) -> Bytes {
    // A string field and a decimal rendered as a JSON number cannot fail to serialize.
    let json = serde_json::to_vec(event).expect("price update always serializes");
    Bytes::from(json)
}

/// Decodes a payload produced by [`encode`].
///
/// Only a JSON object is accepted; the array form serde would otherwise
/// take for a struct is not codec output.
pub fn decode(payload: &[u8]) -> Result<PriceUpdate, DecodeError> {
    let first = payload.iter().find(|&&b| !matches!(b, b' ' | b'\t' | b'\n' | b'\r'));
    if first != Some(&b'{') {
        return Err(DecodeError::new("payload is not a JSON object"));
    }

    serde_json::from_slice(payload).map_err(|e| DecodeError::new(e.to_string()))
}

mod price {
    use rust_decimal::Decimal;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(price: &Decimal, serializer: S) -> Result<S::Ok, S::Error> {
        rust_decimal::serde::arbitrary_precision::serialize(price, serializer)
    }

    /// Only JSON numbers are accepted; the literal text is parsed so the scale survives.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Decimal, D::Error> {
        let number = serde_json::Number::deserialize(deserializer)?;
        let text = number.to_string();

        text.parse::<Decimal>()
            .or_else(|_| Decimal::from_scientific(&text))
            .map_err(|e| D::Error::custom(format!("UpdatedPrice '{}' is not a decimal: {}", text, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn price(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_encode_uses_wire_field_names() {
        let event = PriceUpdate::new("ABC", price("100.00"));
        let payload = encode(&event);

        assert_eq!(
            std::str::from_utf8(&payload).unwrap(),
            r#"{"Product":"ABC","UpdatedPrice":100.00}"#
        );
    }

    #[test]
    fn test_encode_is_deterministic() {
        let event = PriceUpdate::new("Widget", price("19.99"));
        assert_eq!(encode(&event), encode(&event.clone()));
    }

    #[test]
    fn test_round_trip_preserves_event() {
        let events = [
            PriceUpdate::new("ABC", price("100.00")),
            PriceUpdate::new("", price("0")),
            PriceUpdate::new("Crème brûlée \"deluxe\"", price("-3.5")),
            PriceUpdate::new("bulk", price("123456789012345678.000001")),
        ];

        for event in events {
            let decoded = decode(&encode(&event)).unwrap();
            assert_eq!(decoded, event);
            assert_eq!(
                decoded.updated_price().scale(),
                event.updated_price().scale()
            );
        }
    }

    #[test]
    fn test_decode_accepts_plain_and_scientific_numbers() {
        let event = decode(br#"{"Product":"ABC","UpdatedPrice":100}"#).unwrap();
        assert_eq!(event.updated_price(), price("100"));

        let event = decode(br#"{"UpdatedPrice":1.5e2,"Product":"ABC"}"#).unwrap();
        assert_eq!(event.updated_price(), price("150"));
    }

    #[test]
    fn test_decode_rejects_malformed_structure() {
        assert!(decode(b"not json").is_err());
        assert!(decode(b"").is_err());
        assert!(decode(br#"["ABC", 100]"#).is_err());
    }

    #[test]
    fn test_decode_accepts_only_objects() {
        let err = decode(b"  [\"ABC\", 100.00]").unwrap_err();
        assert!(err.message().contains("JSON object"));
        assert!(decode(br#""ABC""#).is_err());
        assert!(decode(b"100.00").is_err());

        let event = decode(b"\n  {\"Product\":\"ABC\",\"UpdatedPrice\":1.00}").unwrap();
        assert_eq!(event.product_name(), "ABC");
    }

    #[test]
    fn test_decode_rejects_missing_fields() {
        let err = decode(br#"{"Product":"ABC"}"#).unwrap_err();
        assert!(err.message().contains("UpdatedPrice"));

        let err = decode(br#"{"UpdatedPrice":1.0}"#).unwrap_err();
        assert!(err.message().contains("Product"));
    }

    #[test]
    fn test_decode_rejects_non_numeric_price() {
        assert!(decode(br#"{"Product":"ABC","UpdatedPrice":"100.00"}"#).is_err());
        assert!(decode(br#"{"Product":"ABC","UpdatedPrice":null}"#).is_err());
        assert!(decode(br#"{"Product":"ABC","UpdatedPrice":true}"#).is_err());
    }
}
