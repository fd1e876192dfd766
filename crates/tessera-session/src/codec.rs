//! Versioned session record format shared by every store backend.
//!
//! Records are JSON objects whose fields appear in a fixed order:
//! `version`, `creation_time`, `last_accessed_time`, `max_inactive_interval`,
//! `is_new`, `is_valid`, `this_accessed_time`, `id`, `attribute_count`,
//! `attributes`. Timestamps are milliseconds since the Unix epoch. Each
//! attribute value carries a `kind` discriminator; values that could not be
//! encoded are written as `{"kind": "not_serializable"}` and skipped on read.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::session::Session;

/// Current record format version.
pub const RECORD_VERSION: u32 = 1;

/// Persisted form of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub version: u32,
    pub creation_time: i64,
    pub last_accessed_time: i64,
    /// Seconds; negative means never.
    pub max_inactive_interval: i32,
    pub is_new: bool,
    pub is_valid: bool,
    pub this_accessed_time: i64,
    pub id: String,
    pub attribute_count: i32,
    pub attributes: Vec<StoredAttribute>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredAttribute {
    pub name: String,
    pub value: StoredValue,
}

/// Encoded attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoredValue {
    /// Plain data.
    Data { value: serde_json::Value },
    /// A custom object, decoded through the context's resolver.
    Object {
        tag: String,
        payload: serde_json::Value,
    },
    /// Placeholder for a value that could not be encoded.
    NotSerializable,
}

/// Encode the persistent state of `session`.
pub fn encode(session: &Session) -> Result<Vec<u8>> {
    encode_record(&session.to_record())
}

pub fn encode_record(record: &SessionRecord) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(record)?)
}

/// Decode and validate a record read for `id`.
pub fn decode(id: &str, bytes: &[u8]) -> Result<SessionRecord> {
    let record: SessionRecord =
        serde_json::from_slice(bytes).map_err(|e| Error::deserialization(id, e))?;
    if record.version != RECORD_VERSION {
        return Err(Error::deserialization(
            id,
            format!("unsupported record version {}", record.version),
        ));
    }
    if usize::try_from(record.attribute_count).ok() != Some(record.attributes.len()) {
        return Err(Error::deserialization(
            id,
            format!(
                "attribute count {} does not match {} attributes",
                record.attribute_count,
                record.attributes.len()
            ),
        ));
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> SessionRecord {
        SessionRecord {
            version: RECORD_VERSION,
            creation_time: 1_700_000_000_000,
            last_accessed_time: 1_700_000_001_000,
            max_inactive_interval: 1800,
            is_new: false,
            is_valid: true,
            this_accessed_time: 1_700_000_002_000,
            id: "ABC".to_string(),
            attribute_count: 2,
            attributes: vec![
                StoredAttribute {
                    name: "count".to_string(),
                    value: StoredValue::Data { value: json!(1) },
                },
                StoredAttribute {
                    name: "socket".to_string(),
                    value: StoredValue::NotSerializable,
                },
            ],
        }
    }

    #[test]
    fn test_field_order_and_sentinel() {
        let bytes = encode_record(&record()).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let positions: Vec<usize> = [
            "\"version\"",
            "\"creation_time\"",
            "\"last_accessed_time\"",
            "\"max_inactive_interval\"",
            "\"is_new\"",
            "\"is_valid\"",
            "\"this_accessed_time\"",
            "\"id\"",
            "\"attribute_count\"",
            "\"attributes\"",
        ]
        .iter()
        .map(|field| text.find(field).unwrap())
        .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert!(text.contains(r#"{"kind":"not_serializable"}"#));
    }

    #[test]
    fn test_decode_accepts_encoded_record() {
        let bytes = encode_record(&record()).unwrap();
        assert_eq!(decode("ABC", &bytes).unwrap(), record());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = decode("ABC", b"not a record").unwrap_err();
        assert!(matches!(err, Error::Deserialization { id, .. } if id == "ABC"));
    }

    #[test]
    fn test_decode_rejects_other_versions() {
        let mut future = record();
        future.version = 2;
        let bytes = encode_record(&future).unwrap();
        assert!(matches!(decode("ABC", &bytes), Err(Error::Deserialization { .. })));
    }

    #[test]
    fn test_decode_rejects_count_mismatch() {
        let mut short = record();
        short.attribute_count = 5;
        let bytes = encode_record(&short).unwrap();
        assert!(matches!(decode("ABC", &bytes), Err(Error::Deserialization { .. })));
    }
}
