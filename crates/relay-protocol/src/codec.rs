//! Flat key-value wire codec.
//!
//! Stream entries carry a flat map of UTF-8 text fields. Each top-level
//! field of a message is stored as its JSON encoding, so strings, numbers,
//! lists, maps and RFC 3339 timestamps all survive the trip unchanged.
//! Absent optional fields are omitted rather than written as `null`.
//!
//! Decoding tolerates unknown fields (forward compatibility) and raw,
//! non-JSON text values written by foreign producers, which are read back
//! as plain strings. A raw value that happens to be valid JSON (`42`,
//! `true`, `null`) parses as that JSON type, unless the decoder names the
//! field as text; see [`decode_with_text`].

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::{ProtocolError, ValidationError};

/// Field map of a single stream entry.
pub type Fields = BTreeMap<String, String>;

/// Flatten a message into stream fields.
pub fn encode<T: Serialize>(message: &T) -> Result<Fields, ProtocolError> {
    let Value::Object(map) = serde_json::to_value(message)? else {
        return Err(ProtocolError::Serialization(
            "only struct-like messages can be flattened into stream fields".into(),
        ));
    };

    let mut fields = Fields::new();
    for (key, value) in map {
        if value.is_null() {
            continue;
        }
        fields.insert(key, serde_json::to_string(&value)?);
    }
    Ok(fields)
}

/// Rebuild a message from stream fields.
///
/// Missing required fields surface as `ValidationError::MissingField`; any
/// other shape mismatch as `ValidationError::Malformed`.
pub fn decode<T: DeserializeOwned>(fields: &Fields) -> Result<T, ValidationError> {
    decode_with_text(fields, &[])
}

/// Like [`decode`], but the fields named in `text` always decode as
/// strings: a raw value such as `42` or `null` is kept as written instead
/// of changing type.
pub fn decode_with_text<T: DeserializeOwned>(
    fields: &Fields,
    text: &[&str],
) -> Result<T, ValidationError> {
    let map = fields
        .iter()
        .map(|(k, raw)| {
            let value = if text.contains(&k.as_str()) {
                parse_text(raw)
            } else {
                parse_field(raw)
            };
            (k.clone(), value)
        })
        .collect();
    serde_json::from_value(Value::Object(map)).map_err(classify_serde_error)
}

/// Read a single field as JSON, falling back to a plain string.
pub fn field_value(fields: &Fields, key: &str) -> Option<Value> {
    fields.get(key).map(|raw| parse_field(raw))
}

fn parse_field(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_text(raw: &str) -> Value {
    match serde_json::from_str(raw) {
        Ok(Value::String(s)) => Value::String(s),
        _ => Value::String(raw.to_string()),
    }
}

fn classify_serde_error(e: serde_json::Error) -> ValidationError {
    let msg = e.to_string();
    if let Some(rest) = msg.strip_prefix("missing field `") {
        if let Some(name) = rest.split('`').next() {
            return ValidationError::MissingField(name.to_string());
        }
    }
    ValidationError::Malformed(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        count: u32,
        tags: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    }

    #[test]
    fn test_encode_skips_absent_optionals() {
        let fields = encode(&Sample {
            name: "a".into(),
            count: 2,
            tags: vec!["x".into()],
            note: None,
        })
        .unwrap();
        assert_eq!(fields.get("name").map(String::as_str), Some("\"a\""));
        assert_eq!(fields.get("count").map(String::as_str), Some("2"));
        assert_eq!(fields.get("tags").map(String::as_str), Some("[\"x\"]"));
        assert!(!fields.contains_key("note"));
    }

    #[test]
    fn test_decode_accepts_raw_strings() {
        let mut fields = Fields::new();
        fields.insert("name".into(), "plain text".into());
        fields.insert("count".into(), "7".into());
        fields.insert("tags".into(), "[]".into());
        let sample: Sample = decode(&fields).unwrap();
        assert_eq!(sample.name, "plain text");
        assert_eq!(sample.count, 7);
    }

    #[test]
    fn test_text_fields_keep_json_lookalikes_as_written() {
        let mut fields = Fields::new();
        fields.insert("name".into(), "42".into());
        fields.insert("count".into(), "7".into());
        fields.insert("tags".into(), "[]".into());
        fields.insert("note".into(), "1.50".into());
        assert!(decode::<Sample>(&fields).is_err());

        let sample: Sample = decode_with_text(&fields, &["name", "note"]).unwrap();
        assert_eq!(sample.name, "42");
        assert_eq!(sample.note.as_deref(), Some("1.50"));
        assert_eq!(sample.count, 7);

        fields.insert("name".into(), "\"quoted\"".into());
        fields.insert("note".into(), "null".into());
        let sample: Sample = decode_with_text(&fields, &["name", "note"]).unwrap();
        assert_eq!(sample.name, "quoted");
        assert_eq!(sample.note.as_deref(), Some("null"));
    }

    #[test]
    fn test_decode_reports_missing_field() {
        let mut fields = Fields::new();
        fields.insert("name".into(), "\"a\"".into());
        fields.insert("tags".into(), "[]".into());
        let err = decode::<Sample>(&fields).unwrap_err();
        assert_eq!(err, ValidationError::MissingField("count".into()));
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let mut fields = Fields::new();
        fields.insert("name".into(), "\"a\"".into());
        fields.insert("count".into(), "1".into());
        fields.insert("tags".into(), "[]".into());
        fields.insert("added_in_v2".into(), "{\"k\":1}".into());
        assert!(decode::<Sample>(&fields).is_ok());
    }
}
