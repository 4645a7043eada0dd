use chrono::{DateTime, Utc};

use relay_protocol::Fields;

use crate::{StreamId, StreamTransport, TransportError};

const PREFIX: &str = "dead_letter.";

/// A poison entry moved aside after too many failed deliveries.
///
/// On the wire the original fields are kept as-is and the metadata is added
/// under `dead_letter.*` keys, so operators can replay the payload verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub source_stream: String,
    pub original_id: StreamId,
    pub group: String,
    pub reason: String,
    pub delivery_count: u32,
    pub failed_at: DateTime<Utc>,
    pub payload: Fields,
}

impl DeadLetter {
    pub fn new(
        source_stream: impl Into<String>,
        group: impl Into<String>,
        original_id: StreamId,
        delivery_count: u32,
        reason: impl Into<String>,
        payload: Fields,
    ) -> Self {
        Self {
            source_stream: source_stream.into(),
            original_id,
            group: group.into(),
            reason: reason.into(),
            delivery_count,
            failed_at: Utc::now(),
            payload,
        }
    }

    pub fn to_fields(&self) -> Fields {
        let mut fields = self.payload.clone();
        let meta = [
            ("source_stream", self.source_stream.clone()),
            ("original_id", self.original_id.to_string()),
            ("group", self.group.clone()),
            ("reason", self.reason.clone()),
            ("delivery_count", self.delivery_count.to_string()),
            ("failed_at", self.failed_at.to_rfc3339()),
        ];
        for (key, value) in meta {
            fields.insert(format!("{PREFIX}{key}"), value);
        }
        fields
    }

    pub fn from_fields(fields: &Fields) -> Result<Self, TransportError> {
        let meta = |key: &str| {
            fields
                .get(&format!("{PREFIX}{key}"))
                .cloned()
                .ok_or_else(|| TransportError::MalformedEntry(format!("missing {PREFIX}{key}")))
        };

        let delivery_count = meta("delivery_count")?
            .parse()
            .map_err(|_| TransportError::MalformedEntry("bad delivery_count".into()))?;
        let failed_at = DateTime::parse_from_rfc3339(&meta("failed_at")?)
            .map_err(|e| TransportError::MalformedEntry(format!("bad failed_at: {e}")))?
            .with_timezone(&Utc);

        Ok(Self {
            source_stream: meta("source_stream")?,
            original_id: meta("original_id")?.parse()?,
            group: meta("group")?,
            reason: meta("reason")?,
            delivery_count,
            failed_at,
            payload: fields
                .iter()
                .filter(|(k, _)| !k.starts_with(PREFIX))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        })
    }

    /// Append this dead letter to `stream`.
    pub async fn redirect(
        &self,
        transport: &dyn StreamTransport,
        stream: &str,
        max_len: Option<usize>,
    ) -> Result<StreamId, TransportError> {
        let id = transport.append(stream, self.to_fields(), max_len).await?;
        tracing::error!(
            source = %self.source_stream,
            original_id = %self.original_id,
            dead_letter_id = %id,
            deliveries = self.delivery_count,
            reason = %self.reason,
            "Moved poison entry to dead-letter stream"
        );
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_is_namespaced_and_payload_preserved() {
        let mut payload = Fields::new();
        payload.insert("id".into(), "\"t-1\"".into());
        payload.insert("priority".into(), "not-a-number".into());

        let letter = DeadLetter::new(
            "bear:commands",
            "bear-workers",
            StreamId::new(10, 2),
            4,
            "envelope failed validation",
            payload.clone(),
        );
        let fields = letter.to_fields();
        assert_eq!(fields.get("priority").map(String::as_str), Some("not-a-number"));
        assert_eq!(
            fields.get("dead_letter.original_id").map(String::as_str),
            Some("10-2")
        );

        let parsed = DeadLetter::from_fields(&fields).unwrap();
        assert_eq!(parsed.payload, payload);
        assert_eq!(parsed.delivery_count, 4);
        assert_eq!(parsed.group, "bear-workers");
    }

    #[test]
    fn test_missing_metadata_is_malformed() {
        let err = DeadLetter::from_fields(&Fields::new()).unwrap_err();
        assert!(matches!(err, TransportError::MalformedEntry(_)));
    }
}
