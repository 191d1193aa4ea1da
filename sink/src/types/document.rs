//! Persisted message document
//!
//! A document is a flat JSON object: every normalized header name maps to its
//! value, followed by the fixed fields below. Fixed fields are written after
//! the headers, so a header that normalizes onto a fixed field name loses.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::error::{Result, SinkError};
use super::received::ReceivedMail;

pub const FIELD_ENVELOPE_SENDER: &str = "envelopeSender";
pub const FIELD_ENVELOPE_RECEIVER: &str = "envelopeReceiver";
pub const FIELD_BODY: &str = "body";
pub const FIELD_BYTES64: &str = "bytes64";
pub const FIELD_SEQUENCE_NUMBER: &str = "sequenceNumber";

const RESERVED_FIELDS: [&str; 5] = [
    FIELD_ENVELOPE_SENDER,
    FIELD_ENVELOPE_RECEIVER,
    FIELD_BODY,
    FIELD_BYTES64,
    FIELD_SEQUENCE_NUMBER,
];

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageDocument {
    /// Normalized header name -> value. Duplicate headers keep the last value.
    pub headers: BTreeMap<String, String>,
    pub envelope_sender: String,
    pub envelope_receiver: String,
    /// Decoded textual content; `None` when body extraction failed.
    pub body: Option<String>,
    /// Standard base64 of the full raw payload.
    pub bytes64: String,
    pub sequence_number: i64,
}

impl MessageDocument {
    pub fn to_json(&self) -> Map<String, Value> {
        let mut map = Map::new();
        for (name, value) in &self.headers {
            map.insert(name.clone(), Value::String(value.clone()));
        }
        if let Some(body) = &self.body {
            map.insert(FIELD_BODY.into(), Value::String(body.clone()));
        }
        map.insert(
            FIELD_ENVELOPE_SENDER.into(),
            Value::String(self.envelope_sender.clone()),
        );
        map.insert(
            FIELD_ENVELOPE_RECEIVER.into(),
            Value::String(self.envelope_receiver.clone()),
        );
        map.insert(FIELD_BYTES64.into(), Value::String(self.bytes64.clone()));
        map.insert(
            FIELD_SEQUENCE_NUMBER.into(),
            Value::from(self.sequence_number),
        );
        map
    }

    pub fn from_json(mut map: Map<String, Value>) -> Result<Self> {
        let sequence_number = map
            .remove(FIELD_SEQUENCE_NUMBER)
            .and_then(|v| v.as_i64())
            .ok_or_else(|| SinkError::Decode(format!("missing {}", FIELD_SEQUENCE_NUMBER)))?;
        let envelope_sender = take_string(&mut map, FIELD_ENVELOPE_SENDER).unwrap_or_default();
        let envelope_receiver = take_string(&mut map, FIELD_ENVELOPE_RECEIVER).unwrap_or_default();
        let bytes64 = take_string(&mut map, FIELD_BYTES64).unwrap_or_default();
        let body = take_string(&mut map, FIELD_BODY);

        let headers = map
            .into_iter()
            .filter(|(name, _)| !RESERVED_FIELDS.contains(&name.as_str()))
            .filter_map(|(name, value)| match value {
                Value::String(s) => Some((name, s)),
                _ => None,
            })
            .collect();

        Ok(Self {
            headers,
            envelope_sender,
            envelope_receiver,
            body,
            bytes64,
            sequence_number,
        })
    }

    /// Text value of a persisted field, header or fixed.
    pub fn field(&self, name: &str) -> Option<&str> {
        match name {
            FIELD_ENVELOPE_SENDER => Some(&self.envelope_sender),
            FIELD_ENVELOPE_RECEIVER => Some(&self.envelope_receiver),
            FIELD_BODY => self.body.as_deref(),
            FIELD_BYTES64 => Some(&self.bytes64),
            _ => self.headers.get(name).map(String::as_str),
        }
    }

    pub fn decode_raw(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(self.bytes64.as_bytes())
            .map_err(|e| SinkError::Decode(format!("invalid bytes64: {}", e)))
    }

    /// Rebuilds the in-memory handle this document was mapped from.
    pub fn to_received_mail(&self) -> Result<ReceivedMail> {
        Ok(ReceivedMail::new(
            self.envelope_sender.clone(),
            self.envelope_receiver.clone(),
            self.decode_raw()?,
        ))
    }
}

fn take_string(map: &mut Map<String, Value>, key: &str) -> Option<String> {
    match map.remove(key) {
        Some(Value::String(s)) => Some(s),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MessageDocument {
        let mut headers = BTreeMap::new();
        headers.insert("subject".to_string(), "barf".to_string());
        headers.insert("contenttype".to_string(), "text/plain".to_string());
        MessageDocument {
            headers,
            envelope_sender: "someone@somewhereelse.com".into(),
            envelope_receiver: "anyone@anywhere.com".into(),
            body: Some("body".into()),
            bytes64: BASE64.encode(b"Subject: barf\r\n\r\nbody"),
            sequence_number: 7,
        }
    }

    #[test]
    fn test_json_shape_uses_fixed_field_names() {
        let json = sample().to_json();
        assert_eq!(json["subject"], "barf");
        assert_eq!(json["envelopeSender"], "someone@somewhereelse.com");
        assert_eq!(json["envelopeReceiver"], "anyone@anywhere.com");
        assert_eq!(json["body"], "body");
        assert_eq!(json["sequenceNumber"], 7);
        assert!(json.contains_key("bytes64"));
    }

    #[test]
    fn test_fixed_fields_win_over_colliding_header() {
        let mut doc = sample();
        doc.headers.insert("body".into(), "from a header".into());
        let json = doc.to_json();
        assert_eq!(json["body"], "body");

        let back = MessageDocument::from_json(json).unwrap();
        assert!(!back.headers.contains_key("body"));
        assert_eq!(back.body.as_deref(), Some("body"));
    }

    #[test]
    fn test_from_json_requires_sequence_number() {
        let mut json = sample().to_json();
        json.remove("sequenceNumber");
        assert!(matches!(
            MessageDocument::from_json(json),
            Err(SinkError::Decode(_))
        ));
    }

    #[test]
    fn test_rebuilds_received_mail() {
        let mail = sample().to_received_mail().unwrap();
        assert_eq!(mail.envelope_receiver(), "anyone@anywhere.com");
        assert_eq!(mail.data(), b"Subject: barf\r\n\r\nbody");
        assert_eq!(mail.subject().as_deref(), Some("barf"));
    }

    #[test]
    fn test_field_lookup() {
        let doc = sample();
        assert_eq!(doc.field("subject"), Some("barf"));
        assert_eq!(doc.field("envelopeSender"), Some("someone@somewhereelse.com"));
        assert_eq!(doc.field("missing"), None);
    }
}
