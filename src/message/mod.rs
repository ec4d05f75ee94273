//! Application payloads and their byte representation
//!
//! Payloads are either UTF-8 text or a structured JSON value. Decoding never
//! fails: bytes that are not valid UTF-8 come back as
//! [`Payload::Undecodable`] so dispatch can carry on.

use bytes::Bytes;
use serde::Serialize;

/// Content type attached to structured payloads
pub const CONTENT_TYPE_JSON: &str = "application/json";
/// Content type attached to text payloads
pub const CONTENT_TYPE_TEXT: &str = "text/plain; charset=utf-8";

/// Decoded application payload
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Structured(serde_json::Value),
    /// Raw bytes that could not be decoded as UTF-8
    Undecodable(Bytes),
}

impl Payload {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Structured(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_undecodable(&self) -> bool {
        matches!(self, Payload::Undecodable(_))
    }

    /// Content type used when the caller supplies none
    pub fn default_content_type(&self) -> Option<&'static str> {
        match self {
            Payload::Text(_) => Some(CONTENT_TYPE_TEXT),
            Payload::Structured(_) => Some(CONTENT_TYPE_JSON),
            Payload::Undecodable(_) => None,
        }
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Text(s.to_string())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Text(s)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(v: serde_json::Value) -> Self {
        Payload::Structured(v)
    }
}

/// Serialized form used by status output and the CLI
impl Serialize for Payload {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Payload::Text(s) => serializer.serialize_str(s),
            Payload::Structured(v) => v.serialize(serializer),
            Payload::Undecodable(b) => {
                serializer.serialize_str(&format!("<{} undecodable bytes>", b.len()))
            }
        }
    }
}

/// A message as it travels between the client and a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            content_type: None,
            correlation_id: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Per-publish options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
}

impl PublishOptions {
    pub fn correlated(correlation_id: impl Into<String>) -> Self {
        Self {
            content_type: None,
            correlation_id: Some(correlation_id.into()),
        }
    }
}

/// Stateless payload codec
pub struct MessageCodec;

impl MessageCodec {
    /// Encode a payload to bytes
    ///
    /// Text is copied verbatim, structured values become compact JSON and
    /// undecodable payloads pass their original bytes through.
    pub fn encode(payload: &Payload) -> Bytes {
        match payload {
            Payload::Text(s) => Bytes::copy_from_slice(s.as_bytes()),
            Payload::Structured(v) => Bytes::from(v.to_string()),
            Payload::Undecodable(b) => b.clone(),
        }
    }

    /// Decode bytes received with an optional content type
    ///
    /// JSON parsing is tried when the content type says JSON, or when no
    /// content type is given and the text looks like an object or array. A
    /// failed parse yields the text as-is.
    pub fn decode(bytes: &Bytes, content_type: Option<&str>) -> Payload {
        let text = match std::str::from_utf8(bytes) {
            Ok(text) => text,
            Err(_) => return Payload::Undecodable(bytes.clone()),
        };

        let try_json = match content_type {
            Some(ct) => is_json_content_type(ct),
            None => {
                let trimmed = text.trim_start();
                trimmed.starts_with('{') || trimmed.starts_with('[')
            }
        };

        if try_json {
            if let Ok(value) = serde_json::from_str(text) {
                return Payload::Structured(value);
            }
        }

        Payload::Text(text.to_string())
    }
}

/// `application/json`, ignoring case and parameters
fn is_json_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(|essence| essence.trim().eq_ignore_ascii_case(CONTENT_TYPE_JSON))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    fn round_trip(payload: &Payload) -> Payload {
        let bytes = MessageCodec::encode(payload);
        MessageCodec::decode(&bytes, payload.default_content_type())
    }

    #[test]
    fn test_structured_round_trip() {
        let payload = Payload::Structured(json!({
            "trainId": "12345",
            "origin": "Zürich HB",
            "delayMinutes": 4,
            "stops": ["Bern", "Thun"],
            "cancelled": false,
        }));
        assert_eq!(round_trip(&payload), payload);
    }

    #[test]
    fn test_structured_is_compact() {
        let bytes = MessageCodec::encode(&Payload::Structured(json!({"a": [1, 2]})));
        assert_eq!(&bytes[..], br#"{"a":[1,2]}"#);
    }

    #[test]
    fn test_text_that_looks_like_json_stays_text() {
        let payload = Payload::Text(r#"{"not":"parsed"}"#.to_string());
        assert_eq!(round_trip(&payload), payload);
    }

    #[test]
    fn test_sniffs_json_without_content_type() {
        let bytes = Bytes::from_static(b"  [1, 2, 3]");
        assert_eq!(MessageCodec::decode(&bytes, None), Payload::Structured(json!([1, 2, 3])));
    }

    #[test]
    fn test_bad_json_falls_back_to_text() {
        let bytes = Bytes::from_static(b"{truncated");
        assert_eq!(
            MessageCodec::decode(&bytes, Some("application/json")),
            Payload::Text("{truncated".to_string())
        );
    }

    #[test]
    fn test_json_content_type_with_parameters() {
        let bytes = Bytes::from_static(b"42");
        assert_eq!(
            MessageCodec::decode(&bytes, Some("Application/JSON; charset=utf-8")),
            Payload::Structured(json!(42))
        );
        assert_eq!(MessageCodec::decode(&bytes, None), Payload::Text("42".to_string()));
    }

    #[test]
    fn test_invalid_utf8_is_undecodable() {
        let bytes = Bytes::from_static(&[0xC3, 0x28, 0xFF]);
        let payload = MessageCodec::decode(&bytes, Some(CONTENT_TYPE_JSON));
        assert!(payload.is_undecodable());
        assert_eq!(MessageCodec::encode(&payload), bytes);
    }

    #[test]
    fn test_payload_serializes_for_display() {
        let text = serde_json::to_string(&Payload::from("hello")).unwrap();
        assert_eq!(text, r#""hello""#);
        let raw = serde_json::to_string(&Payload::Undecodable(Bytes::from_static(b"\xff")))
            .unwrap();
        assert_eq!(raw, r#""<1 undecodable bytes>""#);
    }

    proptest! {
        #[test]
        fn prop_text_round_trip(text in any::<String>()) {
            let payload = Payload::Text(text);
            prop_assert_eq!(round_trip(&payload), payload);
        }

        #[test]
        fn prop_flat_object_round_trip(
            entries in prop::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..8)
        ) {
            let value: serde_json::Map<String, serde_json::Value> = entries
                .into_iter()
                .map(|(k, v)| (k, json!(v)))
                .collect();
            let payload = Payload::Structured(serde_json::Value::Object(value));
            prop_assert_eq!(round_trip(&payload), payload);
        }
    }
}
