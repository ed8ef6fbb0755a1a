//! Streamer JSON Codec
//!
//! Encodes request batches and decodes inbound frames. Content entries are
//! split into their symbol key and the numbered field slots; the dispatcher
//! decides how slot numbers map onto schema indices.
//!
//! # Content Entry Format
//!
//! ```json
//! {"key": "AAPL", "delayed": false, "0": "101.5", "1": "101.7"}
//! ```
//!
//! Non-numeric keys other than `key` (`delayed`, `assetMainType`, `seq`)
//! are ignored.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::infrastructure::td::messages::{InboundFrame, RequestBatch, RequestEnvelope};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid message format.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// One content object split into key and numbered slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentEntry {
    /// Symbol the entry describes.
    pub key: String,
    /// Slot number to raw value.
    pub slots: BTreeMap<usize, Value>,
}

/// JSON codec for the streamer protocol.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Encode requests as one wire batch.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode_requests(&self, requests: Vec<RequestEnvelope>) -> Result<String, CodecError> {
        Ok(serde_json::to_string(&RequestBatch { requests })?)
    }

    /// Encode a single request as a wire batch.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode_request(&self, request: &RequestEnvelope) -> Result<String, CodecError> {
        self.encode_requests(vec![request.clone()])
    }

    /// Decode a request batch. Used by the loopback server side.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a request batch.
    pub fn decode_requests(&self, text: &str) -> Result<Vec<RequestEnvelope>, CodecError> {
        let batch: RequestBatch = serde_json::from_str(text)?;
        Ok(batch.requests)
    }

    /// Decode an inbound frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a JSON object or a section has
    /// the wrong shape.
    pub fn decode_frame(&self, text: &str) -> Result<InboundFrame, CodecError> {
        let trimmed = text.trim();
        if !trimmed.starts_with('{') {
            return Err(CodecError::InvalidFormat(format!(
                "expected JSON object, got: {}",
                trimmed.chars().take(50).collect::<String>()
            )));
        }
        Ok(serde_json::from_str(trimmed)?)
    }

    /// Encode an inbound frame. Used by the loopback server side.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode_frame(&self, frame: &InboundFrame) -> Result<String, CodecError> {
        Ok(serde_json::to_string(frame)?)
    }

    /// Split a content object into its key and numbered slots.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not an object or has no string or
    /// numeric `key`.
    pub fn parse_content(&self, value: &Value) -> Result<ContentEntry, CodecError> {
        let Value::Object(map) = value else {
            return Err(CodecError::InvalidFormat(
                "content entry is not an object".to_string(),
            ));
        };

        let key = match map.get("key") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(CodecError::InvalidFormat(
                    "content entry has no key".to_string(),
                ));
            }
        };

        let slots = map
            .iter()
            .filter_map(|(name, value)| Some((name.parse::<usize>().ok()?, value.clone())))
            .collect();

        Ok(ContentEntry { key, slots })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_frame_with_data() {
        let codec = JsonCodec::new();
        let frame = codec
            .decode_frame(
                r#"{"data":[{"service":"QUOTE","timestamp":1700000000000,"command":"SUBS",
                   "content":[{"key":"AAPL","0":"101.5","1":"101.7"}]}]}"#,
            )
            .unwrap();
        assert_eq!(frame.data.len(), 1);
        assert_eq!(frame.data[0].service, "QUOTE");
        assert_eq!(frame.data[0].content.len(), 1);
    }

    #[test]
    fn decode_frame_rejects_non_object() {
        let codec = JsonCodec::new();
        assert!(matches!(
            codec.decode_frame("[1,2,3]"),
            Err(CodecError::InvalidFormat(_))
        ));
        assert!(matches!(codec.decode_frame("{not json"), Err(CodecError::Json(_))));
    }

    #[test]
    fn parse_content_extracts_numbered_slots() {
        let codec = JsonCodec::new();
        let entry = codec
            .parse_content(&json!({"key": "AAPL", "delayed": false, "0": "1.5", "3": 7}))
            .unwrap();
        assert_eq!(entry.key, "AAPL");
        assert_eq!(entry.slots.len(), 2);
        assert_eq!(entry.slots[&0], json!("1.5"));
        assert_eq!(entry.slots[&3], json!(7));
    }

    #[test]
    fn parse_content_requires_key() {
        let codec = JsonCodec::new();
        assert!(codec.parse_content(&json!({"0": "1.5"})).is_err());
        assert!(codec.parse_content(&json!("AAPL")).is_err());
    }

    #[test]
    fn request_batch_round_trip() {
        let codec = JsonCodec::new();
        let request = RequestEnvelope {
            service: "ADMIN".into(),
            command: "LOGOUT".into(),
            request_id: "2".into(),
            account: "1".into(),
            source: "app".into(),
            parameters: BTreeMap::new(),
        };
        let text = codec.encode_request(&request).unwrap();
        assert!(text.starts_with(r#"{"requests":["#));
        assert_eq!(codec.decode_requests(&text).unwrap(), vec![request]);
    }
}
