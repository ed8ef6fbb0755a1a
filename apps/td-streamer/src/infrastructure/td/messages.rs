//! Streamer Wire Message Types
//!
//! Serde types for the streamer's JSON envelopes.
//!
//! # Outbound
//!
//! Every request is wrapped in a batch:
//!
//! ```json
//! {"requests":[{"service":"QUOTE","command":"SUBS","requestid":"1",
//!   "account":"123456789","source":"app1",
//!   "parameters":{"keys":"AAPL,MSFT","fields":"0,1,2"}}]}
//! ```
//!
//! Request ids and parameter values are always strings.
//!
//! # Inbound
//!
//! An inbound frame is an object with any of four arrays:
//!
//! - `response`: `{service, command, requestid, content: {code, msg}}`
//! - `data`: `{service, timestamp, command, content: [{key, "0": .., "1": ..}]}`
//! - `snapshot`: same shape as `data`
//! - `notify`: `{heartbeat: "<ms>"}` or administrative notices

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Outbound
// =============================================================================

/// A single correlated request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Service wire name (`ADMIN` for session commands).
    pub service: String,
    /// Command (`LOGIN`, `SUBS`, `ADD`, `UNSUBS`, `QOS`, `LOGOUT`).
    pub command: String,
    /// Request id, decimal string.
    #[serde(rename = "requestid")]
    pub request_id: String,
    /// Account the session is bound to.
    pub account: String,
    /// Streamer application id.
    pub source: String,
    /// Command parameters.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl RequestEnvelope {
    /// Numeric request id.
    #[must_use]
    pub fn id(&self) -> Option<u64> {
        self.request_id.parse().ok()
    }

    /// Get a parameter.
    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }
}

/// Batch wrapper sent on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestBatch {
    /// Requests in transmission order.
    pub requests: Vec<RequestEnvelope>,
}

// =============================================================================
// Inbound
// =============================================================================

/// One decoded inbound frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InboundFrame {
    /// Responses to requests.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response: Vec<ResponseEntry>,
    /// Streaming data.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<DataEntry>,
    /// Heartbeats and notices.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notify: Vec<NotifyEntry>,
    /// Snapshot data, same shape as `data`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snapshot: Vec<DataEntry>,
}

impl InboundFrame {
    /// Whether the frame carried nothing recognizable.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.response.is_empty()
            && self.data.is_empty()
            && self.notify.is_empty()
            && self.snapshot.is_empty()
    }
}

/// Response to a correlated request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEntry {
    /// Service of the original request.
    pub service: String,
    /// Command of the original request.
    pub command: String,
    /// Request id; servers send either a string or a number.
    #[serde(rename = "requestid")]
    pub request_id: Value,
    /// Server time in epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// Result code and message.
    pub content: ResponseContent,
}

impl ResponseEntry {
    /// Request id as a number, if it parses.
    #[must_use]
    pub fn id(&self) -> Option<u64> {
        match &self.request_id {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Request id as text, for diagnostics.
    #[must_use]
    pub fn id_text(&self) -> String {
        match &self.request_id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Response result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseContent {
    /// Zero means success.
    pub code: i64,
    /// Human-readable message.
    #[serde(default)]
    pub msg: String,
}

impl ResponseContent {
    /// Whether the request succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code == 0
    }
}

/// Data or snapshot entry for one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataEntry {
    /// Service wire name.
    pub service: String,
    /// Server time in epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// Command that produced the data (usually `SUBS`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Content objects, one per symbol. Kept raw so a single bad entry
    /// does not invalidate the frame.
    #[serde(default)]
    pub content: Vec<Value>,
}

/// Heartbeat or administrative notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyEntry {
    /// Heartbeat timestamp in epoch milliseconds, as a string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<String>,
    /// Service the notice concerns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Notice payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

impl NotifyEntry {
    /// Whether this is a heartbeat.
    #[must_use]
    pub const fn is_heartbeat(&self) -> bool {
        self.heartbeat.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_envelope_uses_wire_names() {
        let envelope = RequestEnvelope {
            service: "QUOTE".into(),
            command: "SUBS".into(),
            request_id: "7".into(),
            account: "123".into(),
            source: "app".into(),
            parameters: BTreeMap::from([("keys".into(), "AAPL".into())]),
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["requestid"], json!("7"));
        assert_eq!(value["parameters"]["keys"], json!("AAPL"));
        assert_eq!(envelope.id(), Some(7));
    }

    #[test]
    fn response_id_accepts_string_or_number() {
        let entry: ResponseEntry = serde_json::from_value(json!({
            "service": "ADMIN", "command": "LOGIN", "requestid": "3",
            "content": {"code": 0, "msg": "ok"}
        }))
        .unwrap();
        assert_eq!(entry.id(), Some(3));

        let entry: ResponseEntry = serde_json::from_value(json!({
            "service": "ADMIN", "command": "LOGIN", "requestid": 4,
            "content": {"code": 3, "msg": "bad"}
        }))
        .unwrap();
        assert_eq!(entry.id(), Some(4));
        assert!(!entry.content.is_success());
    }

    #[test]
    fn frame_defaults_missing_sections() {
        let frame: InboundFrame =
            serde_json::from_value(json!({"notify": [{"heartbeat": "1700000000000"}]})).unwrap();
        assert!(frame.response.is_empty());
        assert!(frame.data.is_empty());
        assert!(frame.notify[0].is_heartbeat());
        assert!(!frame.is_empty());
    }

    #[test]
    fn empty_frame_serializes_to_empty_object() {
        let text = serde_json::to_string(&InboundFrame::default()).unwrap();
        assert_eq!(text, "{}");
    }
}
