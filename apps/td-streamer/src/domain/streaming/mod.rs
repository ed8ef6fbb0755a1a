//! Market Data Streaming Types
//!
//! Core domain types shared by every layer: the session credential
//! snapshot, decoded records and their field values, and the quality of
//! service levels understood by the streamer.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::domain::schema::Service;

// =============================================================================
// Session Credentials
// =============================================================================

/// Margin applied when deciding whether a token is about to expire.
const EXPIRY_SKEW_SECS: i64 = 30;

/// Snapshot of the credentials needed to log a streamer connection in.
///
/// Owned by the auth provider. A session holds one immutable copy per
/// connection attempt. The `Debug` implementation redacts the token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCredentials {
    /// Account-bound access token.
    pub access_token: String,
    /// Streamer application/session identity, sent as `source`.
    pub streamer_session_id: String,
    /// Account the session is bound to, sent as `account`.
    pub account_id: String,
    /// Key used for the account activity service.
    pub subscription_key: String,
    /// When the access token stops being valid.
    pub token_expiry: DateTime<Utc>,
}

impl SessionCredentials {
    /// Check whether the token is expired (or within the skew window) at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.token_expiry - ChronoDuration::seconds(EXPIRY_SKEW_SECS) <= now
    }

    /// Check whether the token is expired now.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

impl fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("access_token", &"[REDACTED]")
            .field("streamer_session_id", &self.streamer_session_id)
            .field("account_id", &self.account_id)
            .field("subscription_key", &"[REDACTED]")
            .field("token_expiry", &self.token_expiry)
            .finish()
    }
}

// =============================================================================
// Field Values
// =============================================================================

/// A single decoded field value.
///
/// Numeric JSON values and numeric strings become [`FieldValue::Number`];
/// nested arrays and objects (book levels, actives payloads) are kept raw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Decimal number.
    Number(Decimal),
    /// Boolean flag.
    Bool(bool),
    /// Free text.
    Text(String),
    /// Nested structure passed through unchanged.
    Raw(Value),
}

impl FieldValue {
    /// Convert a wire value. Returns `None` for `null`, which means "unset".
    #[must_use]
    pub fn from_wire(value: Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(b) => Some(Self::Bool(b)),
            Value::Number(n) => {
                let text = n.to_string();
                Some(
                    parse_decimal(&text)
                        .map_or_else(|| Self::Raw(Value::Number(n)), Self::Number),
                )
            }
            Value::String(s) => Some(parse_decimal(&s).map_or(Self::Text(s), Self::Number)),
            other => Some(Self::Raw(other)),
        }
    }

    /// Convert back into the value a server would send.
    #[must_use]
    pub fn to_wire(&self) -> Value {
        match self {
            Self::Number(d) => Value::String(d.to_string()),
            Self::Bool(b) => Value::Bool(*b),
            Self::Text(s) => Value::String(s.clone()),
            Self::Raw(v) => v.clone(),
        }
    }

    /// Get the decimal value, if numeric.
    #[must_use]
    pub const fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Self::Number(d) => Some(*d),
            _ => None,
        }
    }

    /// Get the text value, if textual.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Number(d) => serializer.serialize_str(&d.to_string()),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Text(s) => serializer.serialize_str(s),
            Self::Raw(v) => v.serialize(serializer),
        }
    }
}

fn parse_decimal(text: &str) -> Option<Decimal> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    Decimal::from_str(trimmed)
        .or_else(|_| Decimal::from_scientific(trimmed))
        .ok()
}

// =============================================================================
// Decoded Record
// =============================================================================

/// One decoded content entry, ready for delivery.
///
/// `fields` holds exactly the schema names of the requested indices that
/// the server actually sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodedRecord {
    /// Service the record belongs to.
    pub service: Service,
    /// Symbol (content `key`) the record describes.
    pub symbol: String,
    /// Field name to value.
    pub fields: BTreeMap<&'static str, FieldValue>,
    /// Server timestamp of the enclosing data entry, if present.
    pub server_time: Option<DateTime<Utc>>,
    /// When the frame carrying the record was received.
    pub received_at: DateTime<Utc>,
}

impl DecodedRecord {
    /// Get a field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }
}

// =============================================================================
// Quality of Service
// =============================================================================

/// Update rate requested from the streamer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QosLevel {
    /// 500 ms updates.
    Express,
    /// 750 ms updates.
    RealTime,
    /// 1 s updates.
    #[default]
    Fast,
    /// 1.5 s updates.
    Moderate,
    /// 3 s updates.
    Slow,
    /// 5 s updates.
    Delayed,
}

impl QosLevel {
    /// Numeric level sent as the `qoslevel` parameter.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Express => 0,
            Self::RealTime => 1,
            Self::Fast => 2,
            Self::Moderate => 3,
            Self::Slow => 4,
            Self::Delayed => 5,
        }
    }

    /// Level name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Express => "express",
            Self::RealTime => "real-time",
            Self::Fast => "fast",
            Self::Moderate => "moderate",
            Self::Slow => "slow",
            Self::Delayed => "delayed",
        }
    }
}

impl FromStr for QosLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "express" | "0" => Ok(Self::Express),
            "real-time" | "realtime" | "1" => Ok(Self::RealTime),
            "fast" | "2" => Ok(Self::Fast),
            "moderate" | "3" => Ok(Self::Moderate),
            "slow" | "4" => Ok(Self::Slow),
            "delayed" | "5" => Ok(Self::Delayed),
            other => Err(format!("unknown QOS level: {other}")),
        }
    }
}

impl fmt::Display for QosLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
