//! Field Schema Registry
//!
//! The streamer keys every value by a small integer instead of a name. Each
//! service has its own ordered table of field names; this module holds
//! those tables and the conversions between names, indices and positional
//! value arrays.
//!
//! # Positional Decoding
//!
//! A subscription requests an ordered list of field indices. Decoding maps
//! `values[k]` to `fields_for(service)[requested[k]]`:
//!
//! ```text
//! requested = [1, 2]          (bid-price, ask-price)
//! values    = ["101.5", "101.7"]
//! decoded   = {bid-price: 101.5, ask-price: 101.7}
//! ```
//!
//! Missing trailing values leave their fields absent; requested indices
//! outside the schema are dropped.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::domain::streaming::FieldValue;

// =============================================================================
// Field Tables
// =============================================================================

const ACCOUNT_ACTIVITY_FIELDS: &[&str] =
    &["subscription-key", "account-id", "message-type", "message-data"];

const LEVEL_ONE_QUOTE_FIELDS: &[&str] = &[
    "symbol",
    "bid-price",
    "ask-price",
    "last-price",
    "bid-size",
    "ask-size",
    "ask-id",
    "bid-id",
    "total-volume",
    "last-size",
    "trade-time",
    "quote-time",
    "high-price",
    "low-price",
    "bid-tick",
    "close-price",
    "exchange-id",
    "marginable",
    "shortable",
    "island-bid",
    "island-ask",
    "island-volume",
    "quote-day",
    "trade-day",
    "volatility",
    "description",
    "last-id",
    "digits",
    "open-price",
    "net-change",
    "52-week-high",
    "52-week-low",
    "pe-ratio",
    "dividend-amount",
    "dividend-yield",
    "island-bid-size",
    "island-ask-size",
    "nav",
    "fund-price",
    "exchange-name",
    "dividend-date",
    "regular-market-quote",
    "regular-market-trade",
    "regular-market-last-price",
    "regular-market-last-size",
    "regular-market-trade-time",
    "regular-market-trade-day",
    "regular-market-net-change",
    "security-status",
    "mark",
    "quote-time-in-long",
    "trade-time-in-long",
    "regular-market-trade-time-in-long",
];

const LEVEL_ONE_OPTION_FIELDS: &[&str] = &[
    "symbol",
    "bid-price",
    "ask-price",
    "last-price",
    "bid-size",
    "ask-size",
    "total-volume",
    "last-size",
    "trade-time",
    "quote-time",
    "high-price",
    "low-price",
    "close-price",
    "quote-day",
    "trade-day",
    "volatility",
    "description",
    "digits",
    "open-price",
    "net-change",
    "security-status",
    "mark",
    "open-interest",
    "money-intrinsic-value",
    "expiration-year",
    "multiplier",
    "strike-price",
    "contract-type",
    "underlying",
    "expiration-month",
    "deliverables",
    "time-value",
    "expiration-day",
    "days-to-expiration",
    "delta",
    "gamma",
    "theta",
    "vega",
    "rho",
    "theoretical-option-value",
    "underlying-price",
    "uv-expiration-type",
];

const LEVEL_ONE_FUTURES_FIELDS: &[&str] = &[
    "symbol",
    "bid-price",
    "ask-price",
    "last-price",
    "bid-size",
    "ask-size",
    "ask-id",
    "bid-id",
    "total-volume",
    "last-size",
    "trade-time",
    "quote-time",
    "high-price",
    "low-price",
    "close-price",
    "exchange-id",
    "description",
    "last-id",
    "open-price",
    "net-change",
    "security-status",
    "mark",
    "open-interest",
    "future-percent-change",
    "exchange-name",
    "tick",
    "tick-amount",
    "product",
    "future-price-format",
    "future-trading-hours",
    "future-is-tradable",
    "future-multiplier",
    "future-is-active",
    "future-settlement-price",
    "future-active-symbol",
    "future-expiration-date",
];

const LEVEL_ONE_FOREX_FIELDS: &[&str] = &[
    "symbol",
    "bid-price",
    "ask-price",
    "last-price",
    "bid-size",
    "ask-size",
    "total-volume",
    "last-size",
    "trade-time",
    "quote-time",
    "high-price",
    "low-price",
    "close-price",
    "exchange-id",
    "description",
    "digits",
    "open-price",
    "net-change",
    "52-week-low",
    "exchange-name",
    "security-status",
    "mark",
    "tick",
    "tick-amount",
    "product",
    "percent-change",
    "trading-hours",
    "is-tradable",
    "market-maker",
    "52-week-high",
];

/// Shared by every chart service.
const CHART_FIELDS: &[&str] = &[
    "key",
    "open-price",
    "high-price",
    "low-price",
    "close-price",
    "volume",
    "sequence",
    "chart-time",
    "chart-day",
];

const TIMESALE_FIELDS: &[&str] = &[
    "symbol",
    "last-price",
    "last-size",
    "trade-time",
    "last-sequence",
];

const NEWS_HEADLINE_FIELDS: &[&str] = &[
    "symbol",
    "error-code",
    "story-datetime",
    "headline-id",
    "status",
    "headline",
    "story-id",
    "count-for-keyword",
    "keyword-array",
    "is-hot",
    "story-source",
];

const BOOK_FIELDS: &[&str] = &["key", "book-time", "bids", "asks"];

const ACTIVES_FIELDS: &[&str] = &["key", "data"];

// =============================================================================
// Service
// =============================================================================

/// Account entitlement a service needs. A subscription to a service the
/// account is not entitled to is rejected by the server with a non-zero code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Entitlement {
    /// Level one equity and option quotes.
    LevelOne,
    /// Level two order book depth.
    LevelTwo,
    /// Futures market data.
    Futures,
    /// Forex market data.
    Forex,
    /// Streaming news.
    News,
    /// Account activity events.
    AccountActivity,
}

/// A named category of streamed data with its own field schema.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Service {
    Quote,
    Option,
    LevelOneFutures,
    LevelOneForex,
    LevelOneFuturesOptions,
    ChartEquity,
    ChartFutures,
    ChartOptions,
    TimesaleEquity,
    TimesaleFutures,
    TimesaleForex,
    TimesaleOptions,
    NewsHeadline,
    AccountActivity,
    ListedBook,
    NasdaqBook,
    OptionsBook,
    FuturesBook,
    ForexBook,
    FuturesOptionsBook,
    TotalView,
    ActivesNasdaq,
    ActivesNyse,
    ActivesOtcbb,
    ActivesOptions,
}

/// Immutable description of one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Name used on the wire.
    pub wire_name: &'static str,
    /// Ordered field names; position is the field index.
    pub fields: &'static [&'static str],
    /// Entitlement the account needs.
    pub entitlement: Entitlement,
}

impl Service {
    /// Every streamable service.
    pub const ALL: [Self; 25] = [
        Self::Quote,
        Self::Option,
        Self::LevelOneFutures,
        Self::LevelOneForex,
        Self::LevelOneFuturesOptions,
        Self::ChartEquity,
        Self::ChartFutures,
        Self::ChartOptions,
        Self::TimesaleEquity,
        Self::TimesaleFutures,
        Self::TimesaleForex,
        Self::TimesaleOptions,
        Self::NewsHeadline,
        Self::AccountActivity,
        Self::ListedBook,
        Self::NasdaqBook,
        Self::OptionsBook,
        Self::FuturesBook,
        Self::ForexBook,
        Self::FuturesOptionsBook,
        Self::TotalView,
        Self::ActivesNasdaq,
        Self::ActivesNyse,
        Self::ActivesOtcbb,
        Self::ActivesOptions,
    ];

    /// Get the static descriptor for this service.
    #[must_use]
    pub const fn descriptor(self) -> ServiceDescriptor {
        let (wire_name, fields, entitlement) = match self {
            Self::Quote => ("QUOTE", LEVEL_ONE_QUOTE_FIELDS, Entitlement::LevelOne),
            Self::Option => ("OPTION", LEVEL_ONE_OPTION_FIELDS, Entitlement::LevelOne),
            Self::LevelOneFutures => (
                "LEVELONE_FUTURES",
                LEVEL_ONE_FUTURES_FIELDS,
                Entitlement::Futures,
            ),
            Self::LevelOneForex => ("LEVELONE_FOREX", LEVEL_ONE_FOREX_FIELDS, Entitlement::Forex),
            Self::LevelOneFuturesOptions => (
                "LEVELONE_FUTURES_OPTIONS",
                LEVEL_ONE_FUTURES_FIELDS,
                Entitlement::Futures,
            ),
            Self::ChartEquity => ("CHART_EQUITY", CHART_FIELDS, Entitlement::LevelOne),
            Self::ChartFutures => ("CHART_FUTURES", CHART_FIELDS, Entitlement::Futures),
            Self::ChartOptions => ("CHART_OPTIONS", CHART_FIELDS, Entitlement::LevelOne),
            Self::TimesaleEquity => ("TIMESALE_EQUITY", TIMESALE_FIELDS, Entitlement::LevelOne),
            Self::TimesaleFutures => ("TIMESALE_FUTURES", TIMESALE_FIELDS, Entitlement::Futures),
            Self::TimesaleForex => ("TIMESALE_FOREX", TIMESALE_FIELDS, Entitlement::Forex),
            Self::TimesaleOptions => ("TIMESALE_OPTIONS", TIMESALE_FIELDS, Entitlement::LevelOne),
            Self::NewsHeadline => ("NEWS_HEADLINE", NEWS_HEADLINE_FIELDS, Entitlement::News),
            Self::AccountActivity => (
                "ACCT_ACTIVITY",
                ACCOUNT_ACTIVITY_FIELDS,
                Entitlement::AccountActivity,
            ),
            Self::ListedBook => ("LISTED_BOOK", BOOK_FIELDS, Entitlement::LevelTwo),
            Self::NasdaqBook => ("NASDAQ_BOOK", BOOK_FIELDS, Entitlement::LevelTwo),
            Self::OptionsBook => ("OPTIONS_BOOK", BOOK_FIELDS, Entitlement::LevelTwo),
            Self::FuturesBook => ("FUTURES_BOOK", BOOK_FIELDS, Entitlement::Futures),
            Self::ForexBook => ("FOREX_BOOK", BOOK_FIELDS, Entitlement::Forex),
            Self::FuturesOptionsBook => {
                ("FUTURES_OPTIONS_BOOK", BOOK_FIELDS, Entitlement::Futures)
            }
            Self::TotalView => ("TOTAL_VIEW", BOOK_FIELDS, Entitlement::LevelTwo),
            Self::ActivesNasdaq => ("ACTIVES_NASDAQ", ACTIVES_FIELDS, Entitlement::LevelOne),
            Self::ActivesNyse => ("ACTIVES_NYSE", ACTIVES_FIELDS, Entitlement::LevelOne),
            Self::ActivesOtcbb => ("ACTIVES_OTCBB", ACTIVES_FIELDS, Entitlement::LevelOne),
            Self::ActivesOptions => ("ACTIVES_OPTIONS", ACTIVES_FIELDS, Entitlement::LevelOne),
        };
        ServiceDescriptor {
            wire_name,
            fields,
            entitlement,
        }
    }

    /// Name used on the wire.
    #[must_use]
    pub const fn as_wire(self) -> &'static str {
        self.descriptor().wire_name
    }

    /// Entitlement the account needs for this service.
    #[must_use]
    pub const fn entitlement(self) -> Entitlement {
        self.descriptor().entitlement
    }

    /// Look a service up by wire name (case-insensitive).
    #[must_use]
    pub fn from_wire(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|s| s.as_wire().eq_ignore_ascii_case(name))
    }

    /// Whether symbols for this service are case-sensitive keys.
    ///
    /// Account activity is keyed by the subscription key, which must be sent
    /// exactly as issued.
    #[must_use]
    pub const fn has_case_sensitive_keys(self) -> bool {
        matches!(self, Self::AccountActivity)
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

impl FromStr for Service {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_wire(s).ok_or_else(|| SchemaError::UnknownService(s.to_string()))
    }
}

impl Serialize for Service {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_wire())
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Schema lookup failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    /// Field name or index is not part of the service schema.
    #[error("unknown field '{field}' for service {service}")]
    UnknownField {
        /// Service whose schema was searched.
        service: Service,
        /// Field as supplied by the caller.
        field: String,
    },

    /// Service name is not recognized.
    #[error("unknown service '{0}'")]
    UnknownService(String),
}

// =============================================================================
// Registry Operations
// =============================================================================

/// Ordered field names for a service.
#[must_use]
pub const fn fields_for(service: Service) -> &'static [&'static str] {
    service.descriptor().fields
}

/// Find the index of a field name in a service schema.
///
/// Matching ignores ASCII case and surrounding whitespace.
///
/// # Errors
///
/// Returns [`SchemaError::UnknownField`] if the name is not in the schema.
pub fn index_of(service: Service, field_name: &str) -> Result<usize, SchemaError> {
    let wanted = field_name.trim();
    fields_for(service)
        .iter()
        .position(|name| name.eq_ignore_ascii_case(wanted))
        .ok_or_else(|| SchemaError::UnknownField {
            service,
            field: field_name.to_string(),
        })
}

/// Resolve caller-supplied field specs into requested indices.
///
/// Each entry is either a field name or a numeric index (`"0"`, `"12"`).
/// Duplicates are removed keeping the first occurrence.
///
/// # Errors
///
/// Returns [`SchemaError::UnknownField`] for the first entry that is neither
/// a known name nor an in-range index.
pub fn resolve_fields<S: AsRef<str>>(
    service: Service,
    specs: &[S],
) -> Result<Vec<usize>, SchemaError> {
    let schema_len = fields_for(service).len();
    let mut indices = Vec::with_capacity(specs.len());

    for spec in specs {
        let spec = spec.as_ref();
        let index = match spec.trim().parse::<usize>() {
            Ok(index) if index < schema_len => index,
            Ok(_) => {
                return Err(SchemaError::UnknownField {
                    service,
                    field: spec.to_string(),
                });
            }
            Err(_) => index_of(service, spec)?,
        };
        if !indices.contains(&index) {
            indices.push(index);
        }
    }

    Ok(indices)
}

/// Decode positional values into named fields.
///
/// `values[k]` is the value of `fields_for(service)[requested[k]]`. A `None`
/// slot or a missing trailing slot leaves the field absent, as does a
/// requested index outside the schema.
#[must_use]
pub fn decode(
    service: Service,
    requested: &[usize],
    values: &[Option<Value>],
) -> BTreeMap<&'static str, FieldValue> {
    let schema = fields_for(service);
    requested
        .iter()
        .zip(values)
        .filter_map(|(&index, value)| {
            let name = schema.get(index)?;
            let value = FieldValue::from_wire(value.clone()?)?;
            Some((*name, value))
        })
        .collect()
}

/// Encode named fields into positional values, the inverse of [`decode`].
///
/// Trailing absent slots are trimmed.
#[must_use]
pub fn encode(
    service: Service,
    requested: &[usize],
    fields: &BTreeMap<&'static str, FieldValue>,
) -> Vec<Option<Value>> {
    let schema = fields_for(service);
    let mut values: Vec<Option<Value>> = requested
        .iter()
        .map(|&index| {
            schema
                .get(index)
                .and_then(|name| fields.get(name))
                .map(FieldValue::to_wire)
        })
        .collect();

    while matches!(values.last(), Some(None)) {
        values.pop();
    }
    values
}
