//! Request Builder
//!
//! Builds correlated request envelopes for one connection. The builder is
//! recreated on every connection so request ids restart, and ids are never
//! reused within a connection.

use std::collections::BTreeMap;

use crate::domain::schema::{Service, fields_for, resolve_fields};
use crate::domain::streaming::{QosLevel, SessionCredentials};
use crate::domain::subscription::{Subscription, SubscriptionCommand, normalize_symbols};
use crate::error::StreamError;
use crate::infrastructure::td::messages::RequestEnvelope;

/// Service name used for session commands.
pub const ADMIN_SERVICE: &str = "ADMIN";

/// Protocol version sent with login.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Session-level commands.
pub mod commands {
    /// Log the connection in.
    pub const LOGIN: &str = "LOGIN";
    /// Log the connection out.
    pub const LOGOUT: &str = "LOGOUT";
    /// Change the update rate.
    pub const QOS: &str = "QOS";
}

/// Durations accepted by the actives services.
pub const ACTIVES_DURATIONS: [&str; 6] = ["ALL", "60", "300", "600", "1800", "3600"];

// =============================================================================
// Validation
// =============================================================================

/// Validate a subscribe call and turn it into a `SUBS` subscription.
///
/// `fields` may be schema names or numeric indices. An empty list requests
/// every field of the service.
///
/// # Errors
///
/// - [`StreamError::InvalidField`] if a field is unknown to the service
/// - [`StreamError::InvalidSymbols`] if no symbol survives normalization
pub fn prepare_subscription<S: AsRef<str>, F: AsRef<str>>(
    service: Service,
    symbols: &[S],
    fields: &[F],
) -> Result<Subscription, StreamError> {
    let requested = if fields.is_empty() {
        (0..fields_for(service).len()).collect()
    } else {
        resolve_fields(service, fields)?
    };

    let subscription = Subscription::new(service, symbols, requested);
    if subscription.symbols.is_empty() {
        return Err(StreamError::InvalidSymbols(service));
    }
    Ok(subscription)
}

/// Build the key for an actives subscription, e.g. `NASDAQ-60`.
///
/// # Errors
///
/// Returns [`StreamError::InvalidSymbols`] if the service is not an actives
/// service, the venue is blank or the duration is not supported.
pub fn actives_key(service: Service, venue: &str, duration: &str) -> Result<String, StreamError> {
    let is_actives = matches!(
        service,
        Service::ActivesNasdaq | Service::ActivesNyse | Service::ActivesOtcbb | Service::ActivesOptions
    );
    let venue = venue.trim();
    let duration = duration.trim().to_uppercase();

    if !is_actives || venue.is_empty() || !ACTIVES_DURATIONS.contains(&duration.as_str()) {
        return Err(StreamError::InvalidSymbols(service));
    }
    Ok(format!("{}-{duration}", venue.to_uppercase()))
}

// =============================================================================
// Builder
// =============================================================================

/// Builds request envelopes bound to one account and streamer source.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    account: String,
    source: String,
    next_id: u64,
}

impl RequestBuilder {
    /// Create a builder for a new connection.
    #[must_use]
    pub fn new(credentials: &SessionCredentials) -> Self {
        Self {
            account: credentials.account_id.clone(),
            source: credentials.streamer_session_id.clone(),
            next_id: 0,
        }
    }

    /// Id the next request will carry.
    #[must_use]
    pub const fn peek_next_id(&self) -> u64 {
        self.next_id
    }

    fn envelope(
        &mut self,
        service: &str,
        command: &str,
        parameters: BTreeMap<String, String>,
    ) -> RequestEnvelope {
        let id = self.next_id;
        self.next_id += 1;
        RequestEnvelope {
            service: service.to_string(),
            command: command.to_string(),
            request_id: id.to_string(),
            account: self.account.clone(),
            source: self.source.clone(),
            parameters,
        }
    }

    /// `ADMIN/LOGIN` carrying the access token.
    pub fn build_login(&mut self, credentials: &SessionCredentials) -> RequestEnvelope {
        let credential = [
            ("userid", credentials.account_id.as_str()),
            ("token", credentials.access_token.as_str()),
            ("appid", credentials.streamer_session_id.as_str()),
        ]
        .iter()
        .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");

        let parameters = BTreeMap::from([
            ("credential".to_string(), credential),
            ("token".to_string(), credentials.access_token.clone()),
            ("version".to_string(), PROTOCOL_VERSION.to_string()),
        ]);
        self.envelope(ADMIN_SERVICE, commands::LOGIN, parameters)
    }

    /// Validate and build a `SUBS` request.
    ///
    /// # Errors
    ///
    /// See [`prepare_subscription`].
    pub fn build_subscribe<S: AsRef<str>, F: AsRef<str>>(
        &mut self,
        service: Service,
        symbols: &[S],
        fields: &[F],
    ) -> Result<RequestEnvelope, StreamError> {
        let subscription = prepare_subscription(service, symbols, fields)?;
        Ok(self.build_subscription(&subscription))
    }

    /// Build the request for a registry delta or replay entry.
    pub fn build_subscription(&mut self, subscription: &Subscription) -> RequestEnvelope {
        let mut parameters = BTreeMap::from([("keys".to_string(), subscription.symbols.join(","))]);
        if subscription.command != SubscriptionCommand::Unsubs {
            let fields = subscription
                .requested_fields
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            parameters.insert("fields".to_string(), fields);
        }
        self.envelope(
            subscription.service.as_wire(),
            subscription.command.as_str(),
            parameters,
        )
    }

    /// Build an `UNSUBS` request.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::InvalidSymbols`] if no symbol survives
    /// normalization.
    pub fn build_unsubscribe<S: AsRef<str>>(
        &mut self,
        service: Service,
        symbols: &[S],
    ) -> Result<RequestEnvelope, StreamError> {
        let symbols = normalize_symbols(service, symbols);
        if symbols.is_empty() {
            return Err(StreamError::InvalidSymbols(service));
        }
        let parameters = BTreeMap::from([("keys".to_string(), symbols.join(","))]);
        Ok(self.envelope(
            service.as_wire(),
            SubscriptionCommand::Unsubs.as_str(),
            parameters,
        ))
    }

    /// `ADMIN/QOS` with the numeric level.
    pub fn build_quality_of_service(&mut self, level: QosLevel) -> RequestEnvelope {
        let parameters = BTreeMap::from([("qoslevel".to_string(), level.code().to_string())]);
        self.envelope(ADMIN_SERVICE, commands::QOS, parameters)
    }

    /// `ADMIN/LOGOUT`.
    pub fn build_logout(&mut self) -> RequestEnvelope {
        self.envelope(ADMIN_SERVICE, commands::LOGOUT, BTreeMap::new())
    }
}
