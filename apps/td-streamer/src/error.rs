//! Streaming Errors
//!
//! Error and warning taxonomy shared by the client, the session task and
//! the delivery adapter. Errors are `Clone` so one failure can be handed to
//! every waiting request handle and to the error hook.

use std::time::Duration;

use crate::domain::schema::{SchemaError, Service};

/// Protocol anomalies that never end the session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamWarning {
    /// A response carried a request id with no pending request.
    #[error("response for unknown request id {request_id}")]
    UnmatchedResponse {
        /// Request id as received.
        request_id: String,
    },

    /// Data arrived for a service with no active subscription.
    #[error("data for unsubscribed service {service}")]
    OrphanData {
        /// Service the data was tagged with.
        service: Service,
    },

    /// A frame named a service the schema registry does not know.
    #[error("unknown service '{name}'")]
    UnknownService {
        /// Service name as received.
        name: String,
    },

    /// The frame could not be parsed at all.
    #[error("malformed frame: {reason}")]
    MalformedFrame {
        /// Parser message.
        reason: String,
    },

    /// One content entry inside an otherwise valid frame was unusable.
    #[error("malformed content for {service}: {reason}")]
    MalformedContent {
        /// Service of the enclosing entry.
        service: Service,
        /// What was wrong with it.
        reason: String,
    },
}

impl StreamWarning {
    /// Short label used for metrics and logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::UnmatchedResponse { .. } => "unmatched_response",
            Self::OrphanData { .. } => "orphan_data",
            Self::UnknownService { .. } => "unknown_service",
            Self::MalformedFrame { .. } => "malformed_frame",
            Self::MalformedContent { .. } => "malformed_content",
        }
    }
}

/// Errors surfaced by the streaming client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The transport failed to open, closed, or stopped responding.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server rejected the login request.
    #[error("authentication failed (code {code}): {message}")]
    Authentication {
        /// Server response code.
        code: i64,
        /// Server message.
        message: String,
    },

    /// A requested field is not part of the service schema.
    #[error(transparent)]
    InvalidField(#[from] SchemaError),

    /// No usable symbol was supplied.
    #[error("no valid symbols supplied for {0}")]
    InvalidSymbols(Service),

    /// The server answered a request with a non-success code.
    #[error("{service} {command} failed (code {code}): {message}")]
    Subscription {
        /// Service the request targeted.
        service: String,
        /// Command that failed.
        command: String,
        /// Server response code.
        code: i64,
        /// Server message.
        message: String,
    },

    /// No response arrived before the request deadline.
    #[error("request {request_id} timed out after {timeout:?}")]
    RequestTimeout {
        /// Request id that expired.
        request_id: u64,
        /// Deadline that was applied.
        timeout: Duration,
    },

    /// Reconnection attempts were exhausted.
    #[error("connection lost after {attempts} reconnect attempts")]
    ConnectionLost {
        /// Number of attempts made.
        attempts: u32,
    },

    /// A record was evicted from the delivery queue.
    #[error("dropped {service} record for {symbol}")]
    DroppedRecord {
        /// Service of the dropped record.
        service: Service,
        /// Symbol of the dropped record.
        symbol: String,
    },

    /// The sink refused a record.
    #[error("sink error: {0}")]
    Sink(String),

    /// The auth provider could not supply credentials.
    #[error("credentials unavailable: {0}")]
    CredentialsUnavailable(String),

    /// Protocol anomaly, reported through the error hook.
    #[error("protocol warning: {0}")]
    Protocol(StreamWarning),

    /// The operation needs a running session.
    #[error("not connected")]
    NotConnected,

    /// `connect()` was called while a session is running.
    #[error("already connected")]
    AlreadyConnected,

    /// The session is draining and no longer accepts commands.
    #[error("shutting down")]
    ShuttingDown,

    /// The session ended before the operation completed.
    #[error("session closed")]
    Closed,
}

impl StreamError {
    /// Whether the error ends the session rather than a single request.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Authentication { .. } | Self::ConnectionLost { .. } | Self::CredentialsUnavailable(_)
        )
    }
}

impl From<StreamWarning> for StreamError {
    fn from(warning: StreamWarning) -> Self {
        Self::Protocol(warning)
    }
}

/// Result alias for streaming operations.
pub type StreamResult<T> = Result<T, StreamError>;
