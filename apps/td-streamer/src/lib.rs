#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! TD Streamer - Market Data Streaming Client
//!
//! Maintains one authenticated WebSocket session to the streamer service,
//! multiplexes service subscriptions over it, decodes positional field
//! payloads into named records and hands them to a record sink. Lost
//! connections are re-established with backoff and every active
//! subscription is replayed.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core streaming logic and data types
//!   - `schema`: per-service field tables and index/name translation
//!   - `streaming`: credentials, decoded records, field values, QoS
//!   - `subscription`: subscriptions and the replay registry
//!
//! - **Application**: Port definitions
//!   - `ports`: auth provider, credential store, record sink, transport
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `td`: wire format, request builder, dispatcher, session, client
//!   - `delivery`: bounded queue with backpressure in front of the sink
//!   - `sinks`: console, JSON-lines file and channel sinks
//!   - `credentials`: static and file-backed auth providers
//!   - `config`: environment configuration
//!
//! # Data Flow
//!
//! ```text
//!                    ┌────────────┐    ┌────────────┐    ┌──────────┐
//! Streamer WS ──────►│  Session   │───►│ Dispatcher │───►│ Delivery │──► Sink
//!        ▲           │   task     │    │ + schema   │    │  queue   │
//!        │           └────────────┘    └────────────┘    └──────────┘
//!        │                 ▲                 │
//!  requests ◄── commands ──┤                 └──► record / error handlers
//!                          │
//!                   StreamingClient
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core streaming types with no I/O.
pub mod domain;

/// Application layer - Port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

/// Error types.
pub mod error;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::schema::{SchemaError, Service};
pub use domain::streaming::{DecodedRecord, FieldValue, QosLevel, SessionCredentials};
pub use domain::subscription::{Subscription, SubscriptionCommand, SubscriptionRegistry, Symbol};

// Errors
pub use error::{StreamError, StreamResult, StreamWarning};

// Ports
pub use application::ports::{
    AuthProvider, Connector, CredentialStore, CredentialsError, RecordSink, SinkError, Transport,
    TransportError,
};

// Client
pub use infrastructure::td::{
    ClientConfig, ConnectionState, LoopbackConnector, LoopbackPeer, LoopbackServer,
    RequestAck, RequestHandle, StreamingClient, WebSocketConnector, loopback,
};

// Delivery and sinks
pub use infrastructure::delivery::{
    BackpressurePolicy, DeliveryConfig, DeliveryStats,
};
pub use infrastructure::sinks::{ChannelSink, ConsoleSink, JsonLinesFileSink};

// Credentials
pub use infrastructure::credentials::{
    JsonFileCredentialStore, StaticAuthProvider, StoredAuthProvider,
};

// Infrastructure config
pub use infrastructure::config::{
    ConfigError, FieldKeying, SessionSettings, SinkSettings, StreamerConfig, SubscriptionSpec,
};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
