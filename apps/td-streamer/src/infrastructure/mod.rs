//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Streamer protocol client (wire format, session, transports).
pub mod td;

/// Bounded delivery queue between decoding and the record sink.
pub mod delivery;

/// Record sink adapters.
pub mod sinks;

/// Auth provider and credential store adapters.
pub mod credentials;

/// Configuration loading.
pub mod config;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;
