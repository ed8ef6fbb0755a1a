//! Application Layer - Port definitions.
//!
//! This layer contains the port interfaces that define how the streaming
//! core interacts with credentials, transports and record sinks.

/// Port interfaces for external systems (auth, transport, sinks).
pub mod ports;
