//! Domain Layer - Core streaming types and business logic.
//!
//! This layer contains the field schemas, record types and subscription
//! tracking. Nothing here performs I/O.

/// Per-service positional field schemas.
pub mod schema;

/// Credentials, decoded records and field values.
pub mod streaming;

/// Subscription tracking for replay.
pub mod subscription;
