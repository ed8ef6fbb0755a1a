//! Application Ports (Driven)
//!
//! Ports define the interfaces the streaming core needs from the outside
//! world. Infrastructure adapters implement them.
//!
//! - **Auth**: credential supply and persistence
//! - **Transport**: full-duplex text connection to the streamer
//! - **Sink**: destination for decoded records

mod auth_port;
mod sink_port;
mod transport_port;

pub use auth_port::{AuthProvider, CredentialStore, CredentialsError};
pub use sink_port::{RecordSink, SinkError};
pub use transport_port::{Connector, Transport, TransportError};
