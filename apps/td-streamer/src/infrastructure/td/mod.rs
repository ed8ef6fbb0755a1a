//! Streamer Protocol Adapter
//!
//! Client for the TD Ameritrade streamer WebSocket protocol:
//!
//! - `messages` / `codec`: wire envelopes and JSON encoding
//! - `requests`: request builder and subscription validation
//! - `pending`: request/response correlation
//! - `dispatcher`: inbound frame classification and decoding
//! - `heartbeat` / `reconnect`: idle detection and backoff
//! - `session` / `client`: the connection state machine and its handle
//! - `transport`: WebSocket and in-process loopback transports

pub mod client;
pub mod codec;
pub mod dispatcher;
pub mod handlers;
pub mod heartbeat;
pub mod messages;
pub mod pending;
pub mod reconnect;
pub mod requests;
pub mod session;
pub mod transport;

pub use client::{ClientConfig, RequestHandle, StreamingClient};
pub use pending::RequestAck;
pub use session::ConnectionState;
pub use transport::{
    LoopbackConnector, LoopbackPeer, LoopbackServer, WebSocketConnector, loopback,
};
