//! Transport Ports (Driven Ports)
//!
//! A full-duplex text connection to the streamer and the factory that
//! opens one. `recv` must be cancel safe: the session polls it inside
//! `tokio::select!`.

use async_trait::async_trait;

/// An open connection carrying text frames.
#[async_trait]
pub trait Transport: Send {
    /// Send one text frame.
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Receive the next text frame. `None` means the peer closed.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    /// Close the connection. Errors are ignored.
    async fn close(&mut self);
}

/// Opens transports.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection to `url`.
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError>;
}

/// Transport errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The connection could not be established.
    #[error("connect failed: {message}")]
    Connect {
        /// Error details.
        message: String,
    },

    /// The connection broke while in use.
    #[error("connection error: {message}")]
    Io {
        /// Error details.
        message: String,
    },

    /// The connection is already closed.
    #[error("connection closed")]
    Closed,
}
