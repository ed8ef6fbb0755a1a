//! Record Sink Port (Driven Port)
//!
//! Destination for decoded records. The delivery adapter is the only
//! caller and never invokes `write` concurrently.

use async_trait::async_trait;

use crate::domain::streaming::DecodedRecord;

/// Port for recording decoded records.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Write one record. Returning means the sink has accepted it.
    async fn write(&self, record: &DecodedRecord) -> Result<(), SinkError>;

    /// Flush buffered output.
    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Sink errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SinkError {
    /// Underlying I/O failed.
    #[error("sink I/O error: {message}")]
    Io {
        /// Error details.
        message: String,
    },

    /// Record could not be serialized.
    #[error("sink serialization error: {message}")]
    Serialization {
        /// Error details.
        message: String,
    },

    /// Downstream consumer has gone away.
    #[error("sink closed")]
    Closed,
}

impl From<std::io::Error> for SinkError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for SinkError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}
