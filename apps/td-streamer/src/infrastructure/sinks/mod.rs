//! Record Sinks
//!
//! [`RecordSink`] adapters:
//!
//! - [`ConsoleSink`]: one JSON line per record on stdout
//! - [`JsonLinesFileSink`]: one JSON line per record in a file, appending
//!   or truncating on open
//! - [`ChannelSink`]: pushes records into a bounded channel for in-process
//!   consumers

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter, Stdout};
use tokio::sync::{Mutex, mpsc};

use crate::application::ports::{RecordSink, SinkError};
use crate::domain::streaming::DecodedRecord;

fn to_line(record: &DecodedRecord) -> Result<Vec<u8>, SinkError> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    Ok(line)
}

// =============================================================================
// Console
// =============================================================================

/// Writes records to stdout as JSON lines.
#[derive(Debug)]
pub struct ConsoleSink {
    out: Mutex<Stdout>,
}

impl ConsoleSink {
    /// Create a console sink.
    #[must_use]
    pub fn new() -> Self {
        Self {
            out: Mutex::new(tokio::io::stdout()),
        }
    }
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordSink for ConsoleSink {
    async fn write(&self, record: &DecodedRecord) -> Result<(), SinkError> {
        let line = to_line(record)?;
        let mut out = self.out.lock().await;
        out.write_all(&line).await?;
        out.flush().await?;
        Ok(())
    }
}

// =============================================================================
// JSON Lines File
// =============================================================================

/// Writes records to a file as JSON lines.
#[derive(Debug)]
pub struct JsonLinesFileSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesFileSink {
    /// Open `path`, creating parent directories. `append` keeps existing
    /// content; otherwise the file is truncated.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Io`] if the file cannot be opened.
    pub async fn open(path: impl AsRef<Path>, append: bool) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut options = OpenOptions::new();
        options.create(true);
        if append {
            options.append(true);
        } else {
            options.write(true).truncate(true);
        }
        let file = options.open(&path).await?;

        tracing::debug!(path = %path.display(), append, "Opened record file");
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Path being written.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordSink for JsonLinesFileSink {
    async fn write(&self, record: &DecodedRecord) -> Result<(), SinkError> {
        let line = to_line(record)?;
        self.writer.lock().await.write_all(&line).await?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        self.writer.lock().await.flush().await?;
        Ok(())
    }
}

// =============================================================================
// Channel
// =============================================================================

/// Pushes records into a bounded channel. `write` waits while the channel
/// is full.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<DecodedRecord>,
}

impl ChannelSink {
    /// Create a sink and the receiver that drains it.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<DecodedRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl RecordSink for ChannelSink {
    async fn write(&self, record: &DecodedRecord) -> Result<(), SinkError> {
        self.tx
            .send(record.clone())
            .await
            .map_err(|_| SinkError::Closed)
    }
}
