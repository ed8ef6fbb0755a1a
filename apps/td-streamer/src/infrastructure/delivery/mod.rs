//! Delivery Sink Adapter
//!
//! Sits between frame decoding and the record sink. Decoded records enter
//! a bounded queue; a writer task hands them to the sink one at a time, in
//! order. The record being written keeps its queue slot until the sink
//! accepts it, so a stalled sink holds the queue at full depth.
//!
//! # Backpressure
//!
//! - [`BackpressurePolicy::Block`]: `deliver` suspends until a slot frees.
//! - [`BackpressurePolicy::DropOldest`]: the oldest record that is not
//!   being written is evicted.
//! - [`BackpressurePolicy::BlockThenDropOldest`]: block up to `max_wait`,
//!   then evict.
//!
//! Evictions and sink failures are counted and reported through the error
//! callback. Neither is fatal.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::application::ports::RecordSink;
use crate::domain::streaming::DecodedRecord;
use crate::error::StreamError;
use crate::infrastructure::metrics;

/// Callback receiving non-fatal errors.
pub type ErrorCallback = Arc<dyn Fn(StreamError) + Send + Sync>;

// =============================================================================
// Configuration
// =============================================================================

/// What `deliver` does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Suspend until space frees.
    Block,
    /// Evict the oldest record not being written.
    DropOldest,
    /// Suspend up to `max_wait`, then evict.
    BlockThenDropOldest {
        /// Longest time to wait for space.
        max_wait: Duration,
    },
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        Self::BlockThenDropOldest {
            max_wait: Duration::from_secs(1),
        }
    }
}

impl FromStr for BackpressurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "drop-oldest" | "drop_oldest" => Ok(Self::DropOldest),
            "block-then-drop-oldest" | "block_then_drop_oldest" => Ok(Self::default()),
            other => Err(format!("unknown backpressure policy: {other}")),
        }
    }
}

impl fmt::Display for BackpressurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Block => f.write_str("block"),
            Self::DropOldest => f.write_str("drop-oldest"),
            Self::BlockThenDropOldest { max_wait } => {
                write!(f, "block-then-drop-oldest({}ms)", max_wait.as_millis())
            }
        }
    }
}

/// Delivery queue configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryConfig {
    /// Maximum queued records, including the one being written.
    pub queue_depth: usize,
    /// Full-queue behavior.
    pub policy: BackpressurePolicy,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            queue_depth: 1024,
            policy: BackpressurePolicy::default(),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Counters shared between the adapter and the client handle.
#[derive(Debug, Default)]
pub struct DeliveryCounters {
    delivered: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

impl DeliveryCounters {
    /// Point-in-time copy of the counters.
    #[must_use]
    pub fn snapshot(&self) -> DeliveryStats {
        DeliveryStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Delivery statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Records the sink accepted.
    pub delivered: u64,
    /// Records evicted or discarded before reaching the sink.
    pub dropped: u64,
    /// Records the sink rejected.
    pub failed: u64,
}

// =============================================================================
// Adapter
// =============================================================================

#[derive(Debug, Default)]
struct QueueState {
    records: VecDeque<DecodedRecord>,
    in_flight: bool,
}

struct Shared {
    queue: Mutex<QueueState>,
    space: Notify,
    items: Notify,
    idle: Notify,
    closed: AtomicBool,
    counters: Arc<DeliveryCounters>,
}

/// Bounded queue feeding a record sink.
pub struct DeliveryAdapter {
    shared: Arc<Shared>,
    config: DeliveryConfig,
    writer: Option<JoinHandle<()>>,
    on_error: ErrorCallback,
}

impl fmt::Debug for DeliveryAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryAdapter")
            .field("config", &self.config)
            .field("queued", &self.queued())
            .finish_non_exhaustive()
    }
}

impl DeliveryAdapter {
    /// Create the adapter and spawn its writer task.
    #[must_use]
    pub fn spawn(
        config: DeliveryConfig,
        sink: Arc<dyn RecordSink>,
        counters: Arc<DeliveryCounters>,
        on_error: ErrorCallback,
    ) -> Self {
        let config = DeliveryConfig {
            queue_depth: config.queue_depth.max(1),
            ..config
        };
        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState::default()),
            space: Notify::new(),
            items: Notify::new(),
            idle: Notify::new(),
            closed: AtomicBool::new(false),
            counters,
        });
        let writer = tokio::spawn(run_writer(
            Arc::clone(&shared),
            sink,
            Arc::clone(&on_error),
        ));

        Self {
            shared,
            config,
            writer: Some(writer),
            on_error,
        }
    }

    /// Queue a record for the sink, applying the backpressure policy.
    pub async fn deliver(&self, record: DecodedRecord) {
        if self.shared.closed.load(Ordering::Acquire) {
            self.report_dropped(&record);
            return;
        }

        match self.config.policy {
            BackpressurePolicy::Block => {
                self.wait_for_space().await;
                self.push(record);
            }
            BackpressurePolicy::DropOldest => self.push_evicting(record),
            BackpressurePolicy::BlockThenDropOldest { max_wait } => {
                if tokio::time::timeout(max_wait, self.wait_for_space())
                    .await
                    .is_ok()
                {
                    self.push(record);
                } else {
                    self.push_evicting(record);
                }
            }
        }
    }

    /// Delivered, dropped and failed counts so far.
    #[must_use]
    pub fn stats(&self) -> DeliveryStats {
        self.shared.counters.snapshot()
    }

    /// Records currently queued, including one being written.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().records.len()
    }

    /// Wait up to `timeout` for the queue to empty, then stop the writer.
    ///
    /// Returns the number of records that were still queued and have been
    /// discarded.
    pub async fn flush(&mut self, timeout: Duration) -> usize {
        let drained = tokio::time::timeout(timeout, self.wait_idle()).await.is_ok();

        self.shared.closed.store(true, Ordering::Release);
        self.shared.items.notify_one();

        if let Some(writer) = self.writer.take() {
            if !drained {
                writer.abort();
            }
            let _ = writer.await;
        }

        let remaining: Vec<DecodedRecord> = {
            let mut queue = self.shared.queue.lock();
            queue.in_flight = false;
            queue.records.drain(..).collect()
        };
        for record in &remaining {
            self.report_dropped(record);
        }
        if !remaining.is_empty() {
            tracing::warn!(
                discarded = remaining.len(),
                "Delivery queue not drained before timeout"
            );
        }
        remaining.len()
    }

    async fn wait_for_space(&self) {
        loop {
            let notified = self.shared.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.queue.lock().records.len() < self.config.queue_depth {
                return;
            }
            notified.await;
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let queue = self.shared.queue.lock();
                if queue.records.is_empty() && !queue.in_flight {
                    return;
                }
            }
            notified.await;
        }
    }

    fn push(&self, record: DecodedRecord) {
        self.shared.queue.lock().records.push_back(record);
        self.shared.items.notify_one();
    }

    fn push_evicting(&self, record: DecodedRecord) {
        let dropped = {
            let mut queue = self.shared.queue.lock();
            if queue.records.len() < self.config.queue_depth {
                queue.records.push_back(record);
                None
            } else {
                let oldest_idle = usize::from(queue.in_flight);
                if oldest_idle < queue.records.len() {
                    let evicted = queue.records.remove(oldest_idle);
                    queue.records.push_back(record);
                    evicted
                } else {
                    Some(record)
                }
            }
        };
        self.shared.items.notify_one();

        if let Some(dropped) = dropped {
            self.report_dropped(&dropped);
        }
    }

    fn report_dropped(&self, record: &DecodedRecord) {
        self.shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::record_record_dropped(record.service);
        tracing::warn!(
            service = %record.service,
            symbol = %record.symbol,
            "Dropped record under backpressure"
        );
        (self.on_error)(StreamError::DroppedRecord {
            service: record.service,
            symbol: record.symbol.clone(),
        });
    }
}

impl Drop for DeliveryAdapter {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

async fn run_writer(shared: Arc<Shared>, sink: Arc<dyn RecordSink>, on_error: ErrorCallback) {
    loop {
        let notified = shared.items.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let next = {
            let mut queue = shared.queue.lock();
            let next = queue.records.front().cloned();
            queue.in_flight = next.is_some();
            next
        };

        let Some(record) = next else {
            shared.idle.notify_waiters();
            if shared.closed.load(Ordering::Acquire) {
                break;
            }
            notified.await;
            continue;
        };

        let result = sink.write(&record).await;
        {
            let mut queue = shared.queue.lock();
            queue.records.pop_front();
            queue.in_flight = false;
        }
        shared.space.notify_one();

        match result {
            Ok(()) => {
                shared.counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                metrics::record_sink_failure();
                tracing::warn!(
                    service = %record.service,
                    symbol = %record.symbol,
                    error = %e,
                    "Sink rejected record"
                );
                on_error(StreamError::Sink(e.to_string()));
            }
        }
    }

    if let Err(e) = sink.flush().await {
        tracing::warn!(error = %e, "Sink flush failed");
    }
}

// =============================================================================
// Tests
// =============================================================================
