//! Prometheus Metrics Module
//!
//! Exposes streaming client metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Frames**: Inbound frames and decoded records by service
//! - **Delivery**: Records dropped by backpressure and sink failures
//! - **Protocol**: Non-fatal protocol warnings by kind
//! - **Connection**: Session state and reconnection attempts
//! - **Latency**: Frame dispatch duration
//!
//! # Integration
//!
//! The binary serves `/metrics` on `STREAMER_METRICS_PORT` when it is
//! non-zero. Without an installed recorder every call is a no-op.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::domain::schema::Service;

// =============================================================================
// Exporter
// =============================================================================

static INSTALLED: OnceLock<()> = OnceLock::new();

/// Install the Prometheus recorder with an HTTP listener on `port`.
///
/// Calling it again after a successful install is a no-op. Must be called
/// from within a Tokio runtime.
///
/// # Errors
///
/// Returns an error if the listener cannot bind or a recorder is already
/// installed by someone else.
pub fn init_metrics(port: u16) -> Result<(), BuildError> {
    if INSTALLED.get().is_some() {
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
        .install()?;

    register_metrics();
    let _ = INSTALLED.set(());
    Ok(())
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "td_streamer_frames_received_total",
        "Total inbound frames received from the streamer"
    );
    describe_counter!(
        "td_streamer_records_decoded_total",
        "Total records decoded by service"
    );
    describe_counter!(
        "td_streamer_records_dropped_total",
        "Total records evicted from the delivery queue"
    );
    describe_counter!(
        "td_streamer_sink_failures_total",
        "Total records the sink failed to write"
    );
    describe_counter!(
        "td_streamer_protocol_warnings_total",
        "Total protocol warnings by kind"
    );
    describe_counter!(
        "td_streamer_reconnects_total",
        "Total reconnection attempts"
    );
    describe_gauge!(
        "td_streamer_active_subscriptions",
        "Number of services with an active subscription"
    );
    describe_gauge!(
        "td_streamer_connection_state",
        "Current session state (0 disconnected .. 6 closed)"
    );
    describe_histogram!(
        "td_streamer_dispatch_seconds",
        "Time to dispatch one inbound frame"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record an inbound frame.
pub fn record_frame_received() {
    counter!("td_streamer_frames_received_total").increment(1);
}

/// Record a decoded record.
pub fn record_record_decoded(service: Service) {
    counter!(
        "td_streamer_records_decoded_total",
        "service" => service.as_wire()
    )
    .increment(1);
}

/// Record a record evicted by backpressure.
pub fn record_record_dropped(service: Service) {
    counter!(
        "td_streamer_records_dropped_total",
        "service" => service.as_wire()
    )
    .increment(1);
}

/// Record a sink write failure.
pub fn record_sink_failure() {
    counter!("td_streamer_sink_failures_total").increment(1);
}

/// Record a protocol warning.
pub fn record_protocol_warning(kind: &'static str) {
    counter!(
        "td_streamer_protocol_warnings_total",
        "kind" => kind
    )
    .increment(1);
}

/// Record a reconnection attempt.
pub fn record_reconnect() {
    counter!("td_streamer_reconnects_total").increment(1);
}

/// Update the active subscription count.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_subscriptions(count: usize) {
    gauge!("td_streamer_active_subscriptions").set(count as f64);
}

/// Update the connection state gauge.
pub fn set_connection_state(code: u8) {
    gauge!("td_streamer_connection_state").set(f64::from(code));
}

/// Record frame dispatch duration.
pub fn record_dispatch_duration(duration: Duration) {
    histogram!("td_streamer_dispatch_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_noop() {
        record_frame_received();
        record_record_decoded(Service::Quote);
        record_record_dropped(Service::Quote);
        record_sink_failure();
        record_protocol_warning("orphan_data");
        record_reconnect();
        set_active_subscriptions(3);
        set_connection_state(3);
        record_dispatch_duration(Duration::from_micros(50));
    }
}
