//! Frame Dispatcher
//!
//! Classifies and decodes every inbound frame on the session task:
//!
//! 1. `response` entries resolve pending requests by request id.
//! 2. `data` and `snapshot` entries are decoded with the requested field
//!    indices the registry holds for their service, handed to record
//!    handlers, then queued for the sink.
//! 3. `notify` heartbeats count as activity for the idle watchdog.
//!
//! Anomalies become [`StreamWarning`]s: logged, counted and passed to the
//! error handlers. None of them aborts the connection.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::domain::schema::{self, Service};
use crate::domain::streaming::DecodedRecord;
use crate::domain::subscription::SubscriptionRegistry;
use crate::error::{StreamError, StreamWarning};
use crate::infrastructure::config::FieldKeying;
use crate::infrastructure::delivery::DeliveryAdapter;
use crate::infrastructure::metrics;
use crate::infrastructure::td::codec::{ContentEntry, JsonCodec};
use crate::infrastructure::td::handlers::HandlerRegistry;
use crate::infrastructure::td::messages::{DataEntry, InboundFrame, NotifyEntry};
use crate::infrastructure::td::pending::{PendingRequests, Resolved};
use crate::infrastructure::td::requests::commands;

/// Summary of one dispatch cycle.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Records decoded and delivered.
    pub records: usize,
    /// Warnings raised.
    pub warnings: Vec<StreamWarning>,
    /// Responses matched to pending requests.
    pub resolved: Vec<Resolved>,
    /// Heartbeats seen.
    pub heartbeats: usize,
    /// Whether the frame carried notify, data or snapshot entries.
    /// Responses alone do not prove the stream is alive.
    pub activity: bool,
}

/// Decodes inbound frames and routes their contents.
#[derive(Debug)]
pub struct Dispatcher {
    codec: JsonCodec,
    keying: FieldKeying,
    handlers: Arc<HandlerRegistry>,
}

impl Dispatcher {
    /// Create a dispatcher.
    #[must_use]
    pub const fn new(keying: FieldKeying, handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            codec: JsonCodec::new(),
            keying,
            handlers,
        }
    }

    /// Dispatch one raw frame.
    pub async fn on_frame(
        &self,
        raw: &str,
        registry: &SubscriptionRegistry,
        pending: &mut PendingRequests,
        delivery: &DeliveryAdapter,
    ) -> DispatchReport {
        let started = Instant::now();
        metrics::record_frame_received();

        let mut report = DispatchReport::default();
        match self.codec.decode_frame(raw) {
            Ok(frame) => {
                report.activity = !frame.notify.is_empty()
                    || !frame.data.is_empty()
                    || !frame.snapshot.is_empty();
                self.dispatch(frame, registry, pending, delivery, &mut report)
                    .await;
            }
            Err(e) => {
                tracing::trace!(raw, "Unparseable frame");
                self.warn(
                    &mut report,
                    StreamWarning::MalformedFrame {
                        reason: e.to_string(),
                    },
                );
            }
        }

        metrics::record_dispatch_duration(started.elapsed());
        report
    }

    async fn dispatch(
        &self,
        frame: InboundFrame,
        registry: &SubscriptionRegistry,
        pending: &mut PendingRequests,
        delivery: &DeliveryAdapter,
        report: &mut DispatchReport,
    ) {
        for response in &frame.response {
            match pending.resolve(response) {
                Some(resolved) => {
                    self.on_resolved(&resolved);
                    report.resolved.push(resolved);
                }
                None => self.warn(
                    report,
                    StreamWarning::UnmatchedResponse {
                        request_id: response.id_text(),
                    },
                ),
            }
        }

        for notify in &frame.notify {
            self.on_notify(notify, report);
        }

        let received_at = Utc::now();
        for entry in frame.data.iter().chain(&frame.snapshot) {
            let records = self.decode_entry(entry, registry, received_at, report);
            for record in records {
                metrics::record_record_decoded(record.service);
                self.handlers.emit_record(&record);
                delivery.deliver(record).await;
                report.records += 1;
            }
        }
    }

    fn on_resolved(&self, resolved: &Resolved) {
        match &resolved.outcome {
            Ok(ack) => tracing::debug!(
                request_id = resolved.request_id,
                command = %resolved.command,
                message = %ack.message,
                "Request acknowledged"
            ),
            Err(error) if resolved.command == commands::LOGIN => tracing::debug!(
                request_id = resolved.request_id,
                error = %error,
                "Login rejected"
            ),
            Err(error) => {
                tracing::warn!(
                    request_id = resolved.request_id,
                    command = %resolved.command,
                    error = %error,
                    "Request failed"
                );
                self.handlers.emit_error(error);
            }
        }
    }

    fn on_notify(&self, notify: &NotifyEntry, report: &mut DispatchReport) {
        if notify.is_heartbeat() {
            report.heartbeats += 1;
            tracing::trace!(heartbeat = ?notify.heartbeat, "Heartbeat");
        } else {
            tracing::info!(
                service = ?notify.service,
                content = ?notify.content,
                "Streamer notice"
            );
        }
    }

    fn decode_entry(
        &self,
        entry: &DataEntry,
        registry: &SubscriptionRegistry,
        received_at: DateTime<Utc>,
        report: &mut DispatchReport,
    ) -> Vec<DecodedRecord> {
        let Some(service) = Service::from_wire(&entry.service) else {
            self.warn(
                report,
                StreamWarning::UnknownService {
                    name: entry.service.clone(),
                },
            );
            return Vec::new();
        };

        let Some(requested) = registry.requested_fields(service) else {
            self.warn(report, StreamWarning::OrphanData { service });
            return Vec::new();
        };

        let server_time = entry.timestamp.and_then(DateTime::from_timestamp_millis);
        let mut records = Vec::with_capacity(entry.content.len());

        for content in &entry.content {
            match self.codec.parse_content(content) {
                Ok(content) => {
                    let values = self.slot_values(&content, requested);
                    records.push(DecodedRecord {
                        service,
                        symbol: content.key,
                        fields: schema::decode(service, requested, &values),
                        server_time,
                        received_at,
                    });
                }
                Err(e) => self.warn(
                    report,
                    StreamWarning::MalformedContent {
                        service,
                        reason: e.to_string(),
                    },
                ),
            }
        }
        records
    }

    /// Lay the content slots out in requested-field order.
    fn slot_values(&self, content: &ContentEntry, requested: &[usize]) -> Vec<Option<Value>> {
        match self.keying {
            FieldKeying::Positional => (0..requested.len())
                .map(|position| content.slots.get(&position).cloned())
                .collect(),
            FieldKeying::Absolute => requested
                .iter()
                .map(|index| content.slots.get(index).cloned())
                .collect(),
        }
    }

    fn warn(&self, report: &mut DispatchReport, warning: StreamWarning) {
        tracing::warn!(kind = warning.kind(), "{warning}");
        metrics::record_protocol_warning(warning.kind());
        self.handlers
            .emit_error(&StreamError::Protocol(warning.clone()));
        report.warnings.push(warning);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::streaming::FieldValue;
    use crate::domain::subscription::Subscription;
    use crate::infrastructure::delivery::{DeliveryConfig, DeliveryCounters};
    use crate::infrastructure::sinks::ChannelSink;
    use rust_decimal::Decimal;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        dispatcher: Dispatcher,
        registry: SubscriptionRegistry,
        pending: PendingRequests,
        delivery: DeliveryAdapter,
        records: mpsc::Receiver<DecodedRecord>,
        handlers: Arc<HandlerRegistry>,
    }

    fn fixture(keying: FieldKeying) -> Fixture {
        let handlers = Arc::new(HandlerRegistry::new());
        let (sink, records) = ChannelSink::new(64);
        let delivery = DeliveryAdapter::spawn(
            DeliveryConfig::default(),
            Arc::new(sink),
            Arc::new(DeliveryCounters::default()),
            handlers.error_callback(),
        );
        let mut registry = SubscriptionRegistry::new();
        registry.upsert(Subscription::new(Service::Quote, &["AAPL", "MSFT"], vec![1, 2]));

        Fixture {
            dispatcher: Dispatcher::new(keying, Arc::clone(&handlers)),
            registry,
            pending: PendingRequests::new(),
            delivery,
            records,
            handlers,
        }
    }

    impl Fixture {
        async fn dispatch(&mut self, raw: &str) -> DispatchReport {
            self.dispatcher
                .on_frame(raw, &self.registry, &mut self.pending, &self.delivery)
                .await
        }
    }

    #[tokio::test]
    async fn quote_content_is_decoded_positionally() {
        let mut fx = fixture(FieldKeying::Positional);
        let report = fx
            .dispatch(r#"{"data":[{"service":"QUOTE","timestamp":1700000000000,"content":[{"key":"AAPL","0":"101.5","1":"101.7"}]}]}"#)
            .await;

        assert_eq!(report.records, 1);
        assert!(report.warnings.is_empty());

        let record = tokio::time::timeout(Duration::from_secs(1), fx.records.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.service, Service::Quote);
        assert_eq!(record.symbol, "AAPL");
        assert_eq!(record.fields.len(), 2);
        assert_eq!(
            record.field("bid-price"),
            Some(&FieldValue::Number(Decimal::new(1015, 1)))
        );
        assert_eq!(
            record.field("ask-price"),
            Some(&FieldValue::Number(Decimal::new(1017, 1)))
        );
        assert!(record.server_time.is_some());
    }

    #[tokio::test]
    async fn absolute_keying_uses_schema_indices() {
        let mut fx = fixture(FieldKeying::Absolute);
        fx.dispatch(r#"{"data":[{"service":"QUOTE","content":[{"key":"AAPL","1":"101.5","2":"101.7","3":"99"}]}]}"#)
            .await;

        let record = fx.records.recv().await.unwrap();
        assert_eq!(record.fields.len(), 2);
        assert!(record.field("last-price").is_none());
    }

    #[tokio::test]
    async fn missing_trailing_fields_stay_absent() {
        let mut fx = fixture(FieldKeying::Positional);
        fx.dispatch(r#"{"data":[{"service":"QUOTE","content":[{"key":"MSFT","0":"300.1"}]}]}"#)
            .await;

        let record = fx.records.recv().await.unwrap();
        assert_eq!(record.fields.len(), 1);
        assert!(record.field("ask-price").is_none());
    }

    #[tokio::test]
    async fn handlers_see_records_before_sink() {
        let mut fx = fixture(FieldKeying::Positional);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        fx.handlers.on_records(
            Service::Quote,
            Arc::new(move |record| sink.lock().push(record.symbol.clone())),
        );

        fx.dispatch(r#"{"snapshot":[{"service":"QUOTE","content":[{"key":"AAPL","0":"1"},{"key":"MSFT","0":"2"}]}]}"#)
            .await;
        assert_eq!(*seen.lock(), vec!["AAPL", "MSFT"]);
    }

    #[tokio::test]
    async fn unmatched_response_warns_once() {
        let mut fx = fixture(FieldKeying::Positional);
        let report = fx
            .dispatch(r#"{"response":[{"service":"QUOTE","command":"SUBS","requestid":"42","content":{"code":0,"msg":"ok"}}]}"#)
            .await;

        assert_eq!(
            report.warnings,
            vec![StreamWarning::UnmatchedResponse {
                request_id: "42".into()
            }]
        );
        assert_eq!(report.records, 0);
        assert!(report.resolved.is_empty());
    }

    #[tokio::test]
    async fn matched_response_resolves_pending() {
        let mut fx = fixture(FieldKeying::Positional);
        let (tx, rx) = tokio::sync::oneshot::channel();
        fx.pending
            .register(3, "QUOTE", "SUBS", Duration::from_secs(5), Some(tx));

        let report = fx
            .dispatch(r#"{"response":[{"service":"QUOTE","command":"SUBS","requestid":3,"content":{"code":0,"msg":"SUBS command succeeded"}}]}"#)
            .await;
        assert_eq!(report.resolved.len(), 1);
        assert_eq!(rx.await.unwrap().unwrap().message, "SUBS command succeeded");
    }

    #[tokio::test]
    async fn failed_subscription_is_reported_not_fatal() {
        let mut fx = fixture(FieldKeying::Positional);
        let errors = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        fx.handlers
            .on_error(Arc::new(move |e: &StreamError| sink.lock().push(e.clone())));
        fx.pending
            .register(4, "NEWS_HEADLINE", "SUBS", Duration::from_secs(5), None);

        fx.dispatch(r#"{"response":[{"service":"NEWS_HEADLINE","command":"SUBS","requestid":"4","content":{"code":17,"msg":"not entitled"}}]}"#)
            .await;
        assert!(matches!(
            &errors.lock()[0],
            StreamError::Subscription { code: 17, .. }
        ));
    }

    #[tokio::test]
    async fn orphan_and_unknown_services_warn() {
        let mut fx = fixture(FieldKeying::Positional);
        let report = fx
            .dispatch(r#"{"data":[{"service":"CHART_EQUITY","content":[{"key":"AAPL","0":"1"}]},{"service":"BOGUS","content":[]}]}"#)
            .await;

        assert_eq!(
            report.warnings,
            vec![
                StreamWarning::OrphanData {
                    service: Service::ChartEquity
                },
                StreamWarning::UnknownService {
                    name: "BOGUS".into()
                },
            ]
        );
        assert_eq!(report.records, 0);
    }

    #[tokio::test]
    async fn content_without_key_is_skipped() {
        let mut fx = fixture(FieldKeying::Positional);
        let report = fx
            .dispatch(r#"{"data":[{"service":"QUOTE","content":[{"0":"1"},{"key":"AAPL","0":"2"}]}]}"#)
            .await;
        assert_eq!(report.records, 1);
        assert!(matches!(
            report.warnings[0],
            StreamWarning::MalformedContent { .. }
        ));
    }

    #[tokio::test]
    async fn malformed_frame_is_dropped() {
        let mut fx = fixture(FieldKeying::Positional);
        let report = fx.dispatch("{\"data\": [").await;
        assert!(!report.activity);
        assert!(matches!(
            report.warnings[..],
            [StreamWarning::MalformedFrame { .. }]
        ));
    }

    #[tokio::test]
    async fn heartbeat_counts_as_activity() {
        let mut fx = fixture(FieldKeying::Positional);
        let report = fx.dispatch(r#"{"notify":[{"heartbeat":"1700000000000"}]}"#).await;
        assert!(report.activity);
        assert_eq!(report.heartbeats, 1);
        assert!(report.warnings.is_empty());
    }

    #[tokio::test]
    async fn responses_and_empty_frames_are_not_activity() {
        let mut fx = fixture(FieldKeying::Positional);

        let report = fx.dispatch("{}").await;
        assert!(!report.activity);
        assert!(report.warnings.is_empty());

        let report = fx
            .dispatch(r#"{"response":[{"service":"QUOTE","command":"SUBS","requestid":"7","content":{"code":0,"msg":"ok"}}]}"#)
            .await;
        assert!(!report.activity);

        let report = fx
            .dispatch(r#"{"data":[{"service":"QUOTE","content":[{"key":"MSFT","0":"1"}]}]}"#)
            .await;
        assert!(report.activity);
        assert_eq!(report.records, 1);
    }
}
