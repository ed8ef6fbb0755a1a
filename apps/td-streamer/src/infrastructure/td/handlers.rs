//! Record and Error Handlers
//!
//! Callbacks registered on the client. Record handlers are keyed by
//! service and run on the session task before a record is queued for the
//! sink; error handlers receive every non-fatal error and warning.
//! Handlers are cloned out of the lock before being called, so a handler
//! may register further handlers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::domain::schema::Service;
use crate::domain::streaming::DecodedRecord;
use crate::error::StreamError;
use crate::infrastructure::delivery::ErrorCallback;

/// Callback for decoded records of one service.
pub type RecordHandler = Arc<dyn Fn(&DecodedRecord) + Send + Sync>;

/// Callback for non-fatal errors.
pub type ErrorHandler = Arc<dyn Fn(&StreamError) + Send + Sync>;

/// Registered callbacks.
#[derive(Default)]
pub struct HandlerRegistry {
    records: RwLock<HashMap<Service, Vec<RecordHandler>>>,
    errors: RwLock<Vec<ErrorHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("record_services", &self.records.read().len())
            .field("error_handlers", &self.errors.read().len())
            .finish()
    }
}

impl HandlerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a record handler for `service`.
    pub fn on_records(&self, service: Service, handler: RecordHandler) {
        self.records.write().entry(service).or_default().push(handler);
    }

    /// Register an error handler.
    pub fn on_error(&self, handler: ErrorHandler) {
        self.errors.write().push(handler);
    }

    /// Call every handler registered for the record's service.
    pub fn emit_record(&self, record: &DecodedRecord) {
        let handlers = self.records.read().get(&record.service).cloned();
        for handler in handlers.iter().flatten() {
            handler(record);
        }
    }

    /// Call every error handler.
    pub fn emit_error(&self, error: &StreamError) {
        let handlers = self.errors.read().clone();
        for handler in &handlers {
            handler(error);
        }
    }

    /// Error callback for the delivery adapter.
    #[must_use]
    pub fn error_callback(self: &Arc<Self>) -> ErrorCallback {
        let registry = Arc::clone(self);
        Arc::new(move |error| registry.emit_error(&error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(service: Service) -> DecodedRecord {
        DecodedRecord {
            service,
            symbol: "AAPL".into(),
            fields: BTreeMap::new(),
            server_time: None,
            received_at: Utc::now(),
        }
    }

    #[test]
    fn record_handlers_are_per_service() {
        let registry = HandlerRegistry::new();
        let quotes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&quotes);
        registry.on_records(
            Service::Quote,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        registry.emit_record(&record(Service::Quote));
        registry.emit_record(&record(Service::ChartEquity));
        assert_eq!(quotes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn error_callback_reaches_handlers() {
        let registry = Arc::new(HandlerRegistry::new());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        registry.on_error(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let callback = registry.error_callback();
        callback(StreamError::Sink("full".into()));
        registry.emit_error(&StreamError::NotConnected);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn handler_may_register_more_handlers() {
        let registry = Arc::new(HandlerRegistry::new());
        let inner = Arc::clone(&registry);
        registry.on_error(Arc::new(move |_| {
            inner.on_error(Arc::new(|_| {}));
        }));
        registry.emit_error(&StreamError::Closed);
        assert_eq!(registry.errors.read().len(), 2);
    }
}
