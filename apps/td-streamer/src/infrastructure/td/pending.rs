//! Pending Request Table
//!
//! Correlates responses with outstanding requests by request id. Each entry
//! optionally carries a `oneshot` sender back to the caller's request
//! handle; replayed subscriptions are tracked without one.
//!
//! Entries leave the table in exactly one of four ways: a matching
//! response, deadline expiry, caller cancellation (handle dropped), or the
//! connection going away.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::StreamError;
use crate::infrastructure::td::messages::ResponseEntry;
use crate::infrastructure::td::requests::commands;

/// Successful response to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestAck {
    /// Request id that was acknowledged.
    pub request_id: u64,
    /// Server response code (zero).
    pub code: i64,
    /// Server message.
    pub message: String,
}

/// Sender half of a request handle.
pub type ReplySender = oneshot::Sender<Result<RequestAck, StreamError>>;

/// Outcome of matching a response.
#[derive(Debug, Clone)]
pub struct Resolved {
    /// Request id that was matched.
    pub request_id: u64,
    /// Command of the matched request.
    pub command: String,
    /// Success or the mapped failure.
    pub outcome: Result<RequestAck, StreamError>,
}

#[derive(Debug)]
struct PendingEntry {
    service: String,
    command: String,
    deadline: Instant,
    timeout: Duration,
    reply: Option<ReplySender>,
}

/// Outstanding requests for one connection.
#[derive(Debug, Default)]
pub struct PendingRequests {
    entries: HashMap<u64, PendingEntry>,
}

impl PendingRequests {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a transmitted request.
    pub fn register(
        &mut self,
        request_id: u64,
        service: &str,
        command: &str,
        timeout: Duration,
        reply: Option<ReplySender>,
    ) {
        self.entries.insert(
            request_id,
            PendingEntry {
                service: service.to_string(),
                command: command.to_string(),
                deadline: Instant::now() + timeout,
                timeout,
                reply,
            },
        );
    }

    /// Match a response. Returns `None` if no request has that id.
    pub fn resolve(&mut self, response: &ResponseEntry) -> Option<Resolved> {
        let request_id = response.id()?;
        let entry = self.entries.remove(&request_id)?;

        let outcome = if response.content.is_success() {
            Ok(RequestAck {
                request_id,
                code: response.content.code,
                message: response.content.msg.clone(),
            })
        } else if entry.command == commands::LOGIN {
            Err(StreamError::Authentication {
                code: response.content.code,
                message: response.content.msg.clone(),
            })
        } else {
            Err(StreamError::Subscription {
                service: entry.service.clone(),
                command: entry.command.clone(),
                code: response.content.code,
                message: response.content.msg.clone(),
            })
        };

        if let Some(reply) = entry.reply {
            let _ = reply.send(outcome.clone());
        }

        Some(Resolved {
            request_id,
            command: entry.command,
            outcome,
        })
    }

    /// Expire overdue entries and drop cancelled ones.
    ///
    /// Returns the timeout errors for expired entries.
    pub fn sweep(&mut self, now: Instant) -> Vec<StreamError> {
        self.entries
            .retain(|_, entry| entry.reply.as_ref().is_none_or(|reply| !reply.is_closed()));

        let expired: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        let mut errors = Vec::with_capacity(expired.len());
        for request_id in expired {
            if let Some(entry) = self.entries.remove(&request_id) {
                let error = StreamError::RequestTimeout {
                    request_id,
                    timeout: entry.timeout,
                };
                if let Some(reply) = entry.reply {
                    let _ = reply.send(Err(error.clone()));
                }
                errors.push(error);
            }
        }
        errors
    }

    /// Fail every outstanding request with `error`.
    pub fn fail_all(&mut self, error: &StreamError) {
        for (_, entry) in self.entries.drain() {
            if let Some(reply) = entry.reply {
                let _ = reply.send(Err(error.clone()));
            }
        }
    }

    /// Whether a request is outstanding.
    #[must_use]
    pub fn contains(&self, request_id: u64) -> bool {
        self.entries.contains_key(&request_id)
    }

    /// Number of outstanding requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::td::messages::ResponseContent;
    use serde_json::json;

    fn response(id: u64, code: i64) -> ResponseEntry {
        ResponseEntry {
            service: "QUOTE".into(),
            command: "SUBS".into(),
            request_id: json!(id.to_string()),
            timestamp: None,
            content: ResponseContent {
                code,
                msg: "msg".into(),
            },
        }
    }

    #[tokio::test]
    async fn success_resolves_handle() {
        let mut pending = PendingRequests::new();
        let (tx, rx) = oneshot::channel();
        pending.register(1, "QUOTE", "SUBS", Duration::from_secs(5), Some(tx));

        let resolved = pending.resolve(&response(1, 0)).unwrap();
        assert!(resolved.outcome.is_ok());
        assert_eq!(rx.await.unwrap().unwrap().request_id, 1);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn failure_maps_to_subscription_error() {
        let mut pending = PendingRequests::new();
        let (tx, rx) = oneshot::channel();
        pending.register(2, "QUOTE", "SUBS", Duration::from_secs(5), Some(tx));

        pending.resolve(&response(2, 11));
        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, StreamError::Subscription { code: 11, .. }));
    }

    #[test]
    fn login_failure_maps_to_authentication() {
        let mut pending = PendingRequests::new();
        pending.register(0, "ADMIN", "LOGIN", Duration::from_secs(5), None);

        let resolved = pending.resolve(&response(0, 3)).unwrap();
        assert_eq!(resolved.command, "LOGIN");
        assert!(matches!(
            resolved.outcome,
            Err(StreamError::Authentication { code: 3, .. })
        ));
    }

    #[test]
    fn unknown_id_is_unmatched() {
        let mut pending = PendingRequests::new();
        pending.register(1, "QUOTE", "SUBS", Duration::from_secs(5), None);
        assert!(pending.resolve(&response(99, 0)).is_none());
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_expires_overdue_entries() {
        let mut pending = PendingRequests::new();
        let (tx, rx) = oneshot::channel();
        pending.register(4, "QUOTE", "SUBS", Duration::from_secs(5), Some(tx));

        assert!(pending.sweep(Instant::now()).is_empty());
        tokio::time::advance(Duration::from_secs(6)).await;

        let errors = pending.sweep(Instant::now());
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            rx.await.unwrap(),
            Err(StreamError::RequestTimeout { request_id: 4, .. })
        ));
    }

    #[test]
    fn sweep_discards_cancelled_handles() {
        let mut pending = PendingRequests::new();
        let (tx, rx) = oneshot::channel();
        pending.register(5, "QUOTE", "SUBS", Duration::from_secs(5), Some(tx));
        pending.register(6, "QUOTE", "SUBS", Duration::from_secs(5), None);
        drop(rx);

        assert!(pending.sweep(Instant::now()).is_empty());
        assert!(!pending.contains(5));
        assert!(pending.contains(6));
    }

    #[tokio::test]
    async fn fail_all_notifies_every_handle() {
        let mut pending = PendingRequests::new();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        pending.register(1, "QUOTE", "SUBS", Duration::from_secs(5), Some(tx1));
        pending.register(2, "ADMIN", "QOS", Duration::from_secs(5), Some(tx2));

        pending.fail_all(&StreamError::Transport("closed".into()));
        assert!(pending.is_empty());
        assert!(matches!(rx1.await.unwrap(), Err(StreamError::Transport(_))));
        assert!(matches!(rx2.await.unwrap(), Err(StreamError::Transport(_))));
    }
}
