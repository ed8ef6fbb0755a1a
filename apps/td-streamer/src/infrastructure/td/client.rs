//! Streaming Client
//!
//! Cloneable handle over a session task. Validation happens here,
//! synchronously, before anything reaches the wire; accepted calls are
//! forwarded to the session over a bounded channel and answered through a
//! [`RequestHandle`].
//!
//! # Usage
//!
//! ```ignore
//! let client = StreamingClient::new(config, auth, Arc::new(WebSocketConnector::new()), sink);
//! client.connect().await?;
//!
//! let handle = client
//!     .subscribe(Service::Quote, &["AAPL", "MSFT"], &["bid-price", "ask-price"])
//!     .await?;
//! handle.response().await?;
//!
//! client.shutdown().await;
//! ```

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::application::ports::{AuthProvider, Connector, RecordSink};
use crate::domain::schema::Service;
use crate::domain::streaming::{DecodedRecord, QosLevel};
use crate::domain::subscription::SubscriptionRegistry;
use crate::error::{StreamError, StreamResult};
use crate::infrastructure::config::{DEFAULT_STREAMER_URL, SessionSettings, StreamerConfig};
use crate::infrastructure::delivery::{DeliveryConfig, DeliveryCounters, DeliveryStats};
use crate::infrastructure::td::handlers::HandlerRegistry;
use crate::infrastructure::td::pending::{ReplySender, RequestAck};
use crate::infrastructure::td::requests::{actives_key, prepare_subscription};
use crate::infrastructure::td::session::{
    ConnectionState, Session, SessionCommand, SessionContext,
};

const NO_FIELDS: &[&str] = &[];

/// Client construction settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Streamer WebSocket URL.
    pub url: String,
    /// Session timing and retry settings.
    pub session: SessionSettings,
    /// Delivery queue settings.
    pub delivery: DeliveryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_STREAMER_URL.to_string(),
            session: SessionSettings::default(),
            delivery: DeliveryConfig::default(),
        }
    }
}

impl From<&StreamerConfig> for ClientConfig {
    fn from(config: &StreamerConfig) -> Self {
        Self {
            url: config.url.clone(),
            session: config.session.clone(),
            delivery: config.delivery,
        }
    }
}

/// Pending answer to a request.
#[derive(Debug)]
pub struct RequestHandle {
    rx: oneshot::Receiver<Result<RequestAck, StreamError>>,
}

impl RequestHandle {
    /// Wait for the server's answer.
    ///
    /// # Errors
    ///
    /// - [`StreamError::Subscription`] if the server rejected the request
    /// - [`StreamError::RequestTimeout`] if no answer arrived in time
    /// - [`StreamError::Transport`] if the connection dropped first
    /// - [`StreamError::Closed`] if the session ended first
    pub async fn response(self) -> StreamResult<RequestAck> {
        self.rx.await.unwrap_or(Err(StreamError::Closed))
    }
}

type Outcome = watch::Receiver<Option<StreamResult<()>>>;

struct RunningSession {
    commands: mpsc::Sender<SessionCommand>,
    cancel: CancellationToken,
    done: Outcome,
}

impl RunningSession {
    fn is_finished(&self) -> bool {
        self.done.borrow().is_some()
    }
}

struct ClientInner {
    ctx: Arc<SessionContext>,
    running: Mutex<Option<RunningSession>>,
    retained: Arc<Mutex<SubscriptionRegistry>>,
}

/// Handle to a streamer session. Cheap to clone.
#[derive(Clone)]
pub struct StreamingClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for StreamingClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingClient")
            .field("url", &self.inner.ctx.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl StreamingClient {
    /// Create a client. Nothing is opened until [`connect`](Self::connect).
    #[must_use]
    pub fn new(
        config: ClientConfig,
        auth: Arc<dyn AuthProvider>,
        connector: Arc<dyn Connector>,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let ctx = SessionContext {
            url: config.url,
            settings: config.session,
            delivery: config.delivery,
            auth,
            connector,
            sink,
            handlers: Arc::new(HandlerRegistry::new()),
            counters: Arc::new(DeliveryCounters::default()),
            state,
        };

        Self {
            inner: Arc::new(ClientInner {
                ctx: Arc::new(ctx),
                running: Mutex::new(None),
                retained: Arc::new(Mutex::new(SubscriptionRegistry::new())),
            }),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start a session and wait until it is logged in.
    ///
    /// Subscriptions retained from a previous session that ended without
    /// [`shutdown`](Self::shutdown) are replayed once logged in.
    ///
    /// # Errors
    ///
    /// - [`StreamError::AlreadyConnected`] if a session is running
    /// - [`StreamError::Closed`] after `shutdown`
    /// - [`StreamError::Transport`] once all connect attempts failed
    /// - [`StreamError::Authentication`] if the login was rejected
    /// - [`StreamError::CredentialsUnavailable`] if no credentials could be
    ///   obtained
    pub async fn connect(&self) -> StreamResult<()> {
        let ready = {
            let mut running = self.inner.running.lock();
            if self.state() == ConnectionState::Closed {
                return Err(StreamError::Closed);
            }
            if running.as_ref().is_some_and(|r| !r.is_finished()) {
                return Err(StreamError::AlreadyConnected);
            }

            let (commands_tx, commands_rx) =
                mpsc::channel(self.inner.ctx.settings.command_buffer.max(1));
            let cancel = CancellationToken::new();
            let (done_tx, done_rx) = watch::channel(None);
            let (ready_tx, ready_rx) = oneshot::channel();

            let registry = std::mem::take(&mut *self.inner.retained.lock());
            let session = Session::new(
                Arc::clone(&self.inner.ctx),
                registry,
                commands_rx,
                cancel.clone(),
            );

            let retained = Arc::clone(&self.inner.retained);
            tokio::spawn(async move {
                let exit = session.run(ready_tx).await;
                if let Some(registry) = exit.registry {
                    *retained.lock() = registry;
                }
                done_tx.send_replace(Some(exit.result));
            });

            *running = Some(RunningSession {
                commands: commands_tx,
                cancel,
                done: done_rx,
            });
            ready_rx
        };

        ready.await.unwrap_or(Err(StreamError::Closed))
    }

    /// Shut the session down: flush queued records, log out, close the
    /// transport and forget all subscriptions.
    ///
    /// Ends in [`ConnectionState::Closed`]. A no-op when no session is
    /// running, so subscriptions retained after a lost connection survive
    /// for the next [`connect`](Self::connect).
    pub async fn shutdown(&self) {
        let done = self
            .inner
            .running
            .lock()
            .as_ref()
            .filter(|running| !running.is_finished())
            .map(|running| {
                running.cancel.cancel();
                running.done.clone()
            });

        let Some(mut done) = done else {
            tracing::debug!(state = %self.state(), "No session running, shutdown ignored");
            return;
        };

        if let Err(error) = wait_for_outcome(&mut done).await {
            tracing::debug!(error = %error, "Session had already ended with an error");
        }

        self.inner.retained.lock().clear();
        if self.state() != ConnectionState::Closed {
            self.inner.ctx.set_state(ConnectionState::Closed);
        }
    }

    /// Wait for the session task to end and return its result.
    ///
    /// Returns `Ok(())` immediately if no session was ever started.
    ///
    /// # Errors
    ///
    /// The error that ended the session, e.g.
    /// [`StreamError::ConnectionLost`].
    pub async fn wait(&self) -> StreamResult<()> {
        let done = self
            .inner
            .running
            .lock()
            .as_ref()
            .map(|running| running.done.clone());
        match done {
            Some(mut done) => wait_for_outcome(&mut done).await,
            None => Ok(()),
        }
    }

    /// Current session state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.ctx.state.borrow()
    }

    /// Receiver of state transitions.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.ctx.state.subscribe()
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Subscribe `symbols` of `service` with the given fields.
    ///
    /// `fields` are schema names or numeric indices; an empty list requests
    /// every field. Subscribing again merges symbols (`ADD`) or, when the
    /// field list changes, resubscribes the whole symbol set (`SUBS`).
    ///
    /// # Errors
    ///
    /// Validation errors ([`StreamError::InvalidField`],
    /// [`StreamError::InvalidSymbols`]) before anything is sent, or
    /// [`StreamError::NotConnected`] / [`StreamError::ShuttingDown`].
    pub async fn subscribe<S: AsRef<str>, F: AsRef<str>>(
        &self,
        service: Service,
        symbols: &[S],
        fields: &[F],
    ) -> StreamResult<RequestHandle> {
        let subscription = prepare_subscription(service, symbols, fields)?;
        self.send_command(|reply| SessionCommand::Subscribe {
            subscription,
            reply,
        })
        .await
    }

    /// Unsubscribe `symbols` of `service`. An empty list unsubscribes every
    /// symbol of the service.
    ///
    /// # Errors
    ///
    /// [`StreamError::NotConnected`] / [`StreamError::ShuttingDown`].
    pub async fn unsubscribe<S: AsRef<str>>(
        &self,
        service: Service,
        symbols: &[S],
    ) -> StreamResult<RequestHandle> {
        let symbols = symbols.iter().map(|s| s.as_ref().to_string()).collect();
        self.send_command(|reply| SessionCommand::Unsubscribe {
            service,
            symbols,
            reply,
        })
        .await
    }

    /// Change the update rate. The level is re-sent after reconnecting.
    ///
    /// # Errors
    ///
    /// [`StreamError::NotConnected`] / [`StreamError::ShuttingDown`].
    pub async fn set_quality_of_service(&self, level: QosLevel) -> StreamResult<RequestHandle> {
        self.send_command(|reply| SessionCommand::SetQos { level, reply })
            .await
    }

    /// Subscribe to account activity using the credentials' subscription
    /// key.
    ///
    /// # Errors
    ///
    /// [`StreamError::CredentialsUnavailable`] if the auth provider fails,
    /// otherwise as [`subscribe`](Self::subscribe).
    pub async fn subscribe_account_activity(&self) -> StreamResult<RequestHandle> {
        let credentials = self
            .inner
            .ctx
            .auth
            .current_credentials()
            .await
            .map_err(|e| StreamError::CredentialsUnavailable(e.to_string()))?;
        self.subscribe(
            Service::AccountActivity,
            &[credentials.subscription_key],
            NO_FIELDS,
        )
        .await
    }

    /// Subscribe to an actives service for a venue and duration, e.g.
    /// `("NASDAQ", "60")`.
    ///
    /// # Errors
    ///
    /// [`StreamError::InvalidSymbols`] for a non-actives service or an
    /// unsupported duration, otherwise as [`subscribe`](Self::subscribe).
    pub async fn subscribe_actives(
        &self,
        service: Service,
        venue: &str,
        duration: &str,
    ) -> StreamResult<RequestHandle> {
        let key = actives_key(service, venue, duration)?;
        self.subscribe(service, &[key], NO_FIELDS).await
    }

    async fn send_command(
        &self,
        command: impl FnOnce(ReplySender) -> SessionCommand,
    ) -> StreamResult<RequestHandle> {
        let (commands, cancel) = {
            let running = self.inner.running.lock();
            if self.state() == ConnectionState::Closed {
                return Err(StreamError::Closed);
            }
            let running = running
                .as_ref()
                .filter(|r| !r.is_finished())
                .ok_or(StreamError::NotConnected)?;
            if running.cancel.is_cancelled() {
                return Err(StreamError::ShuttingDown);
            }
            (running.commands.clone(), running.cancel.clone())
        };

        let (reply, rx) = oneshot::channel();
        commands.send(command(reply)).await.map_err(|_| {
            if cancel.is_cancelled() {
                StreamError::ShuttingDown
            } else {
                StreamError::NotConnected
            }
        })?;
        Ok(RequestHandle { rx })
    }

    // =========================================================================
    // Callbacks and Stats
    // =========================================================================

    /// Register a handler for decoded records of `service`. Handlers run on
    /// the session task before the record is queued for the sink.
    pub fn on_records(
        &self,
        service: Service,
        handler: impl Fn(&DecodedRecord) + Send + Sync + 'static,
    ) {
        self.inner.ctx.handlers.on_records(service, Arc::new(handler));
    }

    /// Register a handler for non-fatal errors and protocol warnings.
    pub fn on_error(&self, handler: impl Fn(&StreamError) + Send + Sync + 'static) {
        self.inner.ctx.handlers.on_error(Arc::new(handler));
    }

    /// Delivery counters across all sessions of this client.
    #[must_use]
    pub fn delivery_stats(&self) -> DeliveryStats {
        self.inner.ctx.counters.snapshot()
    }
}

async fn wait_for_outcome(done: &mut Outcome) -> StreamResult<()> {
    match done.wait_for(Option::is_some).await {
        Ok(outcome) => (*outcome).clone().unwrap_or(Ok(())),
        Err(_) => Err(StreamError::Closed),
    }
}
