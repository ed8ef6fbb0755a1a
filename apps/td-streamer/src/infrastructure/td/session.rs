//! Session Task
//!
//! One task per client session. It owns the transport, subscription
//! registry, pending request table, dispatcher, delivery adapter and idle
//! watchdog, and walks the connection state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Authenticating -> Active -> Draining -> Disconnected -> Closed
//!                     ^                             |
//!                     +------- Reconnecting <-------+
//! ```
//!
//! Client calls arrive as [`SessionCommand`]s over a bounded channel and
//! are only read while Active. Shutdown is signalled through a
//! `CancellationToken` so it is observed in every state, including
//! backoff sleeps.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::application::ports::{AuthProvider, Connector, RecordSink, Transport, TransportError};
use crate::domain::schema::Service;
use crate::domain::streaming::{QosLevel, SessionCredentials};
use crate::domain::subscription::{Subscription, SubscriptionRegistry};
use crate::error::{StreamError, StreamResult};
use crate::infrastructure::config::SessionSettings;
use crate::infrastructure::delivery::{DeliveryAdapter, DeliveryConfig, DeliveryCounters};
use crate::infrastructure::metrics;
use crate::infrastructure::td::codec::JsonCodec;
use crate::infrastructure::td::dispatcher::{DispatchReport, Dispatcher};
use crate::infrastructure::td::handlers::HandlerRegistry;
use crate::infrastructure::td::heartbeat::IdleWatchdog;
use crate::infrastructure::td::messages::RequestEnvelope;
use crate::infrastructure::td::pending::{PendingRequests, ReplySender};
use crate::infrastructure::td::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::infrastructure::td::requests::{ADMIN_SERVICE, RequestBuilder, commands};

/// How often the pending table is swept for expired or cancelled entries.
const SWEEP_INTERVAL: Duration = Duration::from_millis(250);

// =============================================================================
// Connection State
// =============================================================================

/// Lifecycle state of a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No session is running.
    #[default]
    Disconnected,
    /// Opening the transport.
    Connecting,
    /// Waiting for the login response.
    Authenticating,
    /// Logged in and streaming.
    Active,
    /// Transport lost; backing off before the next attempt.
    Reconnecting,
    /// Shutting down: flushing records and logging out.
    Draining,
    /// Shut down by the caller. Terminal.
    Closed,
}

impl ConnectionState {
    /// Numeric code published on the connection state gauge.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Authenticating => 2,
            Self::Active => 3,
            Self::Reconnecting => 4,
            Self::Draining => 5,
            Self::Closed => 6,
        }
    }

    /// Get the string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Active => "active",
            Self::Reconnecting => "reconnecting",
            Self::Draining => "draining",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Session Plumbing
// =============================================================================

/// A client call forwarded to the session task.
#[derive(Debug)]
pub(crate) enum SessionCommand {
    Subscribe {
        subscription: Subscription,
        reply: ReplySender,
    },
    Unsubscribe {
        service: Service,
        symbols: Vec<String>,
        reply: ReplySender,
    },
    SetQos {
        level: QosLevel,
        reply: ReplySender,
    },
}

impl SessionCommand {
    fn reject(self, error: StreamError) {
        let reply = match self {
            Self::Subscribe { reply, .. }
            | Self::Unsubscribe { reply, .. }
            | Self::SetQos { reply, .. } => reply,
        };
        let _ = reply.send(Err(error));
    }
}

/// Everything a session needs that outlives it.
pub(crate) struct SessionContext {
    pub url: String,
    pub settings: SessionSettings,
    pub delivery: DeliveryConfig,
    pub auth: Arc<dyn AuthProvider>,
    pub connector: Arc<dyn Connector>,
    pub sink: Arc<dyn RecordSink>,
    pub handlers: Arc<HandlerRegistry>,
    pub counters: Arc<DeliveryCounters>,
    pub state: watch::Sender<ConnectionState>,
}

impl SessionContext {
    pub(crate) fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::info!(from = %previous, to = %state, "Session state changed");
        }
        metrics::set_connection_state(state.code());
    }
}

/// How a session ended.
#[derive(Debug)]
pub(crate) struct SessionExit {
    pub result: StreamResult<()>,
    /// Subscriptions to replay on the next `connect()`, when the session
    /// ended without a shutdown.
    pub registry: Option<SubscriptionRegistry>,
}

/// One open, logged-in connection.
struct Connection {
    transport: Box<dyn Transport>,
    builder: RequestBuilder,
    pending: PendingRequests,
    watchdog: IdleWatchdog,
}

impl Connection {
    fn track(&mut self, request: &RequestEnvelope, timeout: Duration, reply: Option<ReplySender>) {
        if let Some(request_id) = request.id() {
            self.pending
                .register(request_id, &request.service, &request.command, timeout, reply);
        }
    }
}

enum DriveExit {
    Shutdown,
    Lost(String),
}

// =============================================================================
// Session
// =============================================================================

/// The session task state.
pub(crate) struct Session {
    ctx: Arc<SessionContext>,
    registry: SubscriptionRegistry,
    commands: mpsc::Receiver<SessionCommand>,
    cancel: CancellationToken,
    dispatcher: Dispatcher,
    delivery: DeliveryAdapter,
    codec: JsonCodec,
    credentials: Option<SessionCredentials>,
    credentials_rejected: bool,
    qos: Option<QosLevel>,
}

impl Session {
    /// Create a session. Spawns the delivery writer, so this must run
    /// inside a tokio runtime.
    pub(crate) fn new(
        ctx: Arc<SessionContext>,
        registry: SubscriptionRegistry,
        commands: mpsc::Receiver<SessionCommand>,
        cancel: CancellationToken,
    ) -> Self {
        let delivery = DeliveryAdapter::spawn(
            ctx.delivery,
            Arc::clone(&ctx.sink),
            Arc::clone(&ctx.counters),
            ctx.handlers.error_callback(),
        );
        let dispatcher = Dispatcher::new(ctx.settings.field_keying, Arc::clone(&ctx.handlers));

        Self {
            ctx,
            registry,
            commands,
            cancel,
            dispatcher,
            delivery,
            codec: JsonCodec::new(),
            credentials: None,
            credentials_rejected: false,
            qos: None,
        }
    }

    /// Run the session to completion.
    ///
    /// `ready` receives the outcome of the initial connect and login.
    pub(crate) async fn run(mut self, ready: oneshot::Sender<StreamResult<()>>) -> SessionExit {
        let mut connection = match self.connect_initial().await {
            Ok(connection) => connection,
            Err(StreamError::ShuttingDown) => {
                let _ = ready.send(Err(StreamError::ShuttingDown));
                return self.finish_shutdown(None).await;
            }
            Err(error) => {
                tracing::warn!(error = %error, "Session failed to start");
                let _ = ready.send(Err(error.clone()));
                return self.finish_failed(error).await;
            }
        };
        let _ = ready.send(Ok(()));

        loop {
            match self.drive(&mut connection).await {
                DriveExit::Shutdown => return self.finish_shutdown(Some(connection)).await,
                DriveExit::Lost(reason) => {
                    tracing::warn!(reason = %reason, "Streamer connection lost");
                    connection
                        .pending
                        .fail_all(&StreamError::Transport(reason.clone()));
                    connection.transport.close().await;
                    self.ctx.set_state(ConnectionState::Reconnecting);

                    match self.reconnect().await {
                        Ok(next) => connection = next,
                        Err(StreamError::ShuttingDown) => return self.finish_shutdown(None).await,
                        Err(error) => {
                            tracing::error!(error = %error, "Giving up on streamer connection");
                            self.ctx.handlers.emit_error(&error);
                            return self.finish_failed(error).await;
                        }
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Connecting
    // -------------------------------------------------------------------------

    async fn connect_initial(&mut self) -> StreamResult<Connection> {
        let attempts = self.ctx.settings.connect_attempts.max(1);
        let mut backoff =
            ReconnectPolicy::new(ReconnectConfig::from_session_settings(&self.ctx.settings));
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.establish().await {
                Ok(connection) => return Ok(connection),
                Err(
                    error @ (StreamError::Authentication { .. }
                    | StreamError::CredentialsUnavailable(_)
                    | StreamError::ShuttingDown),
                ) => return Err(error),
                Err(error) if attempt >= attempts => return Err(error),
                Err(error) => {
                    let delay = backoff
                        .next_delay()
                        .unwrap_or(self.ctx.settings.reconnect_delay_max);
                    tracing::warn!(
                        attempt,
                        attempts,
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "Connect attempt failed"
                    );
                    self.sleep_or_cancel(delay).await?;
                }
            }
        }
    }

    async fn reconnect(&mut self) -> StreamResult<Connection> {
        let mut backoff =
            ReconnectPolicy::new(ReconnectConfig::from_session_settings(&self.ctx.settings));

        loop {
            let Some(delay) = backoff.next_delay() else {
                return Err(StreamError::ConnectionLost {
                    attempts: backoff.attempt_count(),
                });
            };
            let attempt = backoff.attempt_count();
            metrics::record_reconnect();
            tracing::info!(
                attempt,
                delay_ms = delay.as_millis(),
                "Reconnecting to streamer"
            );
            self.sleep_or_cancel(delay).await?;

            match self.establish().await {
                Ok(connection) => {
                    tracing::info!(
                        attempt,
                        subscriptions = self.registry.len(),
                        "Reconnected to streamer"
                    );
                    return Ok(connection);
                }
                Err(StreamError::ShuttingDown) => return Err(StreamError::ShuttingDown),
                Err(error) => {
                    tracing::warn!(attempt, error = %error, "Reconnect attempt failed");
                    self.ctx.set_state(ConnectionState::Reconnecting);
                }
            }
        }
    }

    async fn sleep_or_cancel(&self, delay: Duration) -> StreamResult<()> {
        tokio::select! {
            () = self.cancel.cancelled() => Err(StreamError::ShuttingDown),
            () = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Open the transport, log in and replay subscriptions.
    async fn establish(&mut self) -> StreamResult<Connection> {
        self.ctx.set_state(ConnectionState::Connecting);
        let credentials = self.load_credentials().await?;
        let transport = self.open_transport().await?;

        self.ctx.set_state(ConnectionState::Authenticating);
        let mut connection = Connection {
            transport,
            builder: RequestBuilder::new(&credentials),
            pending: PendingRequests::new(),
            watchdog: IdleWatchdog::new(self.ctx.settings.idle_timeout),
        };

        let outcome = match self.login(&mut connection, &credentials).await {
            Ok(()) => self.activate(&mut connection).await,
            Err(error) => Err(error),
        };

        if let Err(error) = outcome {
            if matches!(error, StreamError::Authentication { .. }) {
                self.credentials_rejected = true;
            }
            connection.pending.fail_all(&error);
            connection.transport.close().await;
            return Err(error);
        }
        Ok(connection)
    }

    async fn load_credentials(&mut self) -> StreamResult<SessionCredentials> {
        if !self.credentials_rejected
            && let Some(credentials) = self.credentials.as_ref().filter(|c| !c.is_expired())
        {
            return Ok(credentials.clone());
        }

        let fetched = if self.credentials_rejected {
            self.ctx.auth.refresh_credentials().await
        } else {
            self.ctx.auth.current_credentials().await
        };
        let credentials =
            fetched.map_err(|e| StreamError::CredentialsUnavailable(e.to_string()))?;

        if credentials.is_expired() {
            tracing::warn!(
                expiry = %credentials.token_expiry,
                "Streamer token appears expired, attempting login anyway"
            );
        }
        self.credentials_rejected = false;
        self.credentials = Some(credentials.clone());
        Ok(credentials)
    }

    async fn open_transport(&self) -> StreamResult<Box<dyn Transport>> {
        let timeout = self.ctx.settings.connect_timeout;
        tracing::info!(url = %self.ctx.url, "Connecting to streamer");

        tokio::select! {
            () = self.cancel.cancelled() => Err(StreamError::ShuttingDown),
            opened = tokio::time::timeout(timeout, self.ctx.connector.connect(&self.ctx.url)) => {
                match opened {
                    Ok(Ok(transport)) => Ok(transport),
                    Ok(Err(e)) => Err(StreamError::Transport(e.to_string())),
                    Err(_) => Err(StreamError::Transport(format!(
                        "connect timed out after {timeout:?}"
                    ))),
                }
            }
        }
    }

    async fn login(
        &mut self,
        connection: &mut Connection,
        credentials: &SessionCredentials,
    ) -> StreamResult<()> {
        let timeout = self.ctx.settings.login_timeout;
        let login_id = connection.builder.peek_next_id();
        let request = connection.builder.build_login(credentials);
        connection
            .pending
            .register(login_id, ADMIN_SERVICE, commands::LOGIN, timeout, None);
        self.transmit(connection, vec![request])
            .await
            .map_err(|e| StreamError::Transport(e.to_string()))?;

        let deadline = Instant::now() + timeout;
        loop {
            let frame = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(StreamError::ShuttingDown),
                () = tokio::time::sleep_until(deadline) => {
                    return Err(StreamError::Transport(format!(
                        "no login response within {timeout:?}"
                    )));
                }
                frame = connection.transport.recv() => frame,
            };

            let text = match frame {
                Some(Ok(text)) => text,
                Some(Err(e)) => return Err(StreamError::Transport(e.to_string())),
                None => {
                    return Err(StreamError::Transport(
                        "connection closed during login".to_string(),
                    ));
                }
            };

            let report = self.dispatch(connection, &text).await;
            if let Some(resolved) = report
                .resolved
                .into_iter()
                .find(|resolved| resolved.request_id == login_id)
            {
                return resolved.outcome.map(|ack| {
                    tracing::info!(message = %ack.message, "Streamer login accepted");
                });
            }
        }
    }

    /// Enter Active: replay subscriptions and quality of service.
    async fn activate(&mut self, connection: &mut Connection) -> StreamResult<()> {
        let timeout = self.ctx.settings.request_timeout;
        let mut requests = Vec::with_capacity(self.registry.len() + 1);

        for subscription in self.registry.active_subscriptions() {
            let request = connection.builder.build_subscription(&subscription);
            connection.track(&request, timeout, None);
            requests.push(request);
        }
        if let Some(level) = self.qos {
            let request = connection.builder.build_quality_of_service(level);
            connection.track(&request, timeout, None);
            requests.push(request);
        }

        if !requests.is_empty() {
            tracing::info!(
                subscriptions = self.registry.len(),
                "Replaying subscriptions"
            );
            self.transmit(connection, requests)
                .await
                .map_err(|e| StreamError::Transport(e.to_string()))?;
        }

        connection.watchdog.reset();
        metrics::set_active_subscriptions(self.registry.symbol_count());
        self.ctx.set_state(ConnectionState::Active);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Active
    // -------------------------------------------------------------------------

    async fn drive(&mut self, connection: &mut Connection) -> DriveExit {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return DriveExit::Shutdown,
                () = connection.watchdog.expired() => {
                    tracing::warn!(
                        silent_ms = connection.watchdog.time_since_activity().as_millis(),
                        "No streamer traffic within idle timeout"
                    );
                    return DriveExit::Lost("idle timeout".to_string());
                }
                frame = connection.transport.recv() => match frame {
                    Some(Ok(text)) => {
                        self.dispatch(connection, &text).await;
                    }
                    Some(Err(e)) => return DriveExit::Lost(e.to_string()),
                    None => return DriveExit::Lost("closed by server".to_string()),
                },
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let Err(e) = self.on_command(connection, command).await {
                            return DriveExit::Lost(e.to_string());
                        }
                    }
                    None => {
                        tracing::info!("All client handles dropped");
                        return DriveExit::Shutdown;
                    }
                },
                _ = sweep.tick() => {
                    for error in connection.pending.sweep(Instant::now()) {
                        tracing::warn!(error = %error, "Request expired");
                        self.ctx.handlers.emit_error(&error);
                    }
                }
            }
        }
    }

    async fn dispatch(&self, connection: &mut Connection, text: &str) -> DispatchReport {
        let report = self
            .dispatcher
            .on_frame(text, &self.registry, &mut connection.pending, &self.delivery)
            .await;
        if report.heartbeats > 0 {
            connection.watchdog.record_heartbeat();
        } else if report.activity {
            connection.watchdog.record_activity();
        }
        report
    }

    async fn on_command(
        &mut self,
        connection: &mut Connection,
        command: SessionCommand,
    ) -> Result<(), TransportError> {
        let timeout = self.ctx.settings.request_timeout;

        let (request, reply) = match command {
            SessionCommand::Subscribe {
                subscription,
                reply,
            } => {
                let delta = self.registry.upsert(subscription);
                (connection.builder.build_subscription(&delta), reply)
            }
            SessionCommand::Unsubscribe {
                service,
                symbols,
                reply,
            } => match self.registry.remove(service, &symbols) {
                Some(delta) => (connection.builder.build_subscription(&delta), reply),
                None => match connection.builder.build_unsubscribe(service, &symbols) {
                    Ok(request) => (request, reply),
                    Err(error) => {
                        let _ = reply.send(Err(error));
                        return Ok(());
                    }
                },
            },
            SessionCommand::SetQos { level, reply } => {
                self.qos = Some(level);
                (connection.builder.build_quality_of_service(level), reply)
            }
        };

        tracing::debug!(
            service = %request.service,
            command = %request.command,
            request_id = %request.request_id,
            "Sending request"
        );
        metrics::set_active_subscriptions(self.registry.symbol_count());
        connection.track(&request, timeout, Some(reply));
        self.transmit(connection, vec![request]).await
    }

    async fn transmit(
        &self,
        connection: &mut Connection,
        requests: Vec<RequestEnvelope>,
    ) -> Result<(), TransportError> {
        let text = self
            .codec
            .encode_requests(requests)
            .map_err(|e| TransportError::Io {
                message: e.to_string(),
            })?;
        connection.transport.send(text).await
    }

    // -------------------------------------------------------------------------
    // Ending
    // -------------------------------------------------------------------------

    fn reject_commands(&mut self, error: &StreamError) {
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            command.reject(error.clone());
        }
    }

    async fn flush_delivery(&mut self) {
        let discarded = self
            .delivery
            .flush(self.ctx.settings.drain_timeout)
            .await;
        if discarded > 0 {
            tracing::warn!(discarded, "Records discarded while draining");
        }
    }

    async fn finish_shutdown(mut self, connection: Option<Connection>) -> SessionExit {
        self.ctx.set_state(ConnectionState::Draining);
        self.reject_commands(&StreamError::ShuttingDown);
        self.flush_delivery().await;

        if let Some(mut connection) = connection {
            let logout = connection.builder.build_logout();
            if let Err(e) = self.transmit(&mut connection, vec![logout]).await {
                tracing::debug!(error = %e, "Logout not sent");
            }
            connection.pending.fail_all(&StreamError::ShuttingDown);
            connection.transport.close().await;
        }

        self.registry.clear();
        metrics::set_active_subscriptions(0);
        self.ctx.set_state(ConnectionState::Disconnected);
        self.ctx.set_state(ConnectionState::Closed);
        tracing::info!("Session shut down");

        SessionExit {
            result: Ok(()),
            registry: None,
        }
    }

    async fn finish_failed(mut self, error: StreamError) -> SessionExit {
        self.reject_commands(&error);
        self.flush_delivery().await;
        metrics::set_active_subscriptions(0);
        self.ctx.set_state(ConnectionState::Disconnected);

        SessionExit {
            result: Err(error),
            registry: Some(std::mem::take(&mut self.registry)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_codes_are_distinct() {
        let states = [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Authenticating,
            ConnectionState::Active,
            ConnectionState::Reconnecting,
            ConnectionState::Draining,
            ConnectionState::Closed,
        ];
        let mut codes: Vec<u8> = states.iter().map(|s| s.code()).collect();
        codes.dedup();
        assert_eq!(codes.len(), states.len());
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
    }

    #[test]
    fn rejected_command_fails_its_handle() {
        let (reply, mut rx) = oneshot::channel();
        SessionCommand::SetQos {
            level: QosLevel::Fast,
            reply,
        }
        .reject(StreamError::ShuttingDown);
        assert_eq!(rx.try_recv().unwrap(), Err(StreamError::ShuttingDown));
    }
}
