//! Shared harness: a client wired to a loopback streamer.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use td_streamer::{
    ClientConfig, DecodedRecord, DeliveryConfig, LoopbackPeer, LoopbackServer, SessionCredentials,
    SessionSettings, StaticAuthProvider, StreamError, StreamingClient, ChannelSink, Service,
    loopback,
};
use td_streamer::infrastructure::td::messages::RequestEnvelope;

pub struct Harness {
    pub client: StreamingClient,
    pub server: LoopbackServer,
    pub records: mpsc::Receiver<DecodedRecord>,
    pub errors: mpsc::UnboundedReceiver<StreamError>,
}

pub fn credentials() -> SessionCredentials {
    SessionCredentials {
        access_token: "access-token".to_string(),
        streamer_session_id: "streamer-app".to_string(),
        account_id: "123456789".to_string(),
        subscription_key: "subKeyAbc".to_string(),
        token_expiry: Utc::now() + chrono::Duration::hours(1),
    }
}

pub fn expired_credentials() -> SessionCredentials {
    SessionCredentials {
        token_expiry: Utc::now() - chrono::Duration::hours(1),
        ..credentials()
    }
}

/// Settings with short backoff so reconnect tests run quickly.
pub fn fast_settings() -> SessionSettings {
    SessionSettings {
        reconnect_delay_initial: Duration::from_millis(10),
        reconnect_delay_max: Duration::from_millis(50),
        ..SessionSettings::default()
    }
}

pub fn harness(settings: SessionSettings) -> Harness {
    harness_with(settings, credentials())
}

pub fn harness_with(settings: SessionSettings, credentials: SessionCredentials) -> Harness {
    let (connector, server) = loopback();
    let (sink, records) = ChannelSink::new(64);
    let client = StreamingClient::new(
        ClientConfig {
            url: "loopback://streamer".to_string(),
            session: settings,
            delivery: DeliveryConfig::default(),
        },
        Arc::new(StaticAuthProvider::new(credentials)),
        Arc::new(connector),
        Arc::new(sink),
    );

    let (error_tx, errors) = mpsc::unbounded_channel();
    client.on_error(move |error| {
        let _ = error_tx.send(error.clone());
    });

    Harness {
        client,
        server,
        records,
        errors,
    }
}

/// Accept one connection and acknowledge its login.
pub async fn accept_login(server: &mut LoopbackServer) -> LoopbackPeer {
    let mut peer = server.accept().await.expect("client connects");
    let login = peer.recv_request().await.expect("login request");
    assert_eq!(login.service, "ADMIN");
    assert_eq!(login.command, "LOGIN");
    assert!(peer.respond(&login, 0, "Login successful"));
    peer
}

/// Connect the client and complete the login from the server side.
pub async fn connect(harness: &mut Harness) -> LoopbackPeer {
    let (result, peer) = tokio::join!(harness.client.connect(), accept_login(&mut harness.server));
    result.expect("connect succeeds");
    peer
}

/// Subscribe and acknowledge the request. Returns the request as sent.
pub async fn subscribe_acked(
    client: &StreamingClient,
    peer: &mut LoopbackPeer,
    service: Service,
    symbols: &[&str],
    fields: &[&str],
) -> RequestEnvelope {
    let handle = client.subscribe(service, symbols, fields).await.unwrap();
    let request = peer.recv_request().await.expect("subscription request");
    assert!(peer.respond(&request, 0, "SUBS command succeeded"));
    handle.response().await.unwrap();
    request
}

/// Unsubscribe and acknowledge the request. Returns the request as sent.
pub async fn unsubscribe_acked(
    client: &StreamingClient,
    peer: &mut LoopbackPeer,
    service: Service,
    symbols: &[&str],
) -> RequestEnvelope {
    let handle = client.unsubscribe(service, symbols).await.unwrap();
    let request = peer.recv_request().await.expect("unsubscription request");
    assert!(peer.respond(&request, 0, "UNSUBS command succeeded"));
    handle.response().await.unwrap();
    request
}
