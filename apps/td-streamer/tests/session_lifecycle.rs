//! Session Lifecycle Integration Tests
//!
//! Connect, login, reconnect with replay, idle detection and shutdown,
//! driven against the loopback streamer.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::time::Duration;

use tokio::time::{Instant, timeout};

use common::{
    accept_login, connect, expired_credentials, fast_settings, harness, harness_with,
    subscribe_acked, unsubscribe_acked,
};
use td_streamer::{ConnectionState, Service, SessionSettings, StreamError};

// =============================================================================
// Connect and Login
// =============================================================================

#[tokio::test]
async fn connect_logs_in_and_becomes_active() {
    let mut h = harness(SessionSettings::default());
    let server = &mut h.server;

    let (result, login) = tokio::join!(h.client.connect(), async {
        let mut peer = server.accept().await.unwrap();
        let login = peer.recv_request().await.unwrap();
        peer.respond(&login, 0, "Login successful");
        (peer, login)
    });
    result.unwrap();
    let (_peer, login) = login;

    assert_eq!(h.client.state(), ConnectionState::Active);
    assert_eq!(login.request_id, "0");
    assert_eq!(login.account, "123456789");
    assert_eq!(login.source, "streamer-app");
    assert_eq!(login.parameter("token"), Some("access-token"));
    assert_eq!(login.parameter("version"), Some("1.0"));
    assert!(
        login
            .parameter("credential")
            .unwrap()
            .contains("userid=123456789")
    );
}

#[tokio::test]
async fn expired_credentials_still_send_login_and_surface_rejection() {
    let mut h = harness_with(SessionSettings::default(), expired_credentials());
    let mut states = h.client.state_changes();
    let server = &mut h.server;

    let (result, ()) = tokio::join!(h.client.connect(), async {
        let mut peer = server.accept().await.unwrap();
        let login = peer.recv_request().await.unwrap();
        assert_eq!(login.command, "LOGIN");
        peer.respond(&login, 3, "Login denied");
    });

    assert!(matches!(
        result,
        Err(StreamError::Authentication { code: 3, .. })
    ));
    assert_eq!(h.client.state(), ConnectionState::Disconnected);
    assert!(states.has_changed().unwrap());
    assert_ne!(*states.borrow_and_update(), ConnectionState::Active);
    assert!(matches!(
        h.client.wait().await,
        Err(StreamError::Authentication { .. })
    ));
    // A login rejection ends the attempt without retrying.
    assert_eq!(h.server.connect_count(), 1);
}

#[tokio::test]
async fn connect_retries_refused_transports() {
    let mut h = harness(SessionSettings {
        connect_attempts: 3,
        ..fast_settings()
    });
    h.server.fail_next(2);

    let _peer = connect(&mut h).await;
    assert_eq!(h.server.connect_count(), 3);
    assert_eq!(h.client.state(), ConnectionState::Active);
}

#[tokio::test]
async fn connect_gives_up_after_configured_attempts() {
    let h = harness(SessionSettings {
        connect_attempts: 2,
        ..fast_settings()
    });
    h.server.fail_next(5);

    let err = h.client.connect().await.unwrap_err();
    assert!(matches!(err, StreamError::Transport(_)));
    assert_eq!(h.server.connect_count(), 2);
    assert_eq!(h.client.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn missing_login_response_times_out() {
    let mut h = harness(SessionSettings {
        connect_attempts: 1,
        login_timeout: Duration::from_secs(5),
        ..SessionSettings::default()
    });
    let server = &mut h.server;

    let (result, _peer) = tokio::join!(h.client.connect(), async {
        let mut peer = server.accept().await.unwrap();
        let _login = peer.recv_request().await.unwrap();
        peer
    });
    assert!(matches!(result, Err(StreamError::Transport(_))));
}

#[tokio::test]
async fn second_connect_is_rejected_while_running() {
    let mut h = harness(SessionSettings::default());
    let _peer = connect(&mut h).await;

    assert_eq!(h.client.connect().await, Err(StreamError::AlreadyConnected));
}

// =============================================================================
// Idle Detection and Reconnect
// =============================================================================

#[tokio::test(start_paused = true)]
async fn idle_timeout_moves_active_session_to_reconnecting() {
    let mut h = harness(SessionSettings {
        idle_timeout: Duration::from_secs(30),
        ..SessionSettings::default()
    });
    let _peer = connect(&mut h).await;
    let started = Instant::now();

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert_eq!(h.client.state(), ConnectionState::Active);

    let mut states = h.client.state_changes();
    timeout(
        Duration::from_secs(2),
        states.wait_for(|state| *state == ConnectionState::Reconnecting),
    )
    .await
    .expect("reconnecting within 31s of silence")
    .unwrap();

    let silent = started.elapsed();
    assert!(silent >= Duration::from_secs(30));
    assert!(silent <= Duration::from_secs(31));
}

#[tokio::test(start_paused = true)]
async fn heartbeats_keep_session_active() {
    let mut h = harness(SessionSettings {
        idle_timeout: Duration::from_secs(30),
        ..SessionSettings::default()
    });
    let peer = connect(&mut h).await;

    for _ in 0..4 {
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(peer.send_heartbeat());
    }
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.client.state(), ConnectionState::Active);
    assert_eq!(h.server.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn frames_without_stream_traffic_do_not_reset_idle_timer() {
    let mut h = harness(SessionSettings {
        idle_timeout: Duration::from_secs(30),
        ..SessionSettings::default()
    });
    let peer = connect(&mut h).await;
    let mut states = h.client.state_changes();
    let started = Instant::now();

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(peer.send_raw("{}"));
    assert!(peer.send_raw(
        r#"{"response":[{"service":"ADMIN","command":"QOS","requestid":"77","content":{"code":0,"msg":"ok"}}]}"#
    ));

    timeout(
        Duration::from_secs(12),
        states.wait_for(|state| *state == ConnectionState::Reconnecting),
    )
    .await
    .expect("empty and response-only frames keep no session alive")
    .unwrap();
    assert!(started.elapsed() <= Duration::from_secs(31));
}

#[tokio::test]
async fn reconnect_replays_only_active_subscriptions() {
    let mut h = harness(fast_settings());
    let mut peer = connect(&mut h).await;

    subscribe_acked(
        &h.client,
        &mut peer,
        Service::Quote,
        &["AAPL", "MSFT"],
        &["bid-price", "ask-price"],
    )
    .await;
    subscribe_acked(&h.client, &mut peer, Service::ChartEquity, &["SPY"], &[]).await;
    unsubscribe_acked(&h.client, &mut peer, Service::Quote, &["MSFT"]).await;
    unsubscribe_acked(&h.client, &mut peer, Service::ChartEquity, &[]).await;

    peer.close();

    let mut peer = accept_login(&mut h.server).await;
    let replay = peer.recv_request().await.unwrap();
    assert_eq!(replay.service, "QUOTE");
    assert_eq!(replay.command, "SUBS");
    assert_eq!(replay.request_id, "1");
    assert_eq!(replay.parameter("keys"), Some("AAPL"));
    assert_eq!(replay.parameter("fields"), Some("1,2"));
    peer.respond(&replay, 0, "SUBS command succeeded");

    assert!(
        timeout(Duration::from_millis(100), peer.recv_request())
            .await
            .is_err(),
        "nothing but the active subscription is replayed"
    );
    assert_eq!(h.client.state(), ConnectionState::Active);
    assert_eq!(h.server.connect_count(), 2);
}

#[tokio::test]
async fn in_flight_requests_fail_when_connection_drops() {
    let mut h = harness(fast_settings());
    let mut peer = connect(&mut h).await;

    let handle = h
        .client
        .subscribe(Service::Quote, &["AAPL"], &["bid-price"])
        .await
        .unwrap();
    let _request = peer.recv_request().await.unwrap();
    peer.close();

    assert!(matches!(
        handle.response().await,
        Err(StreamError::Transport(_))
    ));
}

#[tokio::test]
async fn exhausted_reconnects_report_connection_lost_and_keep_subscriptions() {
    let mut h = harness(SessionSettings {
        max_reconnect_attempts: 2,
        ..fast_settings()
    });
    let mut peer = connect(&mut h).await;
    subscribe_acked(&h.client, &mut peer, Service::Quote, &["AAPL"], &["bid-price"]).await;

    h.server.fail_next(10);
    peer.close();

    assert_eq!(
        h.client.wait().await,
        Err(StreamError::ConnectionLost { attempts: 2 })
    );
    assert_eq!(h.client.state(), ConnectionState::Disconnected);
    assert_eq!(h.server.connect_count(), 3);

    let mut lost = false;
    while let Ok(error) = h.errors.try_recv() {
        lost |= matches!(error, StreamError::ConnectionLost { attempts: 2 });
    }
    assert!(lost, "error hook saw ConnectionLost");

    // Shutdown with nothing running leaves the retained subscriptions alone.
    h.client.shutdown().await;
    assert_eq!(h.client.state(), ConnectionState::Disconnected);

    // A later connect replays what was active when the session ended.
    h.server.fail_next(0);
    let mut peer = connect(&mut h).await;
    let replay = peer.recv_request().await.unwrap();
    assert_eq!(replay.command, "SUBS");
    assert_eq!(replay.parameter("keys"), Some("AAPL"));
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test]
async fn shutdown_logs_out_and_is_idempotent() {
    let mut h = harness(SessionSettings::default());
    let mut peer = connect(&mut h).await;
    subscribe_acked(&h.client, &mut peer, Service::Quote, &["AAPL"], &[]).await;

    h.client.shutdown().await;
    assert_eq!(h.client.state(), ConnectionState::Closed);

    let logout = peer.recv_request().await.unwrap();
    assert_eq!(logout.service, "ADMIN");
    assert_eq!(logout.command, "LOGOUT");
    assert!(peer.recv_request().await.is_none());

    h.client.shutdown().await;
    assert_eq!(h.client.state(), ConnectionState::Closed);
    assert_eq!(h.client.wait().await, Ok(()));
    assert!(matches!(
        h.client.subscribe(Service::Quote, &["MSFT"], &["bid-price"]).await,
        Err(StreamError::Closed)
    ));
    assert_eq!(h.client.connect().await, Err(StreamError::Closed));
}

#[tokio::test]
async fn shutdown_during_reconnect_backoff_closes_promptly() {
    let mut h = harness(SessionSettings {
        reconnect_delay_initial: Duration::from_secs(60),
        reconnect_delay_max: Duration::from_secs(60),
        ..SessionSettings::default()
    });
    let mut peer = connect(&mut h).await;

    let mut states = h.client.state_changes();
    peer.close();
    states
        .wait_for(|state| *state == ConnectionState::Reconnecting)
        .await
        .unwrap();

    timeout(Duration::from_secs(5), h.client.shutdown())
        .await
        .expect("shutdown does not wait for the backoff");
    assert_eq!(h.client.state(), ConnectionState::Closed);
    assert_eq!(h.server.connect_count(), 1);
}
