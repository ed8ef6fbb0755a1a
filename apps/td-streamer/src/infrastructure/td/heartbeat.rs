//! Idle Watchdog
//!
//! The streamer sends `notify` heartbeats while a session is logged in.
//! The watchdog tracks the last inbound activity (heartbeat or data) and
//! reports expiry once nothing has arrived for the idle timeout; the
//! session treats that as a lost transport.
//!
//! Uses `tokio::time::Instant` so tests can pause and advance the clock.

use std::time::Duration;

use tokio::time::Instant;

/// Tracks inbound activity for one connection.
#[derive(Debug, Clone)]
pub struct IdleWatchdog {
    timeout: Option<Duration>,
    last_activity: Instant,
    heartbeats: u64,
}

impl IdleWatchdog {
    /// Create a watchdog. A zero timeout disables it.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout: (!timeout.is_zero()).then_some(timeout),
            last_activity: Instant::now(),
            heartbeats: 0,
        }
    }

    /// Record inbound data.
    pub fn record_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Record an inbound heartbeat.
    pub fn record_heartbeat(&mut self) {
        self.heartbeats += 1;
        self.record_activity();
    }

    /// Reset for a new connection.
    pub fn reset(&mut self) {
        self.last_activity = Instant::now();
        self.heartbeats = 0;
    }

    /// When the watchdog fires if nothing else arrives.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|timeout| self.last_activity + timeout)
    }

    /// Whether the idle timeout has elapsed at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|deadline| deadline <= now)
    }

    /// Time since the last activity.
    #[must_use]
    pub fn time_since_activity(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Heartbeats seen on this connection.
    #[must_use]
    pub const fn heartbeat_count(&self) -> u64 {
        self.heartbeats
    }

    /// Complete once the deadline passes. Never completes when disabled.
    pub async fn expired(&self) {
        match self.deadline() {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}
