//! Idle-timer liveness checks for an open channel.
//!
//! Any inbound frame proves the connection alive. After
//! `idle_interval` of silence a ping is sent; if nothing arrives within
//! `pong_timeout` after that, the connection is declared dead and the
//! session takes the same path as a disconnect.

use std::time::Duration;

use tokio::time::Instant;

/// Heartbeat timings.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Silence after which a ping is sent.
    pub idle_interval: Duration,
    /// How long to wait for any frame after a ping.
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_secs(20),
            pong_timeout: Duration::from_secs(10),
        }
    }
}

/// What the session should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Nothing due before this instant.
    Wait(Instant),
    SendPing,
    Dead,
}

/// Tracks inbound traffic for one channel.
#[derive(Debug)]
pub struct Liveness {
    config: HeartbeatConfig,
    last_seen: Instant,
    ping_sent_at: Option<Instant>,
}

impl Liveness {
    pub fn new(config: HeartbeatConfig, now: Instant) -> Self {
        Self {
            config,
            last_seen: now,
            ping_sent_at: None,
        }
    }

    /// Record an inbound frame.
    pub fn observe(&mut self, now: Instant) {
        self.last_seen = now;
        self.ping_sent_at = None;
    }

    pub fn ping_sent(&mut self, now: Instant) {
        self.ping_sent_at = Some(now);
    }

    pub fn poll(&self, now: Instant) -> HeartbeatAction {
        match self.ping_sent_at {
            Some(sent) => {
                let deadline = sent + self.config.pong_timeout;
                if now >= deadline {
                    HeartbeatAction::Dead
                } else {
                    HeartbeatAction::Wait(deadline)
                }
            }
            None => {
                let due = self.last_seen + self.config.idle_interval;
                if now >= due {
                    HeartbeatAction::SendPing
                } else {
                    HeartbeatAction::Wait(due)
                }
            }
        }
    }
}
