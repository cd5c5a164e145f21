//! Keepalive and reconnect supervision for one connection.
//!
//! The supervisor is a plain state machine owned by the connection worker.
//! It decides when the link is idle long enough to need a probe and how long
//! to wait before each reconnect attempt; the worker does the actual I/O.
//!
//! ```text
//! Connecting --ok--> Connected --idle--> Probing --ack--> Connected
//!                        ^                  |
//!                        |                fail
//!                        |                  v
//!                        +----ok---- Reconnecting{n} --n > max--> Failed
//! ```

use crate::config::SessionSettings;
use std::time::{Duration, Instant};

/// Supervisor phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Connected,
    Probing,
    Reconnecting { attempt: u32 },
    Failed,
}

#[derive(Debug)]
pub struct Supervisor {
    keep_alive: Option<Duration>,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    phase: Phase,
    attempt: u32,
    last_activity: Instant,
}

impl Supervisor {
    pub fn new(settings: &SessionSettings) -> Self {
        Self {
            keep_alive: settings.keep_alive_interval(),
            max_attempts: settings.reconnect_attempts,
            base_delay: Duration::from_millis(settings.reconnect_delay_ms),
            max_delay: Duration::from_millis(
                settings.max_reconnect_delay_ms.max(settings.reconnect_delay_ms),
            ),
            phase: Phase::Connecting,
            attempt: 0,
            last_activity: Instant::now(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Reconnect attempts made since the link was lost.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Transport is up again; resets the retry budget.
    pub fn connected(&mut self) {
        self.phase = Phase::Connected;
        self.attempt = 0;
        self.last_activity = Instant::now();
    }

    /// Inbound traffic counts as proof of life.
    pub fn note_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn probe_due(&self, now: Instant) -> bool {
        match (self.phase, self.keep_alive) {
            (Phase::Connected, Some(interval)) => {
                now.saturating_duration_since(self.last_activity) >= interval
            }
            _ => false,
        }
    }

    pub fn probe_started(&mut self) {
        if self.phase == Phase::Connected {
            self.phase = Phase::Probing;
        }
    }

    pub fn probe_acked(&mut self) {
        if self.phase == Phase::Probing {
            self.phase = Phase::Connected;
        }
        self.note_activity();
    }

    /// Probe failed or the transport reported a fatal error.
    pub fn link_lost(&mut self) {
        self.attempt = 0;
        self.phase = Phase::Reconnecting { attempt: 0 };
    }

    /// Delay before the next attempt, or `None` once the budget is spent.
    ///
    /// While still connecting for the first time the phase stays
    /// `Connecting`; the same budget applies.
    pub fn next_attempt(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            self.phase = Phase::Failed;
            return None;
        }
        self.attempt += 1;
        if let Phase::Reconnecting { .. } = self.phase {
            self.phase = Phase::Reconnecting {
                attempt: self.attempt,
            };
        }
        Some(self.backoff(self.attempt))
    }

    /// `base * 2^(attempt-1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }

    pub fn give_up(&mut self) {
        self.phase = Phase::Failed;
    }
}
