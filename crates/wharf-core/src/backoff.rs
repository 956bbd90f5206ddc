//! Client-side reconnection state machine.
//!
//! An abnormal channel close moves the session into `Reconnecting` and the
//! driver schedules attempts with exponential backoff until either an
//! attempt succeeds (which resets the backoff) or the attempt ceiling is
//! reached (`Failed`, manual intervention required). An explicit close moves
//! to `Closed` and cancels any pending attempt; the driver must not fire a
//! timer once the state says `Closed`.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2,
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connecting,
    Open,
    Reconnecting { attempt: u32 },
    Failed,
    Closed,
}

#[derive(Debug)]
pub struct ReconnectState {
    policy: ReconnectPolicy,
    phase: SessionPhase,
    attempt: u32,
}

impl ReconnectState {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            phase: SessionPhase::Connecting,
            attempt: 0,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// A connection attempt (initial or reconnect) succeeded. Resets the
    /// attempt counter so the next disruption starts from the initial delay.
    pub fn connected(&mut self) {
        if self.phase == SessionPhase::Closed {
            return;
        }
        self.attempt = 0;
        self.phase = SessionPhase::Open;
    }

    /// The channel dropped abnormally, or a reconnect attempt failed.
    /// Returns the delay before the next attempt, or `None` once the
    /// ceiling is reached and the session is `Failed`.
    pub fn next_attempt(&mut self) -> Option<Duration> {
        match self.phase {
            SessionPhase::Closed | SessionPhase::Failed => return None,
            _ => {}
        }
        if self.attempt >= self.policy.max_attempts {
            self.phase = SessionPhase::Failed;
            return None;
        }
        self.attempt += 1;
        self.phase = SessionPhase::Reconnecting {
            attempt: self.attempt,
        };
        Some(self.delay_for(self.attempt))
    }

    /// Intentional teardown. Cancels any pending reconnect attempt.
    pub fn close(&mut self) {
        self.phase = SessionPhase::Closed;
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let mut delay = self.policy.initial_delay;
        for _ in 1..attempt {
            delay = delay.saturating_mul(self.policy.multiplier);
            if delay >= self.policy.max_delay {
                return self.policy.max_delay;
            }
        }
        delay.min(self.policy.max_delay)
    }
}
