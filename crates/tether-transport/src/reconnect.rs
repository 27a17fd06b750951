//! Reconnect backoff policy.
//!
//! A broken channel on the satellite retries with exponential backoff while
//! the session above it stays suspended. Delays double from one second up
//! to a cap; once the cumulative wait crosses the ceiling the schedule ends
//! and the session is disposed.

use std::time::Duration;

/// Backoff parameters. Defaults match the protocol constants.
#[derive(Clone, Copy, Debug)]
pub struct ReconnectPolicy {
    /// First retry delay.
    pub initial: Duration,
    /// Largest single delay.
    pub cap: Duration,
    /// Total waiting budget before giving up.
    pub ceiling: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            ceiling: Duration::from_secs(600),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.cap)
    }

    /// Fresh schedule starting from the first retry.
    pub fn schedule(&self) -> ReconnectSchedule {
        ReconnectSchedule { policy: *self, attempt: 0, waited: Duration::ZERO }
    }
}

/// Iterator over retry delays, exhausted once the ceiling is reached.
#[derive(Clone, Copy, Debug)]
pub struct ReconnectSchedule {
    policy: ReconnectPolicy,
    attempt: u32,
    waited: Duration,
}

impl ReconnectSchedule {
    /// Total time the schedule has handed out so far.
    pub fn waited(&self) -> Duration {
        self.waited
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

impl Iterator for ReconnectSchedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.waited >= self.policy.ceiling {
            return None;
        }
        let delay = self.policy.delay_for(self.attempt);
        self.attempt += 1;
        self.waited += delay;
        Some(delay)
    }
}
