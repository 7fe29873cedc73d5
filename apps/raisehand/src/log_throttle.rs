//! Keeps a flaky remote from flooding the log.
//!
//! The poll loop retries forever, so a long outage would otherwise emit one
//! warning per tick. The first few failures of a streak are loud, the rest go
//! to `debug`, and the first success after a quiet stretch reports once.

use tracing::{debug, info, warn};

pub const DEFAULT_FAILURE_LOG_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureLevel {
    Warn,
    Suppressed,
}

#[derive(Debug, Clone)]
pub struct PollFailureLog {
    threshold: u32,
    streak: u32,
}

impl Default for PollFailureLog {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_LOG_THRESHOLD)
    }
}

impl PollFailureLog {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            streak: 0,
        }
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }

    pub fn record_failure(&mut self) -> FailureLevel {
        self.streak = self.streak.saturating_add(1);
        if self.streak <= self.threshold {
            FailureLevel::Warn
        } else {
            FailureLevel::Suppressed
        }
    }

    /// Returns the length of the streak that just ended if part of it was
    /// suppressed.
    pub fn record_success(&mut self) -> Option<u32> {
        let streak = std::mem::take(&mut self.streak);
        (streak > self.threshold).then_some(streak)
    }

    pub fn failure(&mut self, event_code: &str, err: &dyn std::fmt::Display) {
        match self.record_failure() {
            FailureLevel::Warn => warn!(
                target: "raisehand.poll",
                event_code = %event_code,
                streak = self.streak,
                error = %err,
                "poll failed"
            ),
            FailureLevel::Suppressed => debug!(
                target: "raisehand.poll",
                event_code = %event_code,
                streak = self.streak,
                error = %err,
                "poll failed"
            ),
        }
    }

    pub fn success(&mut self, event_code: &str) {
        if let Some(streak) = self.record_success() {
            info!(
                target: "raisehand.poll",
                event_code = %event_code,
                failures = streak,
                "poll recovered"
            );
        }
    }
}
