//! Debounces the remote "session active" flag.
//!
//! Polls are short relative to replication lag, so one isolated `false`
//! reading from the remote is more often a glitch than a real close. The
//! filter only accepts a close after `threshold` consecutive `false` readings
//! that follow an active state, which bounds detection latency to roughly
//! `threshold * poll_interval`.

pub const DEFAULT_CLOSE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StabilityFilter {
    threshold: u32,
    consecutive_false: u32,
}

impl Default for StabilityFilter {
    fn default() -> Self {
        Self::new(DEFAULT_CLOSE_THRESHOLD)
    }
}

impl StabilityFilter {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive_false: 0,
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Consecutive `false` readings seen while the stable value was `true`.
    pub fn pending_false(&self) -> u32 {
        self.consecutive_false
    }

    pub fn apply(&mut self, previous_stable_active: bool, raw_active: bool) -> bool {
        if raw_active {
            self.consecutive_false = 0;
            return true;
        }
        if !previous_stable_active {
            return false;
        }
        self.consecutive_false = self.consecutive_false.saturating_add(1);
        self.consecutive_false < self.threshold
    }

    /// Explicit session start or stop: the next reading starts a fresh streak.
    pub fn reset(&mut self) {
        self.consecutive_false = 0;
    }
}

/// Edge of the filtered value between two readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Opened,
    Closed,
}

pub fn transition(previous: bool, next: bool) -> Option<Transition> {
    match (previous, next) {
        (false, true) => Some(Transition::Opened),
        (true, false) => Some(Transition::Closed),
        _ => None,
    }
}
