//! Per-session retransmission/idle timer
//!
//! The event loop has no timer objects of its own, so a timer is just a
//! deadline. The router polls with the earliest armed deadline as its wait
//! timeout and fires every timer whose deadline has passed.

use std::time::{Duration, Instant};

/// One session's retransmission timer.
///
/// The duration always comes from the engine; this type never computes a
/// schedule of its own.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitTimer {
    deadline: Option<Instant>,
}

impl RetransmitTimer {
    pub fn new() -> Self {
        RetransmitTimer { deadline: None }
    }

    /// Rearm to fire `after` from `now`, or disarm if the engine has no
    /// pending timeout
    pub fn rearm(&mut self, after: Option<Duration>, now: Instant) {
        self.deadline = after.map(|d| now + d);
    }

    /// Stop the timer
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Whether the timer is armed and its deadline is at or before `now`
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }

    /// Time left until the deadline, saturating at zero
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(now))
    }
}
