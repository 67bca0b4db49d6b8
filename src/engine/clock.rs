// src/engine/clock.rs

//! Remaining-time sources.
//!
//! Two distinct types on purpose: [`ServerDeadline`] is the only value that may
//! gate a write, and [`Countdown`] only drives the participant's display and the
//! automatic submission trigger.

use chrono::{DateTime, Duration, Utc};

/// Authoritative end of an exam window, evaluated on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerDeadline {
    end_time: DateTime<Utc>,
}

impl ServerDeadline {
    pub fn new(end_time: DateTime<Utc>) -> Self {
        Self { end_time }
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        self.end_time
    }

    /// Whole seconds left at `now`, never negative.
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        (self.end_time - now).num_seconds().max(0)
    }

    /// Whether a write arriving at `now` is still inside the window plus `grace`.
    pub fn accepts_writes(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        now <= self.end_time + grace
    }

    pub fn is_late(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        !self.accepts_writes(now, grace)
    }
}

/// Result of one countdown step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Running(u64),
    /// Emitted exactly once, on the step that reaches zero.
    Expired,
    /// Already expired or halted.
    Idle,
}

/// Client-side countdown seeded once from the server's remaining seconds.
/// Never consults the local wall clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Countdown {
    remaining: u64,
    done: bool,
}

impl Countdown {
    pub fn from_server(remaining_seconds: i64) -> Self {
        Self {
            remaining: u64::try_from(remaining_seconds).unwrap_or(0),
            done: false,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Advances by one second.
    pub fn tick(&mut self) -> Tick {
        if self.done {
            return Tick::Idle;
        }
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            self.done = true;
            Tick::Expired
        } else {
            Tick::Running(self.remaining)
        }
    }

    /// Stops the countdown without firing expiry.
    pub fn halt(&mut self) {
        self.done = true;
    }
}
