//! Tick-polled timers. Nothing here sleeps; owners call `expired`/`poll` from the
//! control tick with the current instant.
use std::time::Duration;
use tokio::time::Instant;

/// One-shot timeout. Cancelling an expired or already-cancelled deadline is a no-op.
#[derive(Debug, Clone, Default)]
pub struct Deadline {
    due: Option<Instant>,
}

impl Deadline {
    pub fn new() -> Self {
        Self { due: None }
    }

    pub fn arm(&mut self, now: Instant, after: Duration) {
        self.due = Some(now + after);
    }

    pub fn cancel(&mut self) {
        self.due = None;
    }

    pub fn is_armed(&self) -> bool {
        self.due.is_some()
    }

    pub fn due(&self) -> Option<Instant> {
        self.due
    }

    /// True exactly once, on the first poll at or after the due instant.
    pub fn expired(&mut self, now: Instant) -> bool {
        match self.due {
            Some(due) if now >= due => {
                self.due = None;
                true
            }
            _ => false,
        }
    }
}

/// Repeats every `period` until stopped.
#[derive(Debug, Clone)]
pub struct Repeater {
    period: Duration,
    next: Option<Instant>,
}

impl Repeater {
    pub fn new(period: Duration) -> Self {
        Self { period, next: None }
    }

    pub fn start(&mut self, now: Instant) {
        self.next = Some(now + self.period);
    }

    pub fn stop(&mut self) {
        self.next = None;
    }

    pub fn is_running(&self) -> bool {
        self.next.is_some()
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// True when a period boundary has passed since the last fire. A late poll fires
    /// once and re-phases rather than bursting.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.next {
            Some(next) if now >= next => {
                let mut following = next + self.period;
                if following <= now {
                    following = now + self.period;
                }
                self.next = Some(following);
                true
            }
            _ => false,
        }
    }
}
