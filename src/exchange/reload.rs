use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::{LineDisposition, ReloadError};
use crate::protocol::{DeviceStateUpdate, Subsystem, RELOAD_START_MARKER};
use crate::queue::CommandQueue;
use crate::serial::LineSink;
use crate::timer::Deadline;

pub const DEFAULT_RELOAD_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReloadOutcome {
    Completed {
        subsystem: Subsystem,
        updates: Vec<DeviceStateUpdate>,
        /// Data lines collected between the markers, including skipped ones.
        collected: usize,
    },
    Failed {
        subsystem: Subsystem,
        error: ReloadError,
    },
}

#[derive(Debug)]
struct ReloadSession {
    collected: Vec<String>,
    stream_started: bool,
    started_at: Instant,
    deadline: Deadline,
}

/// Reload exchange for one subsystem. While a session is active it holds one pause on
/// the command queue, released exactly once when the session ends.
#[derive(Debug)]
pub struct ReloadExchange {
    subsystem: Subsystem,
    timeout: Duration,
    session: Option<ReloadSession>,
}

impl ReloadExchange {
    pub fn new(subsystem: Subsystem, timeout: Duration) -> Self {
        Self {
            subsystem,
            timeout,
            session: None,
        }
    }

    pub fn subsystem(&self) -> Subsystem {
        self.subsystem
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Write the reload request directly to the link and hold the queue until the
    /// stream finishes. Nothing is paused if the write itself fails.
    pub async fn request(
        &mut self,
        now: Instant,
        sink: &dyn LineSink,
        queue: &mut CommandQueue,
    ) -> Result<(), ReloadError> {
        if self.session.is_some() {
            return Err(ReloadError::AlreadyInProgress(self.subsystem));
        }
        if !sink.is_connected() {
            return Err(ReloadError::NotConnected);
        }

        let command = self.subsystem.reload_request();
        sink.send_line(&command)
            .await
            .map_err(|e| ReloadError::Link(e.to_string()))?;
        queue.pause();

        let mut deadline = Deadline::new();
        deadline.arm(now, self.timeout);
        self.session = Some(ReloadSession {
            collected: Vec::new(),
            stream_started: false,
            started_at: now,
            deadline,
        });
        log::info!("[{}] Reload requested: {}", self.subsystem, command);
        Ok(())
    }

    pub fn on_line(&mut self, line: &str, queue: &mut CommandQueue) -> LineDisposition<ReloadOutcome> {
        let Some(session) = self.session.as_mut() else {
            return LineDisposition::Ignored;
        };

        if line == RELOAD_START_MARKER {
            if session.stream_started {
                log::warn!("[{}] Repeated reload START, restarting collection", self.subsystem);
            }
            session.collected.clear();
            session.stream_started = true;
            return LineDisposition::Consumed;
        }

        if line == self.subsystem.reload_complete_marker() {
            return LineDisposition::Finished(self.complete(queue));
        }

        if session.stream_started && line.starts_with(&self.subsystem.reload_prefix()) {
            session.collected.push(line.to_string());
            return LineDisposition::Consumed;
        }

        LineDisposition::Ignored
    }

    /// Report a timeout if the session's deadline has passed. Partial data is discarded.
    pub fn poll_timeout(&mut self, now: Instant, queue: &mut CommandQueue) -> Option<ReloadOutcome> {
        let expired = self
            .session
            .as_mut()
            .map(|s| s.deadline.expired(now))
            .unwrap_or(false);
        if !expired {
            return None;
        }
        if let Some(session) = self.session.take() {
            log::warn!(
                "[{}] Reload timed out after {:?}, discarding {} lines",
                self.subsystem,
                now.saturating_duration_since(session.started_at),
                session.collected.len()
            );
        }
        queue.resume();
        Some(ReloadOutcome::Failed {
            subsystem: self.subsystem,
            error: ReloadError::Timeout(self.subsystem),
        })
    }

    /// End an active session without applying anything.
    pub fn abort(&mut self, reason: &str, queue: &mut CommandQueue) -> Option<ReloadOutcome> {
        self.session.take()?;
        log::warn!("[{}] Reload aborted: {}", self.subsystem, reason);
        queue.resume();
        Some(ReloadOutcome::Failed {
            subsystem: self.subsystem,
            error: ReloadError::Link(reason.to_string()),
        })
    }

    fn complete(&mut self, queue: &mut CommandQueue) -> ReloadOutcome {
        let lines = self
            .session
            .take()
            .map(|s| s.collected)
            .unwrap_or_default();
        queue.resume();
        let updates = DeviceStateUpdate::parse_batch(self.subsystem, &lines);
        log::info!(
            "[{}] Reload complete: {} lines, {} updates",
            self.subsystem,
            lines.len(),
            updates.len()
        );
        ReloadOutcome::Completed {
            subsystem: self.subsystem,
            updates,
            collected: lines.len(),
        }
    }
}
