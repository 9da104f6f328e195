//! Priority command queue: three FIFO bands, strict priority, minimum spacing
//! between writes, bounded retries and a pause gate.
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::serial::LineSink;

pub const DEFAULT_MIN_SPACING: Duration = Duration::from_millis(50);
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Urgent user actions (stop, valve).
    High,
    /// Ordinary button toggles.
    Normal,
    /// Sensor polling.
    Low,
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandOutcome {
    Sent,
    Failed { reason: String },
}

impl CommandOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, CommandOutcome::Sent)
    }
}

pub type ResultCallback = Box<dyn FnOnce(CommandOutcome) + Send + 'static>;

pub struct Command {
    /// Queue-assigned, unique for the queue's lifetime.
    pub id: u64,
    pub payload: String,
    pub priority: Priority,
    /// Failed send attempts so far.
    pub attempts: u32,
    pub enqueued_at: Instant,
    on_result: Option<ResultCallback>,
}

impl Command {
    fn resolve(mut self, outcome: CommandOutcome) {
        if let Some(callback) = self.on_result.take() {
            callback(outcome);
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("payload", &self.payload)
            .field("priority", &self.priority)
            .field("attempts", &self.attempts)
            .finish()
    }
}

/// What a dispatch step did, for event reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchReport {
    Sent { payload: String },
    Retrying { payload: String, attempt: u32, reason: String },
    Failed { payload: String, reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub total_sent: u64,
    pub total_failed: u64,
    pub paused: bool,
}

pub struct CommandQueue {
    high: VecDeque<Command>,
    normal: VecDeque<Command>,
    low: VecDeque<Command>,
    pause_depth: u32,
    last_send: Option<Instant>,
    min_spacing: Duration,
    max_retries: u32,
    shut_down: bool,
    next_id: u64,
    total_sent: u64,
    total_failed: u64,
}

impl CommandQueue {
    pub fn new(min_spacing: Duration, max_retries: u32) -> Self {
        Self {
            high: VecDeque::new(),
            normal: VecDeque::new(),
            low: VecDeque::new(),
            pause_depth: 0,
            last_send: None,
            min_spacing,
            max_retries: max_retries.max(1),
            shut_down: false,
            next_id: 1,
            total_sent: 0,
            total_failed: 0,
        }
    }

    /// Queue a command. Rejected only after `shutdown`.
    pub fn enqueue(
        &mut self,
        payload: impl Into<String>,
        priority: Priority,
        on_result: Option<ResultCallback>,
    ) -> bool {
        self.enqueue_with_id(payload, priority, on_result).is_some()
    }

    /// Like `enqueue`, returning the id `cancel` accepts.
    pub fn enqueue_with_id(
        &mut self,
        payload: impl Into<String>,
        priority: Priority,
        on_result: Option<ResultCallback>,
    ) -> Option<u64> {
        let payload = payload.into();
        if self.shut_down {
            log::warn!("Queue shut down, rejecting command {}", payload);
            if let Some(callback) = on_result {
                callback(CommandOutcome::Failed { reason: "queue shut down".to_string() });
            }
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        let command = Command {
            id,
            payload,
            priority,
            attempts: 0,
            enqueued_at: Instant::now(),
            on_result,
        };
        self.band_mut(priority).push_back(command);
        Some(id)
    }

    /// Withdraw a still-pending command. Returns false once it has been written,
    /// failed for good, or was never queued.
    pub fn cancel(&mut self, id: u64, reason: &str) -> bool {
        for band in [&mut self.high, &mut self.normal, &mut self.low] {
            if let Some(pos) = band.iter().position(|c| c.id == id) {
                if let Some(command) = band.remove(pos) {
                    log::info!("Cancelled pending command {}: {}", command.payload, reason);
                    command.resolve(CommandOutcome::Failed { reason: reason.to_string() });
                    return true;
                }
            }
        }
        false
    }

    /// Hold dispatch. Pauses nest; each `pause` needs a matching `resume`.
    pub fn pause(&mut self) {
        self.pause_depth += 1;
        log::info!("Command queue paused (depth {})", self.pause_depth);
    }

    pub fn resume(&mut self) {
        if self.pause_depth == 0 {
            log::warn!("Command queue resume without matching pause");
            return;
        }
        self.pause_depth -= 1;
        if self.pause_depth == 0 {
            log::info!("Command queue resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.pause_depth > 0
    }

    pub fn len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            high: self.high.len(),
            normal: self.normal.len(),
            low: self.low.len(),
            total_sent: self.total_sent,
            total_failed: self.total_failed,
            paused: self.is_paused(),
        }
    }

    /// Drop pending commands in one band, or all bands. Each dropped command reports failure.
    pub fn clear(&mut self, priority: Option<Priority>) -> usize {
        let dropped: Vec<Command> = match priority {
            Some(p) => self.band_mut(p).drain(..).collect(),
            None => self
                .high
                .drain(..)
                .chain(self.normal.drain(..))
                .chain(self.low.drain(..))
                .collect(),
        };
        let count = dropped.len();
        for command in dropped {
            command.resolve(CommandOutcome::Failed { reason: "cleared".to_string() });
        }
        count
    }

    /// Fail everything pending and reject later enqueues.
    pub fn shutdown(&mut self) {
        self.shut_down = true;
        let dropped: Vec<Command> = self
            .high
            .drain(..)
            .chain(self.normal.drain(..))
            .chain(self.low.drain(..))
            .collect();
        for command in dropped {
            command.resolve(CommandOutcome::Failed { reason: "queue shut down".to_string() });
        }
    }

    /// Pop the next command if the gate, spacing and link allow a write at `now`.
    pub fn next_ready(&mut self, now: Instant, link_up: bool) -> Option<Command> {
        if self.is_paused() || !link_up {
            return None;
        }
        if let Some(last) = self.last_send {
            if now.saturating_duration_since(last) < self.min_spacing {
                return None;
            }
        }
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    /// One arbitration step: write at most one command through `sink`.
    pub async fn dispatch(&mut self, now: Instant, sink: &dyn LineSink) -> Option<DispatchReport> {
        let command = self.next_ready(now, sink.is_connected())?;
        self.last_send = Some(now);
        let result = sink.send_line(&command.payload).await;
        Some(self.settle(command, result.map_err(|e| e.to_string())))
    }

    fn settle(&mut self, mut command: Command, result: Result<(), String>) -> DispatchReport {
        match result {
            Ok(()) => {
                self.total_sent += 1;
                log::debug!("TX {}", command.payload);
                let payload = command.payload.clone();
                command.resolve(CommandOutcome::Sent);
                DispatchReport::Sent { payload }
            }
            Err(reason) => {
                command.attempts += 1;
                if command.attempts < self.max_retries {
                    log::warn!(
                        "Send failed ({}), retry {}/{}: {}",
                        reason, command.attempts, self.max_retries, command.payload
                    );
                    let report = DispatchReport::Retrying {
                        payload: command.payload.clone(),
                        attempt: command.attempts,
                        reason,
                    };
                    if command.priority == Priority::High {
                        self.high.push_front(command);
                    } else {
                        let band = command.priority;
                        self.band_mut(band).push_back(command);
                    }
                    report
                } else {
                    self.total_failed += 1;
                    log::error!("Retries exhausted for {}: {}", command.payload, reason);
                    let payload = command.payload.clone();
                    command.resolve(CommandOutcome::Failed {
                        reason: format!("retries exhausted: {}", reason),
                    });
                    DispatchReport::Failed { payload, reason }
                }
            }
        }
    }

    fn band_mut(&mut self, priority: Priority) -> &mut VecDeque<Command> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_SPACING, DEFAULT_MAX_RETRIES)
    }
}
