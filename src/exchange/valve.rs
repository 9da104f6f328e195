use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::ValveError;
use crate::protocol::{format_command, Subsystem};
use crate::queue::CommandOutcome;
use crate::timer::{Deadline, Repeater};

pub const DEFAULT_VALVE_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_FLICKER_PERIOD: Duration = Duration::from_millis(500);
pub const DEFAULT_ERROR_DISPLAY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ValveTarget {
    Open,
    Close,
}

impl ValveTarget {
    pub fn as_arg(self) -> &'static str {
        match self {
            ValveTarget::Open => "OPEN",
            ValveTarget::Close => "CLOSE",
        }
    }
}

impl fmt::Display for ValveTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_arg())
    }
}

impl FromStr for ValveTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OPEN" => Ok(ValveTarget::Open),
            "CLOSE" | "CLOSED" => Ok(ValveTarget::Close),
            other => Err(format!("unknown valve target '{}'", other)),
        }
    }
}

/// Acknowledgements the board sends while a valve moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValveAck {
    Opening,
    OpenOk,
    Closing,
    CloseOk,
}

impl ValveAck {
    /// Parse `<SUB>,SOL,All Opening!` and friends.
    pub fn parse(subsystem: Subsystem, line: &str) -> Option<Self> {
        let rest = line
            .strip_prefix(subsystem.namespace())?
            .strip_prefix(",SOL,")?;
        match rest.trim() {
            "All Opening!" => Some(ValveAck::Opening),
            "All Open OK!" => Some(ValveAck::OpenOk),
            "All Closing!" => Some(ValveAck::Closing),
            "All Close OK!" => Some(ValveAck::CloseOk),
            _ => None,
        }
    }

    pub fn target(self) -> ValveTarget {
        match self {
            ValveAck::Opening | ValveAck::OpenOk => ValveTarget::Open,
            ValveAck::Closing | ValveAck::CloseOk => ValveTarget::Close,
        }
    }

    pub fn is_final(self) -> bool {
        matches!(self, ValveAck::OpenOk | ValveAck::CloseOk)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValvePhase {
    Idle,
    Issuing,
    /// Timed out or failed; shown as an error until the display delay passes.
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValveEvent {
    Flicker { on: bool },
    Progress { target: ValveTarget, ack: ValveAck },
    Completed { target: ValveTarget },
    TimedOut { target: ValveTarget },
    Failed { target: ValveTarget, reason: String },
    ErrorCleared,
}

impl ValveEvent {
    /// True for the events that close an issuing session.
    pub fn ends_session(&self) -> bool {
        matches!(
            self,
            ValveEvent::Completed { .. } | ValveEvent::TimedOut { .. } | ValveEvent::Failed { .. }
        )
    }
}

#[derive(Debug, Clone)]
struct ValveSession {
    id: u64,
    target: ValveTarget,
    flicker_on: bool,
}

#[derive(Debug, Clone)]
pub struct ValveTiming {
    pub timeout: Duration,
    pub flicker_period: Duration,
    pub error_display: Duration,
}

impl Default for ValveTiming {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_VALVE_TIMEOUT,
            flicker_period: DEFAULT_FLICKER_PERIOD,
            error_display: DEFAULT_ERROR_DISPLAY,
        }
    }
}

/// Single-valve actuation. At most one session; further requests are rejected while
/// it is issuing.
pub struct ValveActuationExchange {
    subsystem: Subsystem,
    timing: ValveTiming,
    phase: ValvePhase,
    session: Option<ValveSession>,
    next_id: u64,
    flicker: Repeater,
    deadline: Deadline,
    error_clear: Deadline,
}

impl ValveActuationExchange {
    pub fn new(subsystem: Subsystem, timing: ValveTiming) -> Self {
        let flicker = Repeater::new(timing.flicker_period);
        Self {
            subsystem,
            timing,
            phase: ValvePhase::Idle,
            session: None,
            next_id: 0,
            flicker,
            deadline: Deadline::new(),
            error_clear: Deadline::new(),
        }
    }

    pub fn subsystem(&self) -> Subsystem {
        self.subsystem
    }

    pub fn phase(&self) -> ValvePhase {
        self.phase
    }

    pub fn target(&self) -> Option<ValveTarget> {
        self.session.as_ref().map(|s| s.target)
    }

    pub fn flicker_on(&self) -> bool {
        self.session.as_ref().map(|s| s.flicker_on).unwrap_or(false)
    }

    pub fn is_flickering(&self) -> bool {
        self.flicker.is_running()
    }

    pub fn timeout_armed(&self) -> bool {
        self.deadline.is_armed()
    }

    /// Start a session and return its id plus the command to send. Rejected without
    /// side effects while a session is issuing.
    pub fn actuate(
        &mut self,
        target: ValveTarget,
        now: Instant,
        link_up: bool,
    ) -> Result<(u64, String), ValveError> {
        if self.phase == ValvePhase::Issuing {
            log::warn!("Valve {} rejected: actuation already in progress", target);
            return Err(ValveError::AlreadyInProgress);
        }
        if !link_up {
            return Err(ValveError::NotConnected);
        }

        self.next_id += 1;
        let id = self.next_id;
        self.error_clear.cancel();
        self.session = Some(ValveSession {
            id,
            target,
            flicker_on: false,
        });
        self.phase = ValvePhase::Issuing;
        self.flicker.start(now);
        self.deadline.arm(now, self.timing.timeout);

        let command = format_command(self.subsystem.namespace(), "SOL", &[target.as_arg()]);
        log::info!("Valve {} issued: {}", target, command);
        Ok((id, command))
    }

    pub fn on_ack(&mut self, ack: ValveAck) -> Option<ValveEvent> {
        let target = match (&self.session, self.phase) {
            (Some(session), ValvePhase::Issuing) => session.target,
            _ => {
                log::debug!("Valve ack {:?} with no actuation in progress", ack);
                return None;
            }
        };
        if ack.target() != target {
            log::warn!("Valve ack {:?} does not match target {}", ack, target);
            return None;
        }
        if !ack.is_final() {
            log::info!("Valve {} in progress ({:?})", target, ack);
            return Some(ValveEvent::Progress { target, ack });
        }

        self.flicker.stop();
        self.deadline.cancel();
        self.session = None;
        self.phase = ValvePhase::Idle;
        log::info!("Valve {} complete", target);
        Some(ValveEvent::Completed { target })
    }

    /// Result of writing the valve command. Only a failure matters.
    pub fn on_send_result(&mut self, id: u64, outcome: &CommandOutcome, now: Instant) -> Option<ValveEvent> {
        let CommandOutcome::Failed { reason } = outcome else {
            return None;
        };
        let target = match &self.session {
            Some(session) if session.id == id && self.phase == ValvePhase::Issuing => session.target,
            _ => return None,
        };
        log::error!("Valve {} command could not be sent: {}", target, reason);
        self.enter_error(now);
        Some(ValveEvent::Failed {
            target,
            reason: reason.clone(),
        })
    }

    /// Drive flicker, timeout and error-display timers.
    pub fn poll(&mut self, now: Instant) -> Vec<ValveEvent> {
        let mut events = Vec::new();
        match self.phase {
            ValvePhase::Issuing => {
                if self.deadline.expired(now) {
                    let target = self.target().unwrap_or(ValveTarget::Open);
                    log::error!("Valve {} timed out after {:?}", target, self.timing.timeout);
                    self.enter_error(now);
                    events.push(ValveEvent::TimedOut { target });
                } else if self.flicker.poll(now) {
                    if let Some(session) = self.session.as_mut() {
                        session.flicker_on = !session.flicker_on;
                        events.push(ValveEvent::Flicker { on: session.flicker_on });
                    }
                }
            }
            ValvePhase::Error => {
                if self.error_clear.expired(now) {
                    self.session = None;
                    self.phase = ValvePhase::Idle;
                    events.push(ValveEvent::ErrorCleared);
                }
            }
            ValvePhase::Idle => {}
        }
        events
    }

    /// Drop an in-flight session, e.g. when the link goes away.
    pub fn abort(&mut self, now: Instant, reason: &str) -> Option<ValveEvent> {
        if self.phase != ValvePhase::Issuing {
            return None;
        }
        let target = self.target()?;
        self.enter_error(now);
        Some(ValveEvent::Failed {
            target,
            reason: reason.to_string(),
        })
    }

    fn enter_error(&mut self, now: Instant) {
        self.flicker.stop();
        self.deadline.cancel();
        if let Some(session) = self.session.as_mut() {
            session.flicker_on = false;
        }
        self.phase = ValvePhase::Error;
        self.error_clear.arm(now, self.timing.error_display);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_acks() {
        assert_eq!(ValveAck::parse(Subsystem::Dsct, "DSCT,SOL,All Opening!"), Some(ValveAck::Opening));
        assert_eq!(ValveAck::parse(Subsystem::Dsct, "DSCT,SOL,All Close OK!"), Some(ValveAck::CloseOk));
        assert_eq!(ValveAck::parse(Subsystem::Air, "DSCT,SOL,All Close OK!"), None);
        assert_eq!(ValveAck::parse(Subsystem::Dsct, "DSCT,SOL,OPEN"), None);
    }

    #[test]
    fn mismatched_completion_is_ignored() {
        let t0 = Instant::now();
        let mut valve = ValveActuationExchange::new(Subsystem::Dsct, ValveTiming::default());
        valve.actuate(ValveTarget::Open, t0, true).unwrap();
        assert_eq!(valve.on_ack(ValveAck::CloseOk), None);
        assert_eq!(valve.phase(), ValvePhase::Issuing);
        assert_eq!(
            valve.on_ack(ValveAck::OpenOk),
            Some(ValveEvent::Completed { target: ValveTarget::Open })
        );
        assert!(!valve.is_flickering());
        assert!(!valve.timeout_armed());
    }

    #[test]
    fn stale_send_failure_is_ignored() {
        let t0 = Instant::now();
        let mut valve = ValveActuationExchange::new(Subsystem::Dsct, ValveTiming::default());
        let (first, _) = valve.actuate(ValveTarget::Open, t0, true).unwrap();
        valve.on_ack(ValveAck::OpenOk);
        let (second, _) = valve.actuate(ValveTarget::Close, t0, true).unwrap();
        let failed = CommandOutcome::Failed { reason: "x".into() };
        assert_eq!(valve.on_send_result(first, &failed, t0), None);
        assert!(matches!(valve.on_send_result(second, &failed, t0), Some(ValveEvent::Failed { .. })));
        assert_eq!(valve.phase(), ValvePhase::Error);
    }
}
