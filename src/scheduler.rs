//! Sensor polling state machine. Visits each enabled subsystem in turn, one
//! outstanding request at a time, then waits out the cycle interval.
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::protocol::Subsystem;
use crate::timer::{Deadline, Repeater};

pub const MIN_CYCLE_INTERVAL: Duration = Duration::from_secs(1);
pub const MAX_CYCLE_INTERVAL: Duration = Duration::from_secs(360);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "subsystem", rename_all = "snake_case")]
pub enum PollState {
    Idle,
    Requesting(Subsystem),
    Waiting(Subsystem),
    IntervalWait,
    Paused,
}

impl fmt::Display for PollState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollState::Idle => write!(f, "idle"),
            PollState::Requesting(s) => write!(f, "requesting {}", s),
            PollState::Waiting(s) => write!(f, "waiting {}", s),
            PollState::IntervalWait => write!(f, "interval wait"),
            PollState::Paused => write!(f, "paused"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    pub cycle_interval: Duration,
    pub response_timeout: Duration,
    pub health_check_interval: Duration,
    pub air_enabled: bool,
    pub dsct_enabled: bool,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            cycle_interval: Duration::from_secs(5),
            response_timeout: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(5),
            air_enabled: true,
            dsct_enabled: true,
        }
    }
}

/// Issues the actual scan request for a subsystem.
pub trait SensorRequester {
    fn request(&mut self, subsystem: Subsystem);
}

impl<F: FnMut(Subsystem)> SensorRequester for F {
    fn request(&mut self, subsystem: Subsystem) {
        self(subsystem)
    }
}

pub struct SensorPollingScheduler {
    state: PollState,
    config: PollConfig,
    running: bool,
    force_cycle: bool,
    last_cycle_start: Option<Instant>,
    response_deadline: Deadline,
    health_check: Repeater,
}

impl SensorPollingScheduler {
    pub fn new(mut config: PollConfig) -> Self {
        config.cycle_interval = clamp_cycle_interval(config.cycle_interval);
        let health_check = Repeater::new(config.health_check_interval);
        Self {
            state: PollState::Idle,
            config,
            running: false,
            force_cycle: false,
            last_cycle_start: None,
            response_deadline: Deadline::new(),
            health_check,
        }
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// True exactly while a `Waiting` state is active.
    pub fn timeout_armed(&self) -> bool {
        self.response_deadline.is_armed()
    }

    /// Begin polling. Refused while the link is unhealthy. The first cycle starts on the
    /// next tick.
    pub fn start(&mut self, now: Instant, link_healthy: bool) -> bool {
        if self.running {
            return true;
        }
        if !link_healthy {
            log::warn!("Not starting sensor polling: link unhealthy");
            return false;
        }
        self.running = true;
        self.last_cycle_start = None;
        self.health_check.start(now);
        self.set_state(PollState::Idle);
        log::info!("Sensor polling started (interval {:?})", self.config.cycle_interval);
        true
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.force_cycle = false;
        self.response_deadline.cancel();
        self.health_check.stop();
        self.set_state(PollState::Paused);
        log::info!("Sensor polling stopped");
    }

    pub fn pause(&mut self) {
        if !self.running {
            return;
        }
        self.response_deadline.cancel();
        self.set_state(PollState::Paused);
    }

    pub fn resume(&mut self) -> bool {
        if !self.running || self.state != PollState::Paused {
            return false;
        }
        self.set_state(PollState::Idle);
        true
    }

    /// Start the next cycle on the next tick if no cycle is in progress.
    pub fn request_cycle_now(&mut self) -> bool {
        match self.state {
            PollState::Idle | PollState::IntervalWait if self.running => {
                self.force_cycle = true;
                true
            }
            _ => false,
        }
    }

    pub fn set_cycle_interval(&mut self, interval: Duration) {
        self.config.cycle_interval = clamp_cycle_interval(interval);
        log::info!("Sensor cycle interval set to {:?}", self.config.cycle_interval);
    }

    pub fn set_response_timeout(&mut self, timeout: Duration) {
        self.config.response_timeout = timeout.max(Duration::from_millis(100));
    }

    pub fn set_enabled(&mut self, subsystem: Subsystem, enabled: bool) {
        match subsystem {
            Subsystem::Air => self.config.air_enabled = enabled,
            Subsystem::Dsct => self.config.dsct_enabled = enabled,
        }
    }

    pub fn is_enabled(&self, subsystem: Subsystem) -> bool {
        match subsystem {
            Subsystem::Air => self.config.air_enabled,
            Subsystem::Dsct => self.config.dsct_enabled,
        }
    }

    /// Advance the machine. Called from the control tick.
    pub fn tick(&mut self, now: Instant, link_healthy: bool, requester: &mut dyn SensorRequester) {
        if !self.running {
            return;
        }

        if self.health_check.poll(now) && !link_healthy && self.state != PollState::Paused {
            log::warn!("Link unhealthy, pausing sensor polling");
            self.pause();
            return;
        }

        match self.state {
            PollState::Idle => {
                if self.cycle_due(now) {
                    self.force_cycle = false;
                    match self.next_enabled(None) {
                        Some(subsystem) => self.issue(subsystem, now, requester),
                        None => self.enter_interval_wait(now),
                    }
                }
            }
            PollState::Waiting(subsystem) => {
                if self.response_deadline.expired(now) {
                    log::warn!(
                        "[{}] No scan response within {:?}, moving on",
                        subsystem, self.config.response_timeout
                    );
                    self.advance_from(subsystem, now, requester);
                }
            }
            PollState::IntervalWait => self.set_state(PollState::Idle),
            PollState::Requesting(_) | PollState::Paused => {}
        }
    }

    /// The subsystem reported scan completion.
    pub fn on_complete(&mut self, subsystem: Subsystem, now: Instant, requester: &mut dyn SensorRequester) {
        if self.state != PollState::Waiting(subsystem) {
            log::debug!("[{}] Completion outside its wait state ({}), ignored", subsystem, self.state);
            return;
        }
        self.response_deadline.cancel();
        self.advance_from(subsystem, now, requester);
    }

    fn cycle_due(&self, now: Instant) -> bool {
        if self.force_cycle {
            return true;
        }
        match self.last_cycle_start {
            Some(start) => now.saturating_duration_since(start) >= self.config.cycle_interval,
            None => true,
        }
    }

    fn next_enabled(&self, after: Option<Subsystem>) -> Option<Subsystem> {
        let skip = match after {
            Some(current) => Subsystem::POLL_ORDER.iter().position(|s| *s == current)? + 1,
            None => 0,
        };
        Subsystem::POLL_ORDER
            .iter()
            .skip(skip)
            .copied()
            .find(|s| self.is_enabled(*s))
    }

    fn issue(&mut self, subsystem: Subsystem, now: Instant, requester: &mut dyn SensorRequester) {
        self.set_state(PollState::Requesting(subsystem));
        self.response_deadline.arm(now, self.config.response_timeout);
        requester.request(subsystem);
        self.set_state(PollState::Waiting(subsystem));
    }

    fn advance_from(&mut self, subsystem: Subsystem, now: Instant, requester: &mut dyn SensorRequester) {
        match self.next_enabled(Some(subsystem)) {
            Some(next) => self.issue(next, now, requester),
            None => self.enter_interval_wait(now),
        }
    }

    fn enter_interval_wait(&mut self, now: Instant) {
        self.last_cycle_start = Some(now);
        self.set_state(PollState::IntervalWait);
    }

    fn set_state(&mut self, state: PollState) {
        if self.state != state {
            log::debug!("Poll state {} -> {}", self.state, state);
            self.state = state;
        }
    }
}

fn clamp_cycle_interval(interval: Duration) -> Duration {
    interval.clamp(MIN_CYCLE_INTERVAL, MAX_CYCLE_INTERVAL)
}
