//! The public face of the crate: one control task owning the queue, the poll
//! scheduler and both exchanges, driven through a cloneable handle.
mod control_loop;
mod handle;

pub use handle::{HvacController, HvacControllerBuilder};

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::config::ConfigError;
use crate::exchange::{ReloadError, ValveAck, ValveError, ValveTarget};
use crate::protocol::{AirQualityReading, ScanSummary, SensorReading, Subsystem};
use crate::queue::{CommandOutcome, Priority, QueueStats};
use crate::scheduler::PollState;
use crate::serial::SerialError;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("Control task is not running")]
    ChannelClosed,

    #[error(transparent)]
    Serial(#[from] SerialError),

    #[error(transparent)]
    Reload(#[from] ReloadError),

    #[error(transparent)]
    Valve(#[from] ValveError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Command rejected: {0}")]
    Rejected(String),
}

pub type Result<T> = std::result::Result<T, ControllerError>;

/// Everything the core reports to its observers. Each subscriber sees every event once,
/// in emission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ControllerEvent {
    SensorUpdated {
        subsystem: Subsystem,
        sensor_id: String,
        reading: SensorReading,
    },
    BatchComplete {
        subsystem: Subsystem,
        summary: ScanSummary,
        readings: BTreeMap<String, SensorReading>,
    },
    AirQualityUpdated {
        reading: AirQualityReading,
    },
    ReloadCompleted {
        subsystem: Subsystem,
        applied: usize,
        collected: usize,
    },
    ReloadFailed {
        subsystem: Subsystem,
        reason: String,
    },
    ValveFlicker {
        on: bool,
    },
    ValveProgress {
        target: ValveTarget,
        ack: ValveAck,
    },
    ValveCompleted {
        target: ValveTarget,
    },
    ValveTimedOut {
        target: ValveTarget,
    },
    ValveFailed {
        target: ValveTarget,
        reason: String,
    },
    ValveErrorCleared,
    LinkHealthChanged {
        healthy: bool,
    },
    PollStateChanged {
        state: PollState,
    },
    CommandSent {
        payload: String,
    },
    CommandFailed {
        payload: String,
        reason: String,
    },
    QueueDepthChanged {
        depth: usize,
        paused: bool,
    },
}

pub(crate) enum ControlRequest {
    Enqueue {
        payload: String,
        priority: Priority,
        outcome: Option<oneshot::Sender<CommandOutcome>>,
        responder: oneshot::Sender<bool>,
    },
    RequestSensorData {
        responder: oneshot::Sender<bool>,
    },
    RequestReload {
        subsystem: Subsystem,
        responder: oneshot::Sender<std::result::Result<(), ReloadError>>,
    },
    ActuateValve {
        target: ValveTarget,
        responder: oneshot::Sender<std::result::Result<(), ValveError>>,
    },
    StartPolling {
        responder: oneshot::Sender<bool>,
    },
    StopPolling,
    ResumePolling {
        responder: oneshot::Sender<bool>,
    },
    SetCycleInterval(Duration),
    SetResponseTimeout(Duration),
    SetSubsystemEnabled(Subsystem, bool),
    ClearQueue {
        priority: Option<Priority>,
        responder: oneshot::Sender<usize>,
    },
    Status {
        responder: oneshot::Sender<ControllerStatus>,
    },
    Shutdown {
        responder: oneshot::Sender<()>,
    },
}

/// Point-in-time view of the control task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerStatus {
    pub link_up: bool,
    pub poll_state: PollState,
    pub polling: bool,
    pub queue: QueueStats,
    pub reloads_active: Vec<Subsystem>,
    pub valve_target: Option<ValveTarget>,
}
