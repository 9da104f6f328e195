use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::control_loop::ControlLoop;
use super::{ControlRequest, ControllerError, ControllerEvent, ControllerStatus, Result};
use crate::bus::EventBus;
use crate::config::LinkConfig;
use crate::exchange::ValveTarget;
use crate::protocol::{DeviceState, Subsystem};
use crate::queue::{CommandOutcome, Priority};
use crate::serial::{SerialDeviceInfo, SerialInterface, SerialPortIO, LineTransport, TransportMetrics};

/// Cloneable handle to the control task. Every operation is a message to that task.
#[derive(Clone)]
pub struct HvacController {
    request_tx: mpsc::Sender<ControlRequest>,
    events: EventBus<ControllerEvent>,
    state_rx: watch::Receiver<Arc<DeviceState>>,
    transport: LineTransport,
    task: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

pub struct HvacControllerBuilder {
    config: LinkConfig,
    transport: Option<LineTransport>,
    request_capacity: usize,
}

impl HvacControllerBuilder {
    pub fn new(config: LinkConfig) -> Self {
        Self {
            config,
            transport: None,
            request_capacity: 64,
        }
    }

    /// Use an existing transport instead of creating one.
    pub fn transport(mut self, transport: LineTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn request_capacity(mut self, capacity: usize) -> Self {
        self.request_capacity = capacity.max(1);
        self
    }

    /// Spawn the control task. Must be called inside a tokio runtime.
    pub fn build(self) -> HvacController {
        let transport = self.transport.unwrap_or_default();
        let (request_tx, request_rx) = mpsc::channel(self.request_capacity);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(Arc::new(DeviceState::default()));
        let events = EventBus::new();
        let lines_rx = transport.subscribe();

        let control = ControlLoop::new(&self.config, transport.clone(), events.clone(), state_tx, internal_tx);
        let task = tokio::spawn(control.run(self.config.tick(), request_rx, lines_rx, internal_rx));

        HvacController {
            request_tx,
            events,
            state_rx,
            transport,
            task: Arc::new(std::sync::Mutex::new(Some(task))),
        }
    }
}

impl HvacController {
    pub fn builder(config: LinkConfig) -> HvacControllerBuilder {
        HvacControllerBuilder::new(config)
    }

    pub fn available_ports() -> Result<Vec<SerialDeviceInfo>> {
        Ok(SerialInterface::available_ports()?)
    }

    pub async fn open(&self, port_name: &str, baud_rate: u32) -> Result<SerialDeviceInfo> {
        Ok(self.transport.open(port_name, baud_rate).await?)
    }

    pub async fn attach(&self, io: Box<dyn SerialPortIO>, port_name: &str) {
        self.transport.attach(io, port_name).await
    }

    pub async fn close(&self) {
        self.transport.close().await
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn transport(&self) -> &LineTransport {
        &self.transport
    }

    /// Queue a command and wait until it has been written or has failed for good.
    pub async fn send_command(&self, priority: Priority, payload: impl Into<String>) -> Result<CommandOutcome> {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let accepted = self
            .request(|responder| ControlRequest::Enqueue {
                payload: payload.into(),
                priority,
                outcome: Some(outcome_tx),
                responder,
            })
            .await?;
        if !accepted {
            return Err(ControllerError::Rejected("queue shut down".to_string()));
        }
        outcome_rx.await.map_err(|_| ControllerError::ChannelClosed)
    }

    /// Queue a command without waiting for it to be written. Outcome is reported
    /// through `CommandSent`/`CommandFailed` events.
    pub async fn enqueue_command(&self, priority: Priority, payload: impl Into<String>) -> Result<bool> {
        self.request(|responder| ControlRequest::Enqueue {
            payload: payload.into(),
            priority,
            outcome: None,
            responder,
        })
        .await
    }

    /// Start a poll cycle on the next tick. False if one is already running or polling
    /// is paused.
    pub async fn request_sensor_data(&self) -> Result<bool> {
        self.request(|responder| ControlRequest::RequestSensorData { responder }).await
    }

    pub async fn request_reload(&self, subsystem: Subsystem) -> Result<()> {
        self.request(|responder| ControlRequest::RequestReload { subsystem, responder })
            .await?
            .map_err(ControllerError::from)
    }

    pub async fn actuate_valve(&self, target: ValveTarget) -> Result<()> {
        self.request(|responder| ControlRequest::ActuateValve { target, responder })
            .await?
            .map_err(ControllerError::from)
    }

    pub async fn start_polling(&self) -> Result<bool> {
        self.request(|responder| ControlRequest::StartPolling { responder }).await
    }

    pub async fn stop_polling(&self) -> Result<()> {
        self.post(ControlRequest::StopPolling).await
    }

    pub async fn resume_polling(&self) -> Result<bool> {
        self.request(|responder| ControlRequest::ResumePolling { responder }).await
    }

    pub async fn set_cycle_interval(&self, interval: Duration) -> Result<()> {
        self.post(ControlRequest::SetCycleInterval(interval)).await
    }

    pub async fn set_response_timeout(&self, timeout: Duration) -> Result<()> {
        self.post(ControlRequest::SetResponseTimeout(timeout)).await
    }

    pub async fn set_subsystem_enabled(&self, subsystem: Subsystem, enabled: bool) -> Result<()> {
        self.post(ControlRequest::SetSubsystemEnabled(subsystem, enabled)).await
    }

    pub async fn clear_queue(&self, priority: Option<Priority>) -> Result<usize> {
        self.request(|responder| ControlRequest::ClearQueue { priority, responder }).await
    }

    pub async fn status(&self) -> Result<ControllerStatus> {
        self.request(|responder| ControlRequest::Status { responder }).await
    }

    pub fn subscribe_events(&self) -> mpsc::UnboundedReceiver<ControllerEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_events_with<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: FnMut(ControllerEvent) + Send + 'static,
    {
        self.events.subscribe_with(callback)
    }

    pub fn state_receiver(&self) -> watch::Receiver<Arc<DeviceState>> {
        self.state_rx.clone()
    }

    pub fn metrics_receiver(&self) -> watch::Receiver<TransportMetrics> {
        self.transport.metrics_receiver()
    }

    /// Stop the control task, failing pending commands, then close the port.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.request_tx.send(ControlRequest::Shutdown { responder: tx }).await.is_ok() {
            let _ = rx.await;
        }
        let task = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            let _ = task.await;
        }
        self.transport.close().await;
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> ControlRequest) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.post(make(tx)).await?;
        rx.await.map_err(|_| ControllerError::ChannelClosed)
    }

    async fn post(&self, request: ControlRequest) -> Result<()> {
        self.request_tx
            .send(request)
            .await
            .map_err(|_| ControllerError::ChannelClosed)
    }
}
