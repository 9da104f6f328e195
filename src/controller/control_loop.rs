use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};

use super::{ControlRequest, ControllerEvent, ControllerStatus};
use crate::bus::EventBus;
use crate::config::LinkConfig;
use crate::exchange::{
    LineDisposition, ReloadExchange, ReloadOutcome, ValveAck, ValveActuationExchange, ValveEvent,
};
use crate::protocol::{parse_air_quality_line, DeviceState, SensorArray, SensorChange, Subsystem};
use crate::queue::{CommandOutcome, CommandQueue, DispatchReport, Priority};
use crate::scheduler::{PollState, SensorPollingScheduler, SensorRequester};
use crate::serial::{Line, LineTransport};

/// Results fed back into the loop by queue callbacks.
pub(crate) enum Internal {
    ValveSendResult { id: u64, outcome: CommandOutcome },
}

fn slot(subsystem: Subsystem) -> usize {
    match subsystem {
        Subsystem::Air => 0,
        Subsystem::Dsct => 1,
    }
}

/// Issues poll-cycle scan requests through the queue at low priority.
struct PollRequester<'a> {
    queue: &'a mut CommandQueue,
    arrays: &'a mut [SensorArray; 2],
}

impl SensorRequester for PollRequester<'_> {
    fn request(&mut self, subsystem: Subsystem) {
        let array = &mut self.arrays[slot(subsystem)];
        let command = subsystem.sensor_request();
        log::debug!("[{}] Requesting sensor scan: {}", subsystem, command);
        array.begin_scan();
        if !self.queue.enqueue(command, Priority::Low, None) {
            array.abort_scan();
        }
    }
}

pub(crate) struct ControlLoop {
    transport: LineTransport,
    queue: CommandQueue,
    scheduler: SensorPollingScheduler,
    reloads: [ReloadExchange; 2],
    valve: ValveActuationExchange,
    /// Queue id of the current valve session's command while it may still be pending.
    valve_command: Option<u64>,
    arrays: [SensorArray; 2],
    device_state: DeviceState,
    state_tx: watch::Sender<Arc<DeviceState>>,
    events: EventBus<ControllerEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    autostart: bool,
    link_up: bool,
    last_poll_state: PollState,
    last_depth: (usize, bool),
}

impl ControlLoop {
    pub(crate) fn new(
        config: &LinkConfig,
        transport: LineTransport,
        events: EventBus<ControllerEvent>,
        state_tx: watch::Sender<Arc<DeviceState>>,
        internal_tx: mpsc::UnboundedSender<Internal>,
    ) -> Self {
        let scheduler = SensorPollingScheduler::new(config.poll_config());
        let last_poll_state = scheduler.state();
        Self {
            transport,
            queue: CommandQueue::new(config.min_spacing(), config.queue.max_retries),
            scheduler,
            reloads: [
                ReloadExchange::new(Subsystem::Air, config.reload_timeout()),
                ReloadExchange::new(Subsystem::Dsct, config.reload_timeout()),
            ],
            valve: ValveActuationExchange::new(config.valve.subsystem, config.valve_timing()),
            valve_command: None,
            arrays: [SensorArray::new(Subsystem::Air), SensorArray::new(Subsystem::Dsct)],
            device_state: DeviceState::default(),
            state_tx,
            events,
            internal_tx,
            autostart: config.polling.autostart,
            link_up: false,
            last_poll_state,
            last_depth: (0, false),
        }
    }

    pub(crate) async fn run(
        mut self,
        tick: std::time::Duration,
        mut request_rx: mpsc::Receiver<ControlRequest>,
        mut lines_rx: mpsc::UnboundedReceiver<Line>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
    ) {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::info!("Control loop started (tick {:?})", tick);

        loop {
            tokio::select! {
                maybe_req = request_rx.recv() => {
                    match maybe_req {
                        Some(ControlRequest::Shutdown { responder }) => {
                            self.shutdown();
                            let _ = responder.send(());
                            break;
                        }
                        Some(req) => self.handle_request(req).await,
                        None => {
                            self.shutdown();
                            break;
                        }
                    }
                },
                Some(line) = lines_rx.recv() => self.route_line(&line),
                Some(internal) = internal_rx.recv() => self.handle_internal(internal),
                _ = ticker.tick() => self.on_tick().await,
            }
            self.publish_changes();
        }
        log::info!("Control loop stopped");
    }

    async fn handle_request(&mut self, req: ControlRequest) {
        let now = Instant::now();
        match req {
            ControlRequest::Enqueue { payload, priority, outcome, responder } => {
                let callback = outcome.map(|tx| {
                    Box::new(move |result: CommandOutcome| {
                        let _ = tx.send(result);
                    }) as crate::queue::ResultCallback
                });
                let accepted = self.queue.enqueue(payload, priority, callback);
                let _ = responder.send(accepted);
            }
            ControlRequest::RequestSensorData { responder } => {
                let forced = self.scheduler.request_cycle_now();
                if !forced {
                    log::info!("Manual sensor request ignored in state {}", self.scheduler.state());
                }
                let _ = responder.send(forced);
            }
            ControlRequest::RequestReload { subsystem, responder } => {
                let reload = &mut self.reloads[slot(subsystem)];
                let result = reload.request(now, &self.transport, &mut self.queue).await;
                if let Err(e) = &result {
                    log::warn!("[{}] Reload request rejected: {}", subsystem, e);
                }
                let _ = responder.send(result);
            }
            ControlRequest::ActuateValve { target, responder } => {
                let result = self
                    .valve
                    .actuate(target, now, self.transport.is_connected())
                    .map(|(id, command)| {
                        let internal_tx = self.internal_tx.clone();
                        let callback: crate::queue::ResultCallback = Box::new(move |outcome| {
                            let _ = internal_tx.send(Internal::ValveSendResult { id, outcome });
                        });
                        self.valve_command =
                            self.queue.enqueue_with_id(command, Priority::High, Some(callback));
                    });
                let _ = responder.send(result);
            }
            ControlRequest::StartPolling { responder } => {
                let started = self.scheduler.start(now, self.transport.is_connected());
                let _ = responder.send(started);
            }
            ControlRequest::StopPolling => {
                self.scheduler.stop();
                for array in &mut self.arrays {
                    array.abort_scan();
                }
            }
            ControlRequest::ResumePolling { responder } => {
                let _ = responder.send(self.scheduler.resume());
            }
            ControlRequest::SetCycleInterval(interval) => self.scheduler.set_cycle_interval(interval),
            ControlRequest::SetResponseTimeout(timeout) => self.scheduler.set_response_timeout(timeout),
            ControlRequest::SetSubsystemEnabled(subsystem, enabled) => {
                self.scheduler.set_enabled(subsystem, enabled)
            }
            ControlRequest::ClearQueue { priority, responder } => {
                let dropped = self.queue.clear(priority);
                log::info!("Cleared {} pending commands", dropped);
                let _ = responder.send(dropped);
            }
            ControlRequest::Status { responder } => {
                let _ = responder.send(self.status());
            }
            ControlRequest::Shutdown { .. } => {}
        }
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::ValveSendResult { id, outcome } => {
                if let Some(event) = self.valve.on_send_result(id, &outcome, Instant::now()) {
                    self.emit_valve(event);
                }
            }
        }
    }

    /// Hand a line to whichever consumer expects it: valve acks first, then active
    /// reload sessions, then sensor arrays, then air-quality reports (including the
    /// `[AIRCON]` form that sensor arrays reject).
    fn route_line(&mut self, line: &Line) {
        let now = Instant::now();
        let text = line.as_str();

        if let Some(ack) = ValveAck::parse(self.valve.subsystem(), text) {
            if let Some(event) = self.valve.on_ack(ack) {
                self.emit_valve(event);
            }
            return;
        }

        // The START marker is shared, so every active session sees every line.
        let mut consumed = false;
        for i in 0..self.reloads.len() {
            match self.reloads[i].on_line(text, &mut self.queue) {
                LineDisposition::Ignored => {}
                LineDisposition::Consumed => consumed = true,
                LineDisposition::Finished(outcome) => {
                    consumed = true;
                    self.finish_reload(outcome);
                }
            }
        }
        if consumed {
            return;
        }

        for i in 0..self.arrays.len() {
            if !self.arrays[i].owns(text) {
                continue;
            }
            let subsystem = self.arrays[i].subsystem();
            match self.arrays[i].handle_line(text) {
                Some(SensorChange::Updated { id, reading }) => {
                    self.events.publish(ControllerEvent::SensorUpdated {
                        subsystem,
                        sensor_id: id,
                        reading,
                    });
                }
                Some(SensorChange::BatchComplete(summary)) => {
                    self.events.publish(ControllerEvent::BatchComplete {
                        subsystem,
                        summary,
                        readings: self.arrays[i].readings().clone(),
                    });
                    let mut requester = PollRequester {
                        queue: &mut self.queue,
                        arrays: &mut self.arrays,
                    };
                    self.scheduler.on_complete(subsystem, now, &mut requester);
                }
                // Older firmware reports air quality under the sensor tag
                None if parse_air_quality_line(text).is_some() => break,
                None => {}
            }
            return;
        }

        if let Some(reading) = parse_air_quality_line(text) {
            log::debug!(
                "Air quality: co2={} pm25={} temp={}",
                reading.co2_ppm, reading.pm25, reading.temp
            );
            self.events.publish(ControllerEvent::AirQualityUpdated { reading });
            return;
        }

        log::debug!("Unrouted line: {}", text);
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();
        self.check_link(now);

        for i in 0..self.reloads.len() {
            if let Some(outcome) = self.reloads[i].poll_timeout(now, &mut self.queue) {
                self.finish_reload(outcome);
            }
        }

        for event in self.valve.poll(now) {
            self.emit_valve(event);
        }

        let before = self.scheduler.state();
        let mut requester = PollRequester {
            queue: &mut self.queue,
            arrays: &mut self.arrays,
        };
        self.scheduler.tick(now, self.link_up, &mut requester);
        if let PollState::Waiting(subsystem) = before {
            if self.scheduler.state() != before {
                self.arrays[slot(subsystem)].abort_scan();
            }
        }

        if let Some(report) = self.queue.dispatch(now, &self.transport).await {
            match report {
                DispatchReport::Sent { payload } => {
                    self.events.publish(ControllerEvent::CommandSent { payload });
                }
                DispatchReport::Retrying { .. } => {}
                DispatchReport::Failed { payload, reason } => {
                    self.events.publish(ControllerEvent::CommandFailed { payload, reason });
                }
            }
        }
    }

    fn check_link(&mut self, now: Instant) {
        let up = self.transport.is_connected();
        if up == self.link_up {
            return;
        }
        self.link_up = up;
        log::info!("Link health changed: {}", if up { "up" } else { "down" });
        self.events.publish(ControllerEvent::LinkHealthChanged { healthy: up });

        if up {
            if self.autostart && !self.scheduler.is_running() {
                self.scheduler.start(now, true);
            } else {
                self.scheduler.resume();
            }
            return;
        }

        for i in 0..self.reloads.len() {
            if let Some(outcome) = self.reloads[i].abort("link lost", &mut self.queue) {
                self.finish_reload(outcome);
            }
        }
        if let Some(event) = self.valve.abort(now, "link lost") {
            self.emit_valve(event);
        }
    }

    fn finish_reload(&mut self, outcome: ReloadOutcome) {
        match outcome {
            ReloadOutcome::Completed { subsystem, updates, collected } => {
                self.device_state.apply_batch(&updates);
                let _ = self.state_tx.send(Arc::new(self.device_state.clone()));
                self.events.publish(ControllerEvent::ReloadCompleted {
                    subsystem,
                    applied: updates.len(),
                    collected,
                });
            }
            ReloadOutcome::Failed { subsystem, error } => {
                self.events.publish(ControllerEvent::ReloadFailed {
                    subsystem,
                    reason: error.to_string(),
                });
            }
        }
    }

    fn emit_valve(&mut self, event: ValveEvent) {
        if event.ends_session() {
            // An ended session's command must not reach the wire later.
            if let Some(id) = self.valve_command.take() {
                self.queue.cancel(id, "valve session ended");
            }
        }
        let event = match event {
            ValveEvent::Flicker { on } => ControllerEvent::ValveFlicker { on },
            ValveEvent::Progress { target, ack } => ControllerEvent::ValveProgress { target, ack },
            ValveEvent::Completed { target } => ControllerEvent::ValveCompleted { target },
            ValveEvent::TimedOut { target } => ControllerEvent::ValveTimedOut { target },
            ValveEvent::Failed { target, reason } => ControllerEvent::ValveFailed { target, reason },
            ValveEvent::ErrorCleared => ControllerEvent::ValveErrorCleared,
        };
        self.events.publish(event);
    }

    /// Emit poll-state and queue-depth events when either changed since the last pass.
    fn publish_changes(&mut self) {
        let state = self.scheduler.state();
        if state != self.last_poll_state {
            self.last_poll_state = state;
            self.events.publish(ControllerEvent::PollStateChanged { state });
        }
        let depth = (self.queue.len(), self.queue.is_paused());
        if depth != self.last_depth {
            self.last_depth = depth;
            self.events.publish(ControllerEvent::QueueDepthChanged {
                depth: depth.0,
                paused: depth.1,
            });
        }
    }

    fn status(&self) -> ControllerStatus {
        ControllerStatus {
            link_up: self.transport.is_connected(),
            poll_state: self.scheduler.state(),
            polling: self.scheduler.is_running(),
            queue: self.queue.stats(),
            reloads_active: self
                .reloads
                .iter()
                .filter(|r| r.is_active())
                .map(|r| r.subsystem())
                .collect(),
            valve_target: self.valve.target(),
        }
    }

    fn shutdown(&mut self) {
        for i in 0..self.reloads.len() {
            if let Some(outcome) = self.reloads[i].abort("shutdown", &mut self.queue) {
                self.finish_reload(outcome);
            }
        }
        self.scheduler.stop();
        self.queue.shutdown();
    }
}
