use std::time::Duration;

use hvac_link_lib::exchange::{ValveAck, ValveTarget};
use hvac_link_lib::protocol::Subsystem;
use hvac_link_lib::serial::mock::{MockPort, MockPortHandle};
use hvac_link_lib::{
    CommandOutcome, ControllerError, ControllerEvent, HvacController, LinkConfig, PollState, Priority,
    ValveError,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn quiet_config() -> LinkConfig {
    let mut config = LinkConfig::default();
    config.polling.autostart = false;
    config
}

async fn connected(config: LinkConfig) -> (HvacController, MockPortHandle, UnboundedReceiver<ControllerEvent>) {
    let controller = HvacController::builder(config).build();
    let events = controller.subscribe_events();
    let (port, device) = MockPort::pair();
    controller.attach(Box::new(port), "mock0").await;
    (controller, device, events)
}

/// Wait for the first event matching `pred`, skipping everything else.
async fn expect_event(
    events: &mut UnboundedReceiver<ControllerEvent>,
    pred: impl Fn(&ControllerEvent) -> bool,
) -> ControllerEvent {
    timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            if pred(&event) {
                return event;
            }
        }
        panic!("event stream closed");
    })
    .await
    .expect("expected event did not arrive")
}

async fn wait_written(device: &MockPortHandle, line: &str) {
    let found = timeout(WAIT, async {
        loop {
            if device.written_lines().iter().any(|l| l == line) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(found.is_ok(), "{} never written; got {:?}", line, device.written_lines());
}

#[tokio::test]
async fn test_send_command_resolves_after_write() {
    let (controller, device, _events) = connected(quiet_config()).await;

    let outcome = controller.send_command(Priority::Normal, "$CMD,AIR,FSPD,3").await.unwrap();
    assert_eq!(outcome, CommandOutcome::Sent);
    assert_eq!(device.written_lines(), vec!["$CMD,AIR,FSPD,3"]);

    controller.shutdown().await;
}

#[tokio::test]
async fn test_queued_commands_leave_in_priority_order() {
    let controller = HvacController::builder(quiet_config()).build();
    let mut events = controller.subscribe_events();

    // Nothing is written while no port is attached
    assert!(controller.enqueue_command(Priority::Low, "$CMD,AIR,AUTOMODE,ON").await.unwrap());
    assert!(controller.enqueue_command(Priority::Normal, "$CMD,AIR,FSPD,2").await.unwrap());
    assert!(controller.enqueue_command(Priority::High, "$CMD,AIR,FAN,OFF").await.unwrap());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(controller.status().await.unwrap().queue.total_sent, 0);

    let (port, device) = MockPort::pair();
    controller.attach(Box::new(port), "mock0").await;
    wait_written(&device, "$CMD,AIR,AUTOMODE,ON").await;
    assert_eq!(
        device.written_lines(),
        vec!["$CMD,AIR,FAN,OFF", "$CMD,AIR,FSPD,2", "$CMD,AIR,AUTOMODE,ON"]
    );

    let mut sent = Vec::new();
    while sent.len() < 3 {
        if let ControllerEvent::CommandSent { payload } =
            expect_event(&mut events, |e| matches!(e, ControllerEvent::CommandSent { .. })).await
        {
            sent.push(payload);
        }
    }
    assert_eq!(sent, device.written_lines());
    controller.shutdown().await;
}

#[tokio::test]
async fn test_reload_updates_shared_state_and_holds_queue() {
    let (controller, device, mut events) = connected(quiet_config()).await;
    let mut state_rx = controller.state_receiver();

    controller.request_reload(Subsystem::Dsct).await.unwrap();
    wait_written(&device, "$CMD,DSCT,RELOAD").await;
    assert!(matches!(
        controller.request_reload(Subsystem::Dsct).await,
        Err(ControllerError::Reload(_))
    ));

    // Queued traffic waits for the reload to finish
    controller.enqueue_command(Priority::High, "$CMD,DSCT,FAN1,OFF").await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(!device.written_lines().iter().any(|l| l == "$CMD,DSCT,FAN1,OFF"));

    device.feed_line("EEPROM_ACK,RELOAD,START");
    device.feed_line("DSCT,FAN1,ON");
    device.feed_line("DSCT,LDMP,OPEN");
    device.feed_line("DSCT_ACK,RELOAD,COMPLETE");

    let done = expect_event(&mut events, |e| matches!(e, ControllerEvent::ReloadCompleted { .. })).await;
    assert_eq!(
        done,
        ControllerEvent::ReloadCompleted { subsystem: Subsystem::Dsct, applied: 2, collected: 2 }
    );

    timeout(WAIT, state_rx.changed()).await.unwrap().unwrap();
    let state = state_rx.borrow().clone();
    assert_eq!(state.revision, 1);
    assert_eq!(state.get(Subsystem::Dsct, "FAN1"), Some(&["ON".to_string()][..]));
    assert_eq!(state.get(Subsystem::Dsct, "LDMP"), Some(&["OPEN".to_string()][..]));

    wait_written(&device, "$CMD,DSCT,FAN1,OFF").await;
    controller.shutdown().await;
}

#[tokio::test]
async fn test_reload_rejected_without_link() {
    let controller = HvacController::builder(quiet_config()).build();
    let err = controller.request_reload(Subsystem::Air).await.unwrap_err();
    assert!(matches!(err, ControllerError::Reload(hvac_link_lib::ReloadError::NotConnected)));
    controller.shutdown().await;
}

#[tokio::test]
async fn test_valve_open_with_progress() {
    let (controller, device, mut events) = connected(quiet_config()).await;

    controller.actuate_valve(ValveTarget::Open).await.unwrap();
    wait_written(&device, "$CMD,DSCT,SOL,OPEN").await;
    assert!(matches!(
        controller.actuate_valve(ValveTarget::Close).await,
        Err(ControllerError::Valve(ValveError::AlreadyInProgress))
    ));

    device.feed_line("DSCT,SOL,All Opening!");
    let progress = expect_event(&mut events, |e| matches!(e, ControllerEvent::ValveProgress { .. })).await;
    assert_eq!(
        progress,
        ControllerEvent::ValveProgress { target: ValveTarget::Open, ack: ValveAck::Opening }
    );

    device.feed_line("DSCT,SOL,All Open OK!");
    let done = expect_event(&mut events, |e| matches!(e, ControllerEvent::ValveCompleted { .. })).await;
    assert_eq!(done, ControllerEvent::ValveCompleted { target: ValveTarget::Open });
    assert_eq!(controller.status().await.unwrap().valve_target, None);

    controller.shutdown().await;
}

#[tokio::test]
async fn test_poll_cycle_walks_both_subsystems() {
    let (controller, device, mut events) = connected(quiet_config()).await;

    assert!(controller.start_polling().await.unwrap());
    wait_written(&device, "$CMD,AIR,TH").await;

    device.feed_line("[AIRCON] ID01,TEMP: 21.5, HUMI: 40.0");
    let updated = expect_event(&mut events, |e| matches!(e, ControllerEvent::SensorUpdated { .. })).await;
    match updated {
        ControllerEvent::SensorUpdated { subsystem, sensor_id, reading } => {
            assert_eq!(subsystem, Subsystem::Air);
            assert_eq!(sensor_id, "ID01");
            assert_eq!(reading.temp, Some(21.5));
            assert_eq!(reading.humi, Some(40.0));
        }
        other => panic!("unexpected {:?}", other),
    }

    device.feed_line("[AIRCON] SEQUENTIAL SCAN COMPLETE: Total: 6, Success: 1, Error: 5, Time: 120ms");
    let batch = expect_event(&mut events, |e| matches!(e, ControllerEvent::BatchComplete { .. })).await;
    if let ControllerEvent::BatchComplete { subsystem, summary, readings } = batch {
        assert_eq!(subsystem, Subsystem::Air);
        assert_eq!(summary.success, 1);
        assert_eq!(readings.len(), 6);
    }

    wait_written(&device, "$CMD,DSCT,TH").await;
    expect_event(&mut events, |e| {
        *e == ControllerEvent::PollStateChanged { state: PollState::Waiting(Subsystem::Dsct) }
    })
    .await;

    controller.stop_polling().await.unwrap();
    let status = controller.status().await.unwrap();
    assert!(!status.polling);
    assert_eq!(status.poll_state, PollState::Paused);

    controller.shutdown().await;
}

#[tokio::test]
async fn test_air_quality_reports_are_forwarded() {
    let (controller, device, mut events) = connected(quiet_config()).await;

    device.feed_line("PT02 587,0,13.3,10.9");
    let event = expect_event(&mut events, |e| matches!(e, ControllerEvent::AirQualityUpdated { .. })).await;
    if let ControllerEvent::AirQualityUpdated { reading } = event {
        assert_eq!(reading.co2_ppm, 587);
        assert_eq!(reading.humidity, Some(10.9));
    }
    controller.shutdown().await;
}

#[tokio::test]
async fn test_legacy_aircon_air_quality_is_forwarded_mid_scan() {
    let (controller, device, mut events) = connected(quiet_config()).await;
    assert!(controller.start_polling().await.unwrap());
    wait_written(&device, "$CMD,AIR,TH").await;

    device.feed_line("[AIRCON] 850,35,253");
    let event = expect_event(&mut events, |e| matches!(e, ControllerEvent::AirQualityUpdated { .. })).await;
    if let ControllerEvent::AirQualityUpdated { reading } = event {
        assert_eq!(reading.co2_ppm, 850);
        assert_eq!(reading.pm25, 35);
        assert_eq!(reading.temp, 25.3);
        assert_eq!(reading.humidity, None);
    }

    // The scan it interrupted carries on
    device.feed_line("[AIRCON] ID01,TEMP: 21.5, HUMI: 40.0");
    expect_event(&mut events, |e| matches!(e, ControllerEvent::SensorUpdated { .. })).await;
    controller.shutdown().await;
}

#[tokio::test]
async fn test_link_loss_fails_active_reload() {
    let (controller, device, mut events) = connected(quiet_config()).await;
    expect_event(&mut events, |e| *e == ControllerEvent::LinkHealthChanged { healthy: true }).await;

    controller.request_reload(Subsystem::Air).await.unwrap();
    device.feed_line("EEPROM_ACK,RELOAD,START");
    device.unplug();

    expect_event(&mut events, |e| *e == ControllerEvent::LinkHealthChanged { healthy: false }).await;
    let failed = expect_event(&mut events, |e| matches!(e, ControllerEvent::ReloadFailed { .. })).await;
    assert!(matches!(failed, ControllerEvent::ReloadFailed { subsystem: Subsystem::Air, .. }));

    let status = controller.status().await.unwrap();
    assert!(status.reloads_active.is_empty());
    assert!(!status.queue.paused);
    controller.shutdown().await;
}

#[tokio::test]
async fn test_failed_valve_command_never_reaches_the_next_link() {
    let (controller, device, mut events) = connected(quiet_config()).await;
    expect_event(&mut events, |e| *e == ControllerEvent::LinkHealthChanged { healthy: true }).await;

    // The reload holds the queue, so the valve command is still pending when the link drops
    controller.request_reload(Subsystem::Dsct).await.unwrap();
    wait_written(&device, "$CMD,DSCT,RELOAD").await;
    controller.actuate_valve(ValveTarget::Open).await.unwrap();
    device.unplug();

    let failed = expect_event(&mut events, |e| matches!(e, ControllerEvent::ValveFailed { .. })).await;
    assert_eq!(
        failed,
        ControllerEvent::ValveFailed { target: ValveTarget::Open, reason: "link lost".to_string() }
    );
    assert_eq!(controller.status().await.unwrap().queue.high, 0);

    let (port, device2) = MockPort::pair();
    controller.attach(Box::new(port), "mock1").await;
    expect_event(&mut events, |e| *e == ControllerEvent::LinkHealthChanged { healthy: true }).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(device2.written_lines().is_empty(), "got {:?}", device2.written_lines());

    // A fresh request goes out normally
    controller.actuate_valve(ValveTarget::Close).await.unwrap();
    wait_written(&device2, "$CMD,DSCT,SOL,CLOSE").await;
    assert!(!device2.written_lines().iter().any(|l| l == "$CMD,DSCT,SOL,OPEN"));
    controller.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_fails_pending_commands() {
    let controller = HvacController::builder(quiet_config()).build();
    let sender = controller.clone();
    let pending = tokio::spawn(async move { sender.send_command(Priority::Normal, "$CMD,AIR,FAN,ON").await });

    // Let the request reach the control task before stopping it
    tokio::time::sleep(Duration::from_millis(100)).await;
    controller.shutdown().await;

    let outcome = pending.await.unwrap().unwrap();
    assert!(!outcome.is_sent());
    assert!(matches!(controller.status().await, Err(ControllerError::ChannelClosed)));
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_valve_times_out_then_clears() {
    let (controller, device, mut events) = connected(quiet_config()).await;
    let started = tokio::time::Instant::now();

    controller.actuate_valve(ValveTarget::Close).await.unwrap();
    wait_written(&device, "$CMD,DSCT,SOL,CLOSE").await;

    let long_wait = Duration::from_secs(60);
    let mut flickers = 0;
    let timed_out = timeout(long_wait, async {
        loop {
            match events.recv().await {
                Some(ControllerEvent::ValveFlicker { .. }) => flickers += 1,
                Some(event @ ControllerEvent::ValveTimedOut { .. }) => return event,
                Some(_) => {}
                None => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("valve never timed out");
    assert_eq!(timed_out, ControllerEvent::ValveTimedOut { target: ValveTarget::Close });
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(20) && elapsed < Duration::from_secs(21), "{:?}", elapsed);
    assert!(flickers >= 38, "indicator flickered only {} times", flickers);

    timeout(long_wait, async {
        while let Some(event) = events.recv().await {
            if event == ControllerEvent::ValveErrorCleared {
                return;
            }
        }
    })
    .await
    .expect("error display never cleared");
    assert_eq!(controller.status().await.unwrap().valve_target, None);

    controller.shutdown().await;
}
