use std::time::Duration;

use hvac_link_lib::serial::mock::MockPort;
use hvac_link_lib::serial::{Line, LineSink, LineTransport, SerialError};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

async fn next_line(rx: &mut mpsc::UnboundedReceiver<Line>) -> String {
    timeout(WAIT, rx.recv())
        .await
        .expect("no line within timeout")
        .expect("line stream closed")
        .into_string()
}

async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn test_lines_reach_every_subscriber_in_order() {
    let transport = LineTransport::new();
    let (port, device) = MockPort::pair();
    let mut first = transport.subscribe();
    let mut second = transport.subscribe();
    transport.attach(Box::new(port), "mock0").await;
    assert!(transport.is_connected());

    device.feed_line("EEPROM_ACK,RELOAD,START");
    device.feed_bytes(b"DSCT,FAN1,");
    device.feed_bytes(b"ON\nDSCT_ACK,RELOAD,COMPLETE\r\n\r\n");

    let expected = ["EEPROM_ACK,RELOAD,START", "DSCT,FAN1,ON", "DSCT_ACK,RELOAD,COMPLETE"];
    for rx in [&mut first, &mut second] {
        for line in expected {
            assert_eq!(next_line(rx).await, line);
        }
    }

    let metrics = transport.metrics_receiver().borrow().clone();
    assert_eq!(metrics.lines_read, 3);
    transport.close().await;
}

#[tokio::test]
async fn test_send_line_appends_crlf() {
    let transport = LineTransport::new();
    let (port, device) = MockPort::pair();
    transport.attach(Box::new(port), "mock0").await;

    transport.send_line("$CMD,AIR,FSPD,3").await.unwrap();
    transport.send_line("$CMD,DSCT,TH").await.unwrap();

    assert_eq!(device.written_lines(), vec!["$CMD,AIR,FSPD,3", "$CMD,DSCT,TH"]);
    transport.close().await;
}

#[tokio::test]
async fn test_send_without_port_is_rejected() {
    let transport = LineTransport::new();
    assert!(!transport.is_connected());
    let err = transport.send_line("$CMD,AIR,TH").await.unwrap_err();
    assert!(matches!(err, SerialError::NotConnected));
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let transport = LineTransport::new();
    let (port, device) = MockPort::pair();
    transport.attach(Box::new(port), "mock0").await;

    transport.close().await;
    transport.close().await;
    assert!(!transport.is_connected());
    assert!(transport.send_line("$CMD,AIR,TH").await.is_err());
    assert_eq!(device.write_attempts(), 0);
}

#[tokio::test]
async fn test_single_write_failure_keeps_link_up() {
    let transport = LineTransport::new();
    let (port, device) = MockPort::pair();
    transport.attach(Box::new(port), "mock0").await;

    device.fail_next_writes(1);
    assert!(matches!(
        transport.send_line("$CMD,AIR,FAN,ON").await,
        Err(SerialError::WriteFailed(_))
    ));
    assert!(transport.is_connected());
    transport.send_line("$CMD,AIR,FAN,ON").await.unwrap();
    assert_eq!(device.written_lines(), vec!["$CMD,AIR,FAN,ON"]);
    assert_eq!(transport.metrics_receiver().borrow().write_errors, 1);
    transport.close().await;
}

#[tokio::test]
async fn test_unplugged_port_marks_link_down() {
    let transport = LineTransport::new();
    let (port, device) = MockPort::pair();
    transport.attach(Box::new(port), "mock0").await;

    device.unplug();
    let observer = transport.clone();
    assert!(wait_for(move || !observer.is_connected()).await, "read failure must drop the link");
    assert!(transport.metrics_receiver().borrow().last_error.is_some());
    transport.close().await;
}

#[tokio::test]
async fn test_garbage_bytes_are_decoded_lossily() {
    let transport = LineTransport::new();
    let (port, device) = MockPort::pair();
    let mut rx = transport.subscribe();
    transport.attach(Box::new(port), "mock0").await;

    device.feed_bytes(&[b'A', b'I', b'R', 0xC3, b'\n']);
    device.feed_line("AIR,FAN,ON");

    assert_eq!(next_line(&mut rx).await, "AIR\u{FFFD}");
    assert_eq!(next_line(&mut rx).await, "AIR,FAN,ON");
    assert_eq!(transport.metrics_receiver().borrow().utf8_decode_errors, 1);
    transport.close().await;
}

#[tokio::test]
async fn test_subscribe_with_callback() {
    let transport = LineTransport::new();
    let (port, device) = MockPort::pair();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let task = transport.subscribe_with(move |line| {
        let _ = tx.send(line.into_string());
    });
    transport.attach(Box::new(port), "mock0").await;

    device.feed_line("PT02 450,12,23.5,41.0");
    let got = timeout(WAIT, rx.recv()).await.unwrap();
    assert_eq!(got.as_deref(), Some("PT02 450,12,23.5,41.0"));

    transport.close().await;
    task.abort();
}

#[tokio::test]
async fn test_unsupported_baud_rate_is_rejected_before_open() {
    let transport = LineTransport::new();
    let err = transport.open("/dev/does-not-exist", 12345).await.unwrap_err();
    assert!(matches!(err, SerialError::UnsupportedBaudRate(12345)));
    assert!(!transport.is_connected());
}
