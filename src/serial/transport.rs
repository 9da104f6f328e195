//! Line transport: one background read task per open port, framed lines fanned out
//! to subscribers, and a single locked write path.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use super::framing::{Line, LineFramer};
use super::{LineSink, Result, SerialDeviceInfo, SerialError, SerialInterface, SerialPortIO};
use crate::bus::EventBus;

/// How long one read call may hold the port lock before yielding to writers.
const READ_POLL_MS: u64 = 25;
const READ_CHUNK: usize = 512;
const READER_STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TransportMetrics {
    pub lines_read: u64,
    pub bytes_read: u64,
    pub trimmed_bytes: u64,
    pub utf8_decode_errors: u64,
    pub write_errors: u64,
    pub last_error: Option<String>,
}

struct ReaderTask {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Cheap-to-clone handle to the single physical link.
#[derive(Clone)]
pub struct LineTransport {
    interface: Arc<Mutex<SerialInterface>>,
    connected: Arc<AtomicBool>,
    lines: EventBus<Line>,
    reader: Arc<StdMutex<Option<ReaderTask>>>,
    metrics_tx: Arc<watch::Sender<TransportMetrics>>,
    metrics_rx: watch::Receiver<TransportMetrics>,
}

impl LineTransport {
    pub fn new() -> Self {
        let (metrics_tx, metrics_rx) = watch::channel(TransportMetrics::default());
        Self {
            interface: Arc::new(Mutex::new(SerialInterface::new())),
            connected: Arc::new(AtomicBool::new(false)),
            lines: EventBus::new(),
            reader: Arc::new(StdMutex::new(None)),
            metrics_tx: Arc::new(metrics_tx),
            metrics_rx,
        }
    }

    /// Open a physical port and start the read loop. Any previously open port is closed first.
    pub async fn open(&self, port_name: &str, baud_rate: u32) -> Result<SerialDeviceInfo> {
        self.close().await;
        let info = {
            let mut interface = self.interface.lock().await;
            interface.open(port_name, baud_rate)?;
            interface
                .device_info()
                .cloned()
                .ok_or(SerialError::NotConnected)?
        };
        self.start_reader();
        Ok(info)
    }

    /// Attach an already-open byte stream (mock ports, pre-opened handles).
    pub async fn attach(&self, io: Box<dyn SerialPortIO>, port_name: &str) {
        self.close().await;
        {
            let mut interface = self.interface.lock().await;
            *interface = SerialInterface::from_io(io, port_name);
        }
        self.start_reader();
    }

    /// Stop the read loop and release the port. Idempotent.
    pub async fn close(&self) {
        let task = match self.reader.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            let _ = task.stop_tx.send(()).await;
            if tokio::time::timeout(READER_STOP_GRACE, task.handle).await.is_err() {
                log::warn!("Serial read task did not stop within {:?}", READER_STOP_GRACE);
            }
        }
        self.interface.lock().await.close();
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Write raw bytes. Fails with `NotConnected` when no port is open; a failed write
    /// that indicates link loss marks the transport disconnected.
    pub async fn send(&self, bytes: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(SerialError::NotConnected);
        }
        let result = {
            let mut interface = self.interface.lock().await;
            interface.send_data(bytes).await
        };
        if let Err(e) = &result {
            let message = e.to_string();
            self.metrics_tx.send_modify(|m| {
                m.write_errors += 1;
                m.last_error = Some(message.clone());
            });
            if e.is_link_loss() {
                log::error!("Serial write failed, marking link down: {}", message);
                self.connected.store(false, Ordering::SeqCst);
            }
        }
        result
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Line> {
        self.lines.subscribe()
    }

    /// Invoke `callback` once per received line, in arrival order.
    pub fn subscribe_with<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: FnMut(Line) + Send + 'static,
    {
        self.lines.subscribe_with(callback)
    }

    pub fn metrics_receiver(&self) -> watch::Receiver<TransportMetrics> {
        self.metrics_rx.clone()
    }

    fn start_reader(&self) {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        self.connected.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(read_loop(
            Arc::clone(&self.interface),
            Arc::clone(&self.connected),
            self.lines.clone(),
            Arc::clone(&self.metrics_tx),
            stop_rx,
        ));
        let task = ReaderTask { stop_tx, handle };
        match self.reader.lock() {
            Ok(mut guard) => *guard = Some(task),
            Err(poisoned) => *poisoned.into_inner() = Some(task),
        }
    }
}

impl Default for LineTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl LineSink for LineTransport {
    fn is_connected(&self) -> bool {
        LineTransport::is_connected(self)
    }

    async fn send_line(&self, line: &str) -> Result<()> {
        let framed = format!("{}\r\n", line);
        self.send(framed.as_bytes()).await
    }
}

async fn read_loop(
    interface: Arc<Mutex<SerialInterface>>,
    connected: Arc<AtomicBool>,
    lines: EventBus<Line>,
    metrics_tx: Arc<watch::Sender<TransportMetrics>>,
    mut stop_rx: mpsc::Receiver<()>,
) {
    let mut framer = LineFramer::new();
    log::debug!("Serial read task started");

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            read_res = async {
                let mut buf = [0u8; READ_CHUNK];
                let mut guard = interface.lock().await;
                guard.read_data(&mut buf, READ_POLL_MS).await.map(|n| buf[..n].to_vec())
            } => {
                match read_res {
                    Ok(chunk) if !chunk.is_empty() => {
                        let (framed, stats) = framer.push(&chunk);
                        metrics_tx.send_modify(|m| {
                            m.bytes_read += chunk.len() as u64;
                            m.lines_read += framed.len() as u64;
                            m.trimmed_bytes += stats.trimmed_bytes as u64;
                            m.utf8_decode_errors += stats.lossy_lines as u64;
                        });
                        for line in framed {
                            log::trace!("RX {}", line);
                            lines.publish(line);
                        }
                    }
                    Ok(_) | Err(SerialError::Timeout) => {}
                    Err(e) => {
                        let message = e.to_string();
                        log::error!("Serial read failed, stopping read task: {}", message);
                        metrics_tx.send_modify(|m| m.last_error = Some(message.clone()));
                        connected.store(false, Ordering::SeqCst);
                        break;
                    }
                }
            }
        }
    }
    log::debug!("Serial read task stopped");
}
