//! In-memory port used to emulate the controller board in tests and demos.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use super::{Result, SerialError, SerialPortIO};

#[derive(Default)]
struct MockShared {
    written: Mutex<Vec<u8>>,
    failing_writes: AtomicUsize,
    write_attempts: AtomicUsize,
    unplugged: AtomicBool,
}

/// The port half, handed to `LineTransport::attach`.
pub struct MockPort {
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: VecDeque<u8>,
    shared: Arc<MockShared>,
}

/// The test half: feeds device output and inspects what the host wrote.
#[derive(Clone)]
pub struct MockPortHandle {
    inbound: mpsc::UnboundedSender<Vec<u8>>,
    shared: Arc<MockShared>,
}

impl MockPort {
    pub fn pair() -> (MockPort, MockPortHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(MockShared::default());
        (
            MockPort {
                inbound: rx,
                pending: VecDeque::new(),
                shared: Arc::clone(&shared),
            },
            MockPortHandle { inbound: tx, shared },
        )
    }

    fn drain_pending(&mut self, buf: &mut [u8]) -> usize {
        let n = self.pending.len().min(buf.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        n
    }
}

impl MockPortHandle {
    /// Queue a line as if the device had sent it, CR LF appended.
    pub fn feed_line(&self, line: &str) {
        self.feed_bytes(format!("{}\r\n", line).as_bytes());
    }

    pub fn feed_bytes(&self, bytes: &[u8]) {
        let _ = self.inbound.send(bytes.to_vec());
    }

    /// Everything written so far, split into lines.
    pub fn written_lines(&self) -> Vec<String> {
        let written = match self.shared.written.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        String::from_utf8_lossy(&written)
            .split(['\r', '\n'])
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Make the next `count` writes fail.
    pub fn fail_next_writes(&self, count: usize) {
        self.shared.failing_writes.store(count, Ordering::SeqCst);
    }

    pub fn write_attempts(&self) -> usize {
        self.shared.write_attempts.load(Ordering::SeqCst)
    }

    /// Simulate the cable being pulled: every later read and write fails.
    pub fn unplug(&self) {
        self.shared.unplugged.store(true, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl SerialPortIO for MockPort {
    async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        self.shared.write_attempts.fetch_add(1, Ordering::SeqCst);
        if self.shared.unplugged.load(Ordering::SeqCst) {
            return Err(SerialError::IoError(std::io::ErrorKind::BrokenPipe.into()));
        }
        let remaining = self.shared.failing_writes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.shared.failing_writes.store(remaining - 1, Ordering::SeqCst);
            return Err(SerialError::WriteFailed("simulated write failure".to_string()));
        }
        match self.shared.written.lock() {
            Ok(mut guard) => guard.extend_from_slice(data),
            Err(poisoned) => poisoned.into_inner().extend_from_slice(data),
        }
        Ok(())
    }

    async fn read_data(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<usize> {
        if self.shared.unplugged.load(Ordering::SeqCst) {
            return Err(SerialError::IoError(std::io::ErrorKind::BrokenPipe.into()));
        }
        if !self.pending.is_empty() {
            return Ok(self.drain_pending(buf));
        }
        match tokio::time::timeout(Duration::from_millis(timeout_ms), self.inbound.recv()).await {
            Ok(Some(bytes)) => {
                self.pending.extend(bytes);
                Ok(self.drain_pending(buf))
            }
            Ok(None) => {
                // Test half dropped: behave like an idle line.
                tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                Err(SerialError::Timeout)
            }
            Err(_) => Err(SerialError::Timeout),
        }
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
