#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use hvac_link_lib::serial::{LineSink, SerialError};
use hvac_link_lib::queue::CommandOutcome;

/// `LineSink` that records every line, can fail on demand and notices overlapping writes.
#[derive(Default)]
pub struct RecordingSink {
    pub disconnected: AtomicBool,
    pub fail_next: AtomicUsize,
    pub fail_always: AtomicBool,
    pub overlaps: AtomicUsize,
    in_flight: AtomicBool,
    sent: Mutex<Vec<String>>,
    pub journal: Journal,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn set_connected(&self, connected: bool) {
        self.disconnected.store(!connected, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl LineSink for RecordingSink {
    fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst)
    }

    async fn send_line(&self, line: &str) -> Result<(), SerialError> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.journal.push(format!("send:{}", line));
        tokio::task::yield_now().await;

        let remaining = self.fail_next.load(Ordering::SeqCst);
        let result = if self.fail_always.load(Ordering::SeqCst) || remaining > 0 {
            if remaining > 0 {
                self.fail_next.store(remaining - 1, Ordering::SeqCst);
            }
            Err(SerialError::WriteFailed("simulated".to_string()))
        } else {
            self.sent.lock().unwrap().push(line.to_string());
            Ok(())
        };
        self.in_flight.store(false, Ordering::SeqCst);
        result
    }
}

/// Ordered log shared between a sink and result callbacks.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Callback that records `result:<tag>:<ok|fail>`.
    pub fn callback(&self, tag: &str) -> hvac_link_lib::queue::ResultCallback {
        let journal = self.clone();
        let tag = tag.to_string();
        Box::new(move |outcome: CommandOutcome| {
            let status = if outcome.is_sent() { "ok" } else { "fail" };
            journal.push(format!("result:{}:{}", tag, status));
        })
    }
}
