pub mod interface;
pub mod framing;
pub mod transport;
pub mod mock;

pub use interface::{SerialInterface, NativePort, DEFAULT_BAUD_RATE, SUPPORTED_BAUD_RATES};
pub use framing::{Line, LineFramer, MAX_BUFFERED_BYTES};
pub use transport::{LineTransport, TransportMetrics};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SerialDeviceInfo {
    pub port_name: String,
    pub description: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Failed to open port: {0}")]
    OpenFailed(String),

    #[error("Unsupported baud rate: {0}")]
    UnsupportedBaudRate(u32),

    #[error("Serial port is not connected")]
    NotConnected,

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Communication timeout")]
    Timeout,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

impl SerialError {
    /// Errors that mean the physical link is gone rather than a single slow read.
    pub fn is_link_loss(&self) -> bool {
        matches!(
            self,
            SerialError::NotConnected | SerialError::IoError(_) | SerialError::SerialportError(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SerialError>;

/// Byte-level access to an open port. Implemented by the native port and by the
/// in-memory mock used in tests.
#[async_trait::async_trait]
pub trait SerialPortIO: Send {
    async fn send_data(&mut self, data: &[u8]) -> Result<()>;

    /// Read whatever is available, waiting at most `timeout_ms`. Returns
    /// `SerialError::Timeout` when nothing arrived.
    async fn read_data(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<usize>;

    async fn flush(&mut self) -> Result<()>;

    /// Drop any bytes the OS has already buffered for reading.
    fn clear_input(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Outbound side of the link as seen by the command queue and the exchanges.
#[async_trait::async_trait]
pub trait LineSink: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Write one command line; the implementation appends the terminator.
    async fn send_line(&self, line: &str) -> Result<()>;
}
