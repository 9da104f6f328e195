use std::io::{Read, Write};
use std::time::Duration;
use serialport::{ClearBuffer, SerialPort, SerialPortType};
use tokio::time::timeout;

use super::{Result, SerialDeviceInfo, SerialError, SerialPortIO};

pub const DEFAULT_BAUD_RATE: u32 = 115200;
pub const SUPPORTED_BAUD_RATES: [u32; 7] = [9600, 14400, 19200, 28800, 38400, 57600, 115200];

// Short OS-level read timeout; the async poll loop below enforces the real one.
const PORT_READ_TIMEOUT_MS: u64 = 10;
const POLL_STEP_MS: u64 = 5;

/// Owner of the single open port. Holds no framing state; see `LineFramer`.
pub struct SerialInterface {
    port: Option<Box<dyn SerialPortIO>>,
    device_info: Option<SerialDeviceInfo>,
}

impl SerialInterface {
    pub fn new() -> Self {
        Self {
            port: None,
            device_info: None,
        }
    }

    /// Wrap an already-open port (used by tests and by callers that open ports themselves).
    pub fn from_io(io: Box<dyn SerialPortIO>, port_name: &str) -> Self {
        Self {
            port: Some(io),
            device_info: Some(SerialDeviceInfo {
                port_name: port_name.to_string(),
                description: "attached".to_string(),
            }),
        }
    }

    /// Enumerate every serial port the OS reports.
    pub fn available_ports() -> Result<Vec<SerialDeviceInfo>> {
        let ports = serialport::available_ports()?;
        Ok(ports
            .into_iter()
            .map(|port| {
                let description = match &port.port_type {
                    SerialPortType::UsbPort(usb) => usb
                        .product
                        .clone()
                        .unwrap_or_else(|| format!("USB {:04X}:{:04X}", usb.vid, usb.pid)),
                    SerialPortType::PciPort => "PCI serial port".to_string(),
                    SerialPortType::BluetoothPort => "Bluetooth serial port".to_string(),
                    SerialPortType::Unknown => "Serial port".to_string(),
                };
                SerialDeviceInfo {
                    port_name: port.port_name,
                    description,
                }
            })
            .collect())
    }

    /// Open `port_name` at `baud_rate`, replacing any port that is already open.
    pub fn open(&mut self, port_name: &str, baud_rate: u32) -> Result<()> {
        if !SUPPORTED_BAUD_RATES.contains(&baud_rate) {
            return Err(SerialError::UnsupportedBaudRate(baud_rate));
        }

        let device_info = Self::available_ports()?
            .into_iter()
            .find(|p| p.port_name == port_name)
            .ok_or_else(|| SerialError::PortNotFound(port_name.to_string()))?;

        if self.port.is_some() {
            self.close();
        }

        let port = serialport::new(port_name, baud_rate)
            .timeout(Duration::from_millis(PORT_READ_TIMEOUT_MS))
            .open()
            .map_err(|e| SerialError::OpenFailed(e.to_string()))?;

        let mut native: Box<dyn SerialPortIO> = Box::new(NativePort::new(port));
        native.clear_input()?;

        self.port = Some(native);
        self.device_info = Some(device_info);

        log::info!("Serial port connected to {} at {} baud", port_name, baud_rate);
        Ok(())
    }

    /// Close the port. Safe to call when nothing is open.
    pub fn close(&mut self) {
        if let Some(device) = self.device_info.take() {
            log::info!("Closing serial port {}", device.port_name);
        }
        self.port = None;
    }

    pub fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    pub fn device_info(&self) -> Option<&SerialDeviceInfo> {
        self.device_info.as_ref()
    }

    pub async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        let port = self.port.as_mut().ok_or(SerialError::NotConnected)?;
        port.send_data(data).await?;
        port.flush().await
    }

    pub async fn read_data(&mut self, buffer: &mut [u8], timeout_ms: u64) -> Result<usize> {
        let port = self.port.as_mut().ok_or(SerialError::NotConnected)?;
        port.read_data(buffer, timeout_ms).await
    }
}

impl Default for SerialInterface {
    fn default() -> Self {
        Self::new()
    }
}

/// `SerialPortIO` over a real OS port.
pub struct NativePort {
    port: Box<dyn SerialPort>,
}

impl NativePort {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }
}

#[async_trait::async_trait]
impl SerialPortIO for NativePort {
    async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        self.port.write_all(data).map_err(|e| match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted => {
                SerialError::WriteFailed(e.to_string())
            }
            _ => SerialError::IoError(e),
        })
    }

    async fn read_data(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<usize> {
        let port = &mut self.port;
        let read_operation = async {
            loop {
                match port.bytes_to_read() {
                    Ok(0) => tokio::time::sleep(Duration::from_millis(POLL_STEP_MS)).await,
                    Ok(_) => match port.read(buf) {
                        Ok(0) => return Err(SerialError::IoError(std::io::ErrorKind::UnexpectedEof.into())),
                        Ok(n) => return Ok(n),
                        Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                        Err(e) => return Err(SerialError::IoError(e)),
                    },
                    Err(e) => return Err(SerialError::SerialportError(e)),
                }
            }
        };

        timeout(Duration::from_millis(timeout_ms), read_operation)
            .await
            .map_err(|_| SerialError::Timeout)?
    }

    async fn flush(&mut self) -> Result<()> {
        self.port.flush().map_err(SerialError::IoError)
    }

    fn clear_input(&mut self) -> Result<()> {
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}
