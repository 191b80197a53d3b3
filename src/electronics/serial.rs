//! Control board attached over a USB serial port.

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, SerialPort};

use super::device::{DeviceError, ElectronicsDevice};

/// Baud rate of the board firmware.
pub const DEFAULT_BAUD_RATE: u32 = 19_200;

const LINE_TERMINATOR: &str = "\n";

/// [`ElectronicsDevice`] over a serial port.
pub struct SerialBoard {
    name: String,
    port: Option<Box<dyn SerialPort>>,
    response_timeout: Duration,
    pending: Vec<u8>,
}

impl SerialBoard {
    /// Opens `path` at `baud_rate`.
    pub fn open(path: &str, baud_rate: u32, response_timeout: Duration) -> Result<Self, DeviceError> {
        let port = serialport::new(path, baud_rate)
            // Short port timeout; the response deadline is enforced in read_line.
            .timeout(Duration::from_millis(50))
            .open()
            .map_err(|err| match err.kind() {
                serialport::ErrorKind::NoDevice => DeviceError::NotFound(path.to_string()),
                _ => DeviceError::Serial(err),
            })?;
        tracing::info!(port = path, baud_rate, "Opened serial board");
        Ok(Self {
            name: path.to_string(),
            port: Some(port),
            response_timeout,
            pending: Vec::new(),
        })
    }

    /// Opens the `index`-th USB serial port, or `port` when given.
    pub fn discover(
        port: Option<&str>,
        index: usize,
        baud_rate: u32,
        response_timeout: Duration,
    ) -> Result<Self, DeviceError> {
        if let Some(path) = port {
            return Self::open(path, baud_rate, response_timeout);
        }
        let ports = Self::list_ports()?;
        let path = ports
            .get(index)
            .ok_or_else(|| DeviceError::NotFound(format!("no USB serial port at index {index}")))?;
        Self::open(path, baud_rate, response_timeout)
    }

    /// Paths of the USB serial ports present on the system.
    pub fn list_ports() -> Result<Vec<String>, DeviceError> {
        let ports = serialport::available_ports()?;
        Ok(ports
            .into_iter()
            .filter(|p| matches!(p.port_type, serialport::SerialPortType::UsbPort(_)))
            .map(|p| p.port_name)
            .collect())
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>, DeviceError> {
        self.port.as_mut().ok_or(DeviceError::NotConnected)
    }
}

impl ElectronicsDevice for SerialBoard {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_line(&mut self, command: &str) -> Result<(), DeviceError> {
        tracing::trace!(port = %self.name, command, "Serial write");
        let port = self.port()?;
        port.write_all(command.as_bytes())?;
        port.write_all(LINE_TERMINATOR.as_bytes())?;
        port.flush()?;
        Ok(())
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<(), DeviceError> {
        let port = self.port()?;
        port.write_all(bytes)?;
        port.flush()?;
        Ok(())
    }

    fn read_line(&mut self) -> Result<String, DeviceError> {
        let timeout = self.response_timeout;
        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; 64];
        loop {
            if let Some(end) = self.pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.pending.drain(..=end).collect();
                let response = String::from_utf8_lossy(&line).trim().to_string();
                tracing::trace!(port = %self.name, response = %response, "Serial read");
                return Ok(response);
            }
            if Instant::now() >= deadline {
                return Err(DeviceError::Timeout(timeout));
            }
            let port = self.port()?;
            match port.read(&mut chunk) {
                Ok(0) => {}
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(err) if matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn discard_input(&mut self) -> Result<usize, DeviceError> {
        let buffered = self.pending.len();
        self.pending.clear();
        let port = self.port()?;
        let waiting = port.bytes_to_read()? as usize;
        port.clear(ClearBuffer::Input)?;
        Ok(buffered + waiting)
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            tracing::info!(port = %self.name, "Serial board closed");
        }
    }
}

impl std::fmt::Debug for SerialBoard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialBoard")
            .field("name", &self.name)
            .field("open", &self.port.is_some())
            .finish()
    }
}
