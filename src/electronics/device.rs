//! Line-oriented access to the control board.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the control board and its command channel.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("electronics device not found: {0}")]
    NotFound(String),
    #[error("electronics device is not connected")]
    NotConnected,
    #[error("no response from device within {0:?}")]
    Timeout(Duration),
    #[error("unexpected response to {command}: {response:?}")]
    Protocol { command: String, response: String },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A newline-delimited ASCII command device.
///
/// Implementations are not synchronised; callers go through
/// [`DeviceChannel`](super::DeviceChannel), which serialises access.
pub trait ElectronicsDevice: Send {
    /// Human-readable name for logs (port path, simulator id).
    fn name(&self) -> &str;

    /// Sends one command line; the terminator is appended.
    fn write_line(&mut self, command: &str) -> Result<(), DeviceError>;

    /// Sends raw bytes without a terminator.
    fn write_raw(&mut self, bytes: &[u8]) -> Result<(), DeviceError>;

    /// Reads one response line, without its terminator.
    fn read_line(&mut self) -> Result<String, DeviceError>;

    /// Drops input received but not yet read. Returns the number of bytes
    /// discarded.
    fn discard_input(&mut self) -> Result<usize, DeviceError>;

    /// Sends a command and reads its one-line response.
    ///
    /// Input left over from an earlier exchange, such as a reply that
    /// arrived after its [`DeviceError::Timeout`], is discarded first so it
    /// is never taken as the answer to `command`.
    fn query(&mut self, command: &str) -> Result<String, DeviceError> {
        let stale = self.discard_input()?;
        if stale > 0 {
            tracing::debug!(device = %self.name(), command, stale, "Discarded stale input");
        }
        self.write_line(command)?;
        self.read_line()
    }

    /// Releases the underlying port. Further calls fail.
    fn close(&mut self);
}
