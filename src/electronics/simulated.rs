//! In-memory stand-in for the control board firmware.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::device::{DeviceError, ElectronicsDevice};

/// One event on the simulated wire, in the order the board saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    Write(String),
    Raw(Vec<u8>),
    Read(String),
}

/// Shared, cloneable view on the wire traffic of a [`SimulatedBoard`].
#[derive(Debug, Clone, Default)]
pub struct WireLog(Arc<Mutex<Vec<WireEvent>>>);

impl WireLog {
    pub fn events(&self) -> Vec<WireEvent> {
        self.0.lock().clone()
    }

    /// Command lines written, in order.
    pub fn commands(&self) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .filter_map(|event| match event {
                WireEvent::Write(line) => Some(line.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }

    fn push(&self, event: WireEvent) {
        self.0.lock().push(event);
    }
}

/// Simulated board speaking the firmware protocol.
///
/// Every command line gets a one-line answer; a piezo move answers once
/// its motion byte has arrived. Temperatures are fixed unless overridden.
#[derive(Debug)]
pub struct SimulatedBoard {
    name: String,
    responses: VecDeque<String>,
    awaiting_motion: bool,
    fail_idn: bool,
    late_reply: Option<String>,
    withheld: Option<String>,
    latency: Duration,
    temperatures: (f64, f64),
    log: WireLog,
    open: bool,
}

impl SimulatedBoard {
    pub fn new() -> Self {
        Self {
            name: "simulated-board".into(),
            responses: VecDeque::new(),
            awaiting_motion: false,
            fail_idn: false,
            late_reply: None,
            withheld: None,
            latency: Duration::ZERO,
            temperatures: (31.5, 22.0),
            log: WireLog::default(),
            open: true,
        }
    }

    /// Makes the first `IDN` answer garbage followed by a stale line, the
    /// way a freshly reset board does.
    pub fn with_noisy_startup(mut self) -> Self {
        self.fail_idn = true;
        self
    }

    /// Answers the first `command` only after the read waiting for it has
    /// timed out, the way a busy board does.
    pub fn with_late_reply(mut self, command: &str) -> Self {
        self.late_reply = Some(command.to_string());
        self
    }

    /// Delay applied to every read, to widen race windows in tests.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_temperatures(mut self, electronics: f64, sample: f64) -> Self {
        self.temperatures = (electronics, sample);
        self
    }

    pub fn wire_log(&self) -> WireLog {
        self.log.clone()
    }

    fn respond(&mut self, command: &str) -> Result<(), DeviceError> {
        let invalid = || DeviceError::InvalidArgument(format!("simulated board rejects {command:?}"));
        let response = if command == "IDN" {
            if self.fail_idn {
                self.fail_idn = false;
                self.responses.push_back("\u{fffd}".into());
                return Err(DeviceError::Timeout(Duration::ZERO));
            }
            "Dispertech simulated board".to_string()
        } else if let Some(value) = command.strip_prefix("OUT:") {
            value.parse::<u32>().map_err(|_| invalid())?;
            "OK".to_string()
        } else if let Some(rest) = command.strip_prefix("LED:") {
            let mut parts = rest.split(':');
            let led = parts.next().and_then(|v| v.parse::<u8>().ok());
            let status = parts.next().and_then(|v| v.parse::<u8>().ok());
            match (led, status) {
                (Some(0..=5), Some(0..=1)) => "OK".to_string(),
                _ => return Err(invalid()),
            }
        } else if let Some(position) = command.strip_prefix("serv:") {
            position.parse::<u32>().map_err(|_| invalid())?;
            "OK".to_string()
        } else if let Some(axis) = command.strip_prefix("mot") {
            axis.parse::<u8>().map_err(|_| invalid())?;
            self.awaiting_motion = true;
            "OK".to_string()
        } else if command == "TEM:0" {
            format!("{:.2}", self.temperatures.0)
        } else if command == "TEM:1" {
            format!("{:.2}", self.temperatures.1)
        } else {
            "ERR".to_string()
        };
        if self.late_reply.as_deref() == Some(command) {
            self.late_reply = None;
            self.withheld = Some(response);
        } else {
            self.responses.push_back(response);
        }
        Ok(())
    }
}

impl Default for SimulatedBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl ElectronicsDevice for SimulatedBoard {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_line(&mut self, command: &str) -> Result<(), DeviceError> {
        if !self.open {
            return Err(DeviceError::NotConnected);
        }
        self.log.push(WireEvent::Write(command.to_string()));
        self.respond(command)
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<(), DeviceError> {
        if !self.open {
            return Err(DeviceError::NotConnected);
        }
        self.log.push(WireEvent::Raw(bytes.to_vec()));
        if std::mem::take(&mut self.awaiting_motion) {
            self.responses.push_back("moved".into());
        }
        Ok(())
    }

    fn read_line(&mut self) -> Result<String, DeviceError> {
        if !self.open {
            return Err(DeviceError::NotConnected);
        }
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        let Some(line) = self.responses.pop_front() else {
            // A withheld answer lands once its reader has given up.
            if let Some(late) = self.withheld.take() {
                self.responses.push_back(late);
            }
            return Err(DeviceError::Timeout(self.latency));
        };
        self.log.push(WireEvent::Read(line.clone()));
        Ok(line)
    }

    fn discard_input(&mut self) -> Result<usize, DeviceError> {
        if !self.open {
            return Err(DeviceError::NotConnected);
        }
        let mut discarded = 0;
        for line in self.responses.drain(..) {
            discarded += line.len() + 1;
            self.log.push(WireEvent::Read(line));
        }
        Ok(discarded)
    }

    fn close(&mut self) {
        self.open = false;
    }
}
