//! Serialised command channel to the control board.
//!
//! Every exchange runs under one re-entrant lock, so a caller can hold
//! [`DeviceChannel::lock`] across a multi-command sequence (a piezo move is
//! a command, a raw byte and a read) while the helpers it calls take the
//! same lock again. Queries from other threads, including the temperature
//! monitor, never interleave with the sequence.

use std::cell::RefCell;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use serde::{Deserialize, Serialize};

use super::board::{encode_motion, laser_output, BoardState, Led, Temperatures, LASER_LED_THRESHOLD};
use super::device::{DeviceError, ElectronicsDevice};

/// Temperature polling interval used when none is configured.
pub const DEFAULT_TEMPERATURE_INTERVAL: Duration = Duration::from_secs(5);

/// Longest temperature polling interval accepted.
pub const MAX_TEMPERATURE_INTERVAL: Duration = Duration::from_secs(3600);

/// Connection and monitoring settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Wait after opening the port; the board resets when the port opens.
    pub settle_ms: u64,
    /// Polling interval of the temperature monitor.
    pub temperature_interval_s: f64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            settle_ms: 2000,
            temperature_interval_s: DEFAULT_TEMPERATURE_INTERVAL.as_secs_f64(),
        }
    }
}

impl ChannelConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    /// Polling interval, capped at [`MAX_TEMPERATURE_INTERVAL`]. Values that
    /// are not positive fall back to the default.
    pub fn temperature_interval(&self) -> Duration {
        let secs = self.temperature_interval_s;
        if secs.is_nan() || secs <= 0.0 {
            return DEFAULT_TEMPERATURE_INTERVAL;
        }
        Duration::try_from_secs_f64(secs.min(MAX_TEMPERATURE_INTERVAL.as_secs_f64()))
            .unwrap_or(DEFAULT_TEMPERATURE_INTERVAL)
    }
}

type DeviceCell = RefCell<Option<Box<dyn ElectronicsDevice>>>;

struct MonitorHandle {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

struct ChannelInner {
    name: String,
    device: ReentrantMutex<DeviceCell>,
    state: Mutex<BoardState>,
    temperatures: Mutex<Option<Temperatures>>,
    monitor: Mutex<Option<MonitorHandle>>,
}

/// Exclusive, re-entrant access to the board for a command sequence.
pub struct ChannelGuard<'a> {
    guard: ReentrantMutexGuard<'a, DeviceCell>,
}

impl ChannelGuard<'_> {
    fn with_device<T>(
        &self,
        op: impl FnOnce(&mut dyn ElectronicsDevice) -> Result<T, DeviceError>,
    ) -> Result<T, DeviceError> {
        let mut cell = self.guard.borrow_mut();
        let device = cell.as_mut().ok_or(DeviceError::NotConnected)?;
        op(device.as_mut())
    }

    pub fn query(&self, command: &str) -> Result<String, DeviceError> {
        self.with_device(|device| device.query(command))
    }

    pub fn write_line(&self, command: &str) -> Result<(), DeviceError> {
        self.with_device(|device| device.write_line(command))
    }

    pub fn write_raw(&self, bytes: &[u8]) -> Result<(), DeviceError> {
        self.with_device(|device| device.write_raw(bytes))
    }

    pub fn read_line(&self) -> Result<String, DeviceError> {
        self.with_device(|device| device.read_line())
    }

    pub fn discard_input(&self) -> Result<usize, DeviceError> {
        self.with_device(|device| device.discard_input())
    }
}

/// Shared handle on the control board. Cloning is cheap.
#[derive(Clone)]
pub struct DeviceChannel {
    inner: Arc<ChannelInner>,
}

impl DeviceChannel {
    /// Takes ownership of an opened device, performs the `IDN` handshake and
    /// drives the board to its safe initial state: laser off, fiber, top
    /// and side LEDs off, servo closed.
    pub fn connect(device: Box<dyn ElectronicsDevice>, config: &ChannelConfig) -> Result<Self, DeviceError> {
        let name = device.name().to_string();
        let channel = Self {
            inner: Arc::new(ChannelInner {
                name,
                device: ReentrantMutex::new(RefCell::new(Some(device))),
                state: Mutex::new(BoardState::default()),
                temperatures: Mutex::new(None),
                monitor: Mutex::new(None),
            }),
        };

        {
            let guard = channel.lock();
            thread::sleep(config.settle());
            match guard.query("IDN") {
                Ok(idn) => tracing::info!(device = %channel.inner.name, idn = %idn, "Electronics connected"),
                Err(err) => {
                    // Flush whatever a freshly reset board left in the buffer.
                    tracing::debug!(device = %channel.inner.name, error = %err, "IDN failed, clearing input");
                    guard.discard_input()?;
                }
            }
        }

        channel.set_laser_power(0.0)?;
        channel.set_led(Led::Fiber, false)?;
        channel.set_led(Led::Top, false)?;
        channel.set_led(Led::Side, false)?;
        channel.move_servo(0)?;
        Ok(channel)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// True until [`finalize`](Self::finalize) released the device.
    pub fn is_connected(&self) -> bool {
        self.inner.device.lock().borrow().is_some()
    }

    /// Acquires the command lock. Re-entrant on the same thread.
    pub fn lock(&self) -> ChannelGuard<'_> {
        ChannelGuard {
            guard: self.inner.device.lock(),
        }
    }

    /// Sends one command under the lock and returns its response.
    pub fn call(&self, command: &str) -> Result<String, DeviceError> {
        self.lock().query(command)
    }

    /// Commanded state as last acknowledged by the board.
    pub fn state(&self) -> BoardState {
        self.inner.state.lock().clone()
    }

    pub fn set_led(&self, led: Led, on: bool) -> Result<(), DeviceError> {
        let guard = self.lock();
        guard.query(&format!("LED:{}:{}", led.code(), u8::from(on)))?;
        self.inner.state.lock().leds[led.code() as usize] = on;
        tracing::debug!(device = %self.inner.name, led = led.name(), on, "LED set");
        Ok(())
    }

    /// Inverts an LED and returns its new state.
    pub fn toggle_led(&self, led: Led) -> Result<bool, DeviceError> {
        let _guard = self.lock();
        let on = !self.state().led(led);
        self.set_led(led, on)?;
        Ok(on)
    }

    /// Sets the laser power in percent and switches the laser LED to match.
    pub fn set_laser_power(&self, percent: f64) -> Result<(), DeviceError> {
        let output = laser_output(percent)?;
        let guard = self.lock();
        self.set_led(Led::Laser, output >= LASER_LED_THRESHOLD)?;
        guard.query(&format!("OUT:{output}"))?;
        self.inner.state.lock().laser_power = percent;
        tracing::info!(device = %self.inner.name, percent, output, "Laser power set");
        Ok(())
    }

    /// Moves the shutter servo to a firmware-defined position.
    pub fn move_servo(&self, position: u32) -> Result<(), DeviceError> {
        self.lock().query(&format!("serv:{position}"))?;
        self.inner.state.lock().servo = Some(position);
        Ok(())
    }

    /// Moves the piezo mirror along `axis` (1 or 2).
    pub fn move_piezo(&self, speed: u8, direction: u8, axis: u8) -> Result<String, DeviceError> {
        if !(1..=2).contains(&axis) {
            return Err(DeviceError::InvalidArgument(format!("piezo axis must be 1 or 2, got {axis}")));
        }
        let byte = encode_motion(speed, direction)?;
        let guard = self.lock();
        guard.query(&format!("mot{axis}"))?;
        guard.write_raw(&[byte])?;
        let answer = guard.read_line()?;
        tracing::debug!(device = %self.inner.name, axis, speed, direction, "Finished moving piezo");
        Ok(answer)
    }

    /// Reads both thermistors and stores the result.
    pub fn read_temperatures(&self) -> Result<Temperatures, DeviceError> {
        let (electronics, sample) = {
            let guard = self.lock();
            (
                parse_temperature("TEM:0", guard.query("TEM:0")?)?,
                parse_temperature("TEM:1", guard.query("TEM:1")?)?,
            )
        };
        let reading = Temperatures {
            electronics,
            sample,
            read_at: Utc::now(),
        };
        *self.inner.temperatures.lock() = Some(reading);
        Ok(reading)
    }

    /// Most recent temperature reading, if any.
    pub fn temperatures(&self) -> Option<Temperatures> {
        *self.inner.temperatures.lock()
    }

    /// Starts polling temperatures every `interval`. No-op if already running.
    pub fn start_temperature_monitor(&self, interval: Duration) -> Result<(), DeviceError> {
        let mut monitor = self.inner.monitor.lock();
        if monitor.is_some() {
            return Ok(());
        }
        let (stop, stopped) = bounded::<()>(1);
        let channel = self.clone();
        let handle = thread::Builder::new()
            .name("temperature-monitor".into())
            .spawn(move || loop {
                if let Err(err) = channel.read_temperatures() {
                    tracing::warn!(device = %channel.inner.name, error = %err, "Temperature read failed");
                }
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        tracing::info!(device = %self.inner.name, interval_ms = interval.as_millis() as u64, "Temperature monitor started");
        *monitor = Some(MonitorHandle { stop, handle });
        Ok(())
    }

    /// Signals the monitor and waits for it to exit.
    pub fn stop_temperature_monitor(&self) {
        let Some(monitor) = self.inner.monitor.lock().take() else {
            return;
        };
        let _ = monitor.stop.try_send(());
        if monitor.handle.join().is_err() {
            tracing::error!(device = %self.inner.name, "Temperature monitor panicked");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.inner.monitor.lock().is_some()
    }

    /// Stops the monitor, puts the board in a safe state and closes it.
    ///
    /// Every step is attempted even if an earlier one fails. Calling this
    /// again is a no-op.
    pub fn finalize(&self) {
        self.stop_temperature_monitor();
        if !self.is_connected() {
            return;
        }
        tracing::info!(device = %self.inner.name, "Finalizing electronics");
        let best_effort = |step: &str, result: Result<(), DeviceError>| {
            if let Err(err) = result {
                tracing::warn!(device = %self.inner.name, step, error = %err, "Finalize step failed");
            }
        };
        best_effort("fiber LED off", self.set_led(Led::Fiber, false));
        best_effort("top LED off", self.set_led(Led::Top, false));
        best_effort("laser off", self.set_laser_power(0.0));

        let guard = self.lock();
        let taken = guard.guard.borrow_mut().take();
        if let Some(mut device) = taken {
            device.close();
        }
    }
}

impl std::fmt::Debug for DeviceChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceChannel")
            .field("name", &self.inner.name)
            .field("monitoring", &self.is_monitoring())
            .finish()
    }
}

fn parse_temperature(command: &str, response: String) -> Result<f64, DeviceError> {
    response.trim().parse::<f64>().map_err(|_| DeviceError::Protocol {
        command: command.to_string(),
        response,
    })
}
