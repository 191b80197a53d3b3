//! Camera abstraction for frame capture.
//!
//! The acquisition pipeline only talks to hardware through [`CameraDevice`]
//! and [`CameraDriver`]. Vendor register names stay inside the driver; the
//! pipeline sees exposure, gain, ROI, trigger and a bounded retrieve.

use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;

use super::config::{Binning, Roi, RoiError, RoiGranularity};
use super::frame::{PixelFormat, RawImage};

/// Errors that can occur during camera operations.
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("camera device not found: {0}")]
    DeviceNotFound(String),
    #[error("failed to open camera: {0}")]
    OpenFailed(String),
    #[error("invalid ROI: {0}")]
    InvalidRoi(#[from] RoiError),
    #[error("invalid camera setting: {0}")]
    InvalidSetting(String),
    #[error("no frame available before timeout")]
    FrameTimeout,
    #[error("camera in wrong state: {0}")]
    WrongState(String),
    #[error("camera device error: {0}")]
    Device(String),
    #[error("camera not initialized")]
    NotInitialized,
}

impl CameraError {
    /// Timeouts are an expected, transient condition of the read cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, CameraError::FrameTimeout)
    }
}

/// Acquisition mode of the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionMode {
    /// One trigger, one frame.
    SingleShot,
    /// One trigger, frames until stopped.
    Continuous,
}

/// Device description returned by enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraInfo {
    pub id: String,
    pub model: String,
    pub sensor_width: u32,
    pub sensor_height: u32,
}

/// Finds and opens camera devices of one kind.
pub trait CameraDriver: Send + Sync {
    /// Lists the devices this driver can open.
    fn enumerate(&self) -> Result<Vec<CameraInfo>, CameraError>;

    /// Opens the device whose id or friendly name contains `selector`.
    fn open(&self, selector: &str) -> Result<Box<dyn CameraDevice>, CameraError>;
}

/// Capability contract of a single opened camera.
///
/// A device is owned by exactly one acquisition loop; none of these
/// methods are called concurrently.
pub trait CameraDevice: Send {
    /// Stable identifier of the device.
    fn id(&self) -> &str;

    /// Maximum readout size as (width, height).
    fn sensor_size(&self) -> (u32, u32);

    /// Alignment the sensor imposes on ROI values.
    fn granularity(&self) -> RoiGranularity {
        RoiGranularity::default()
    }

    fn set_mode(&mut self, mode: AcquisitionMode) -> Result<(), CameraError>;

    /// Applies an exposure and returns the value the device accepted.
    fn set_exposure(&mut self, exposure: Duration) -> Result<Duration, CameraError>;

    fn exposure(&self) -> Duration;

    /// Applies a gain and returns the value the device accepted.
    fn set_gain(&mut self, gain: f64) -> Result<f64, CameraError>;

    fn gain(&self) -> f64;

    /// Applies a ROI and returns the aligned window actually in use.
    fn set_roi(&mut self, roi: Roi) -> Result<Roi, CameraError>;

    fn roi(&self) -> Roi;

    /// Resets the ROI to the full sensor.
    fn clear_roi(&mut self) -> Result<Roi, CameraError> {
        let (w, h) = self.sensor_size();
        self.set_roi(Roi::full(w, h))
    }

    fn set_pixel_format(&mut self, format: PixelFormat) -> Result<(), CameraError>;

    fn pixel_format(&self) -> PixelFormat;

    /// Applies on-sensor binning and returns the factors in use.
    ///
    /// Devices without binning only accept 1x1.
    fn set_binning(&mut self, binning: Binning) -> Result<Binning, CameraError> {
        if binning.is_enabled() {
            return Err(CameraError::InvalidSetting(format!(
                "{} does not support {}x{} binning",
                self.id(),
                binning.horizontal,
                binning.vertical
            )));
        }
        Ok(binning)
    }

    fn binning(&self) -> Binning {
        Binning::default()
    }

    /// Issues a software trigger (starting to grab if needed).
    fn trigger(&mut self) -> Result<(), CameraError>;

    /// Waits up to `timeout` for the next frame.
    ///
    /// Returns [`CameraError::FrameTimeout`] when the buffer stays empty.
    fn retrieve(&mut self, timeout: Duration) -> Result<RawImage, CameraError>;

    /// Stops grabbing. Safe to call when not grabbing.
    fn stop(&mut self) -> Result<(), CameraError>;

    /// Releases the device.
    fn close(&mut self);
}

/// Synthetic camera producing paced frames with a few bright spots.
///
/// Frames are scheduled on a fixed deadline grid of one exposure each, so
/// the delivered rate matches `1 / exposure` regardless of how long the
/// caller takes between retrieves.
#[derive(Debug)]
pub struct SimulatedCamera {
    id: String,
    sensor: (u32, u32),
    granularity: RoiGranularity,
    roi: Roi,
    binning: Binning,
    exposure: Duration,
    gain: f64,
    pixel_format: PixelFormat,
    mode: AcquisitionMode,
    grabbing: bool,
    pending_single: bool,
    next_frame_at: Option<Instant>,
    frames_delivered: u64,
    fail_after: Option<u64>,
    noise_state: u64,
    open: bool,
}

impl SimulatedCamera {
    /// Creates an opened simulated camera with the given sensor size.
    pub fn new(id: impl Into<String>, sensor_width: u32, sensor_height: u32) -> Self {
        Self {
            id: id.into(),
            sensor: (sensor_width, sensor_height),
            granularity: RoiGranularity::default(),
            roi: Roi::full(sensor_width, sensor_height),
            binning: Binning::default(),
            exposure: Duration::from_millis(10),
            gain: 0.0,
            pixel_format: PixelFormat::Mono8,
            mode: AcquisitionMode::SingleShot,
            grabbing: false,
            pending_single: false,
            next_frame_at: None,
            frames_delivered: 0,
            fail_after: None,
            noise_state: 0x9E37_79B9_7F4A_7C15,
            open: true,
        }
    }

    /// Makes `retrieve` fail with a device error once `frames` frames
    /// have been delivered.
    pub fn fail_after(mut self, frames: u64) -> Self {
        self.fail_after = Some(frames);
        self
    }

    /// Total frames handed out since creation.
    pub fn frames_delivered(&self) -> u64 {
        self.frames_delivered
    }

    fn ensure_open(&self) -> Result<(), CameraError> {
        if self.open {
            Ok(())
        } else {
            Err(CameraError::NotInitialized)
        }
    }

    fn next_noise(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.noise_state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.noise_state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn render(&mut self) -> RawImage {
        let width = self.roi.width;
        let height = self.roi.height;
        let mut pixels = vec![0u16; self.roi.area()];
        for px in pixels.iter_mut() {
            *px = 10 + (self.next_noise() % 8) as u16;
        }

        // Three spots drifting slowly across the sensor, in sensor coordinates.
        let t = self.frames_delivered as f32;
        let (sw, sh) = (self.sensor.0 as f32, self.sensor.1 as f32);
        let spots = [
            (sw * 0.25 + (t * 0.3) % (sw * 0.5), sh * 0.5),
            (sw * 0.5, sh * 0.25 + (t * 0.2) % (sh * 0.5)),
            (sw * 0.75, sh * 0.75),
        ];
        let sigma = 2.0f32;
        let reach = (4.0 * sigma).ceil() as i64;
        let peak = 200.0 * (1.0 + self.gain as f32 / 10.0);
        for (cx, cy) in spots {
            let lx = cx - self.roi.x_offset as f32;
            let ly = cy - self.roi.y_offset as f32;
            let x0 = (lx as i64 - reach).max(0);
            let x1 = (lx as i64 + reach).min(i64::from(width) - 1);
            let y0 = (ly as i64 - reach).max(0);
            let y1 = (ly as i64 + reach).min(i64::from(height) - 1);
            for y in y0..=y1 {
                for x in x0..=x1 {
                    let dx = x as f32 - lx;
                    let dy = y as f32 - ly;
                    let v = peak * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp();
                    let idx = y as usize * width as usize + x as usize;
                    pixels[idx] = pixels[idx].saturating_add(v as u16).min(255);
                }
            }
        }

        let (width, height, pixels) = bin_pixels(pixels, width, height, self.binning);

        let data: Vec<u8> = match self.pixel_format {
            PixelFormat::Mono8 => pixels.iter().map(|&v| v as u8).collect(),
            PixelFormat::Mono12 => pixels
                .iter()
                .flat_map(|&v| (v << 4).to_le_bytes())
                .collect(),
            PixelFormat::Mono16 => pixels
                .iter()
                .flat_map(|&v| (v << 8).to_le_bytes())
                .collect(),
        };

        RawImage {
            width,
            height,
            pixel_format: self.pixel_format,
            data: Bytes::from(data),
        }
    }
}

/// Sums `binning`-sized blocks of a row-major image, clipping at 8-bit
/// full scale. Partial blocks at the right and bottom edges are dropped.
fn bin_pixels(pixels: Vec<u16>, width: u32, height: u32, binning: Binning) -> (u32, u32, Vec<u16>) {
    if !binning.is_enabled() {
        return (width, height, pixels);
    }
    let (out_w, out_h) = binning.output_size(width, height);
    let (bx, by) = (binning.horizontal as usize, binning.vertical as usize);
    let mut out = vec![0u16; out_w as usize * out_h as usize];
    for (oy, row) in out.chunks_mut(out_w as usize).enumerate() {
        for (ox, px) in row.iter_mut().enumerate() {
            let mut sum = 0u32;
            for y in oy * by..(oy + 1) * by {
                let start = y * width as usize + ox * bx;
                sum += pixels[start..start + bx].iter().map(|&v| u32::from(v)).sum::<u32>();
            }
            *px = sum.min(255) as u16;
        }
    }
    (out_w, out_h, out)
}

impl CameraDevice for SimulatedCamera {
    fn id(&self) -> &str {
        &self.id
    }

    fn sensor_size(&self) -> (u32, u32) {
        self.sensor
    }

    fn granularity(&self) -> RoiGranularity {
        self.granularity
    }

    fn set_mode(&mut self, mode: AcquisitionMode) -> Result<(), CameraError> {
        self.ensure_open()?;
        tracing::debug!(camera = %self.id, ?mode, "Setting acquisition mode");
        self.mode = mode;
        Ok(())
    }

    fn set_exposure(&mut self, exposure: Duration) -> Result<Duration, CameraError> {
        self.ensure_open()?;
        if exposure.is_zero() {
            return Err(CameraError::InvalidSetting("exposure must be positive".into()));
        }
        // Microsecond resolution, like most sensors.
        self.exposure = Duration::from_micros(exposure.as_micros().max(1) as u64);
        Ok(self.exposure)
    }

    fn exposure(&self) -> Duration {
        self.exposure
    }

    fn set_gain(&mut self, gain: f64) -> Result<f64, CameraError> {
        self.ensure_open()?;
        if !gain.is_finite() || gain < 0.0 {
            return Err(CameraError::InvalidSetting(format!("gain {gain}")));
        }
        self.gain = gain.min(48.0);
        Ok(self.gain)
    }

    fn gain(&self) -> f64 {
        self.gain
    }

    fn set_roi(&mut self, roi: Roi) -> Result<Roi, CameraError> {
        self.ensure_open()?;
        if self.grabbing {
            return Err(CameraError::WrongState(
                "ROI cannot change while grabbing".into(),
            ));
        }
        let applied = roi.validate(self.sensor.0, self.sensor.1, self.granularity)?;
        let (w, h) = self.binning.output_size(applied.width, applied.height);
        if w == 0 || h == 0 {
            return Err(CameraError::InvalidSetting(format!(
                "{}x{} ROI is smaller than the {}x{} binning",
                applied.width, applied.height, self.binning.horizontal, self.binning.vertical
            )));
        }
        tracing::info!(
            camera = %self.id,
            x = applied.x_offset,
            y = applied.y_offset,
            width = applied.width,
            height = applied.height,
            "Updating ROI"
        );
        self.roi = applied;
        Ok(applied)
    }

    fn roi(&self) -> Roi {
        self.roi
    }

    fn set_pixel_format(&mut self, format: PixelFormat) -> Result<(), CameraError> {
        self.ensure_open()?;
        self.pixel_format = format;
        Ok(())
    }

    fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    fn set_binning(&mut self, binning: Binning) -> Result<Binning, CameraError> {
        self.ensure_open()?;
        if self.grabbing {
            return Err(CameraError::WrongState(
                "binning cannot change while grabbing".into(),
            ));
        }
        binning
            .validate()
            .map_err(|err| CameraError::InvalidSetting(err.to_string()))?;
        let (w, h) = binning.output_size(self.roi.width, self.roi.height);
        if w == 0 || h == 0 {
            return Err(CameraError::InvalidSetting(format!(
                "{}x{} binning leaves no pixels of a {}x{} ROI",
                binning.horizontal, binning.vertical, self.roi.width, self.roi.height
            )));
        }
        tracing::info!(camera = %self.id, horizontal = binning.horizontal, vertical = binning.vertical, "Updating binning");
        self.binning = binning;
        Ok(binning)
    }

    fn binning(&self) -> Binning {
        self.binning
    }

    fn trigger(&mut self) -> Result<(), CameraError> {
        self.ensure_open()?;
        if self.grabbing && self.mode == AcquisitionMode::Continuous {
            tracing::warn!(camera = %self.id, "Triggering an already grabbing camera");
            return Ok(());
        }
        self.grabbing = true;
        self.pending_single = self.mode == AcquisitionMode::SingleShot;
        self.next_frame_at = Some(Instant::now() + self.exposure);
        Ok(())
    }

    fn retrieve(&mut self, timeout: Duration) -> Result<RawImage, CameraError> {
        self.ensure_open()?;
        if !self.grabbing {
            return Err(CameraError::WrongState(
                "trigger the camera before reading from it".into(),
            ));
        }
        if let Some(limit) = self.fail_after {
            if self.frames_delivered >= limit {
                return Err(CameraError::Device("simulated device disconnect".into()));
            }
        }

        let now = Instant::now();
        let due = self.next_frame_at.unwrap_or(now);
        if due > now + timeout {
            std::thread::sleep(timeout);
            return Err(CameraError::FrameTimeout);
        }
        if due > now {
            std::thread::sleep(due - now);
        }

        // Do not let a stalled reader cause an unbounded burst afterwards.
        let mut next = due + self.exposure;
        let floor = Instant::now().checked_sub(self.exposure * 4);
        if let Some(floor) = floor {
            if next < floor {
                next = Instant::now() + self.exposure;
            }
        }
        self.next_frame_at = Some(next);

        let image = self.render();
        self.frames_delivered += 1;
        if self.pending_single {
            self.pending_single = false;
            self.grabbing = false;
        }
        Ok(image)
    }

    fn stop(&mut self) -> Result<(), CameraError> {
        if self.grabbing {
            tracing::info!(camera = %self.id, "Stopping camera");
        }
        self.grabbing = false;
        self.pending_single = false;
        self.next_frame_at = None;
        Ok(())
    }

    fn close(&mut self) {
        if self.open {
            self.grabbing = false;
            self.open = false;
            tracing::info!(camera = %self.id, "SimulatedCamera closed");
        }
    }
}

/// Driver for [`SimulatedCamera`] devices.
#[derive(Debug, Clone)]
pub struct SimulatedDriver {
    sensor_width: u32,
    sensor_height: u32,
    devices: Option<Vec<String>>,
    fail_after: Option<u64>,
}

impl Default for SimulatedDriver {
    fn default() -> Self {
        Self {
            sensor_width: 640,
            sensor_height: 480,
            devices: None,
            fail_after: None,
        }
    }
}

impl SimulatedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts enumeration and opening to the given device ids.
    pub fn with_devices<I, S>(mut self, devices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.devices = Some(devices.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_sensor(mut self, width: u32, height: u32) -> Self {
        self.sensor_width = width;
        self.sensor_height = height;
        self
    }

    /// Opened cameras fail after delivering `frames` frames.
    pub fn failing_after(mut self, frames: u64) -> Self {
        self.fail_after = Some(frames);
        self
    }
}

impl CameraDriver for SimulatedDriver {
    fn enumerate(&self) -> Result<Vec<CameraInfo>, CameraError> {
        let ids = self
            .devices
            .clone()
            .unwrap_or_else(|| vec!["sim-0".to_string()]);
        Ok(ids
            .into_iter()
            .map(|id| CameraInfo {
                id,
                model: "Simulated".to_string(),
                sensor_width: self.sensor_width,
                sensor_height: self.sensor_height,
            })
            .collect())
    }

    fn open(&self, selector: &str) -> Result<Box<dyn CameraDevice>, CameraError> {
        if let Some(devices) = &self.devices {
            if !devices.iter().any(|d| d.contains(selector)) {
                return Err(CameraError::DeviceNotFound(format!(
                    "{selector} not found, check the configuration and connected cameras"
                )));
            }
        }
        let mut camera = SimulatedCamera::new(selector, self.sensor_width, self.sensor_height);
        if let Some(frames) = self.fail_after {
            camera = camera.fail_after(frames);
        }
        tracing::info!(camera = %selector, "Loaded simulated camera");
        Ok(Box::new(camera))
    }
}
