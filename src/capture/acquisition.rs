//! Free-run acquisition loop, one per camera.
//!
//! The loop owns its camera while running: the device handle moves into
//! the worker thread on `start` and comes back on `stop`. Reconfiguration
//! is therefore only possible while idle, which is also what the hardware
//! requires (changing the ROI mid-stream corrupts frames).

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use super::camera::{AcquisitionMode, CameraDevice, CameraError};
use super::config::{Binning, CameraSettings, Roi};
use super::frame::{Frame, PixelFormat};
use super::snapshot::LatestFrame;
use crate::broadcast::{free_run_topic, BroadcastHub, Message};

/// Added to the exposure to get the retrieve timeout.
pub const RETRIEVE_MARGIN: Duration = Duration::from_millis(100);

/// Wall-clock window over which the frame rate is computed.
pub const FPS_WINDOW: Duration = Duration::from_secs(1);

/// Errors raised by the acquisition loop.
#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("camera {0} is already acquiring")]
    AlreadyRunning(String),
    #[error("camera {0} must be stopped before it can be reconfigured")]
    NotIdle(String),
    #[error("camera {0} handle is no longer available")]
    CameraUnavailable(String),
    #[error("acquisition thread of camera {0} panicked")]
    WorkerPanicked(String),
    #[error("failed to spawn acquisition thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error(transparent)]
    Camera(#[from] CameraError),
}

/// Lifecycle of an acquisition loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionState {
    Idle,
    Triggered,
    FreeRunning,
    Stopping,
}

impl AcquisitionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => AcquisitionState::Triggered,
            2 => AcquisitionState::FreeRunning,
            3 => AcquisitionState::Stopping,
            _ => AcquisitionState::Idle,
        }
    }
}

/// Camera parameters as last applied, readable while running.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraStatus {
    pub sensor_width: u32,
    pub sensor_height: u32,
    pub roi: Roi,
    pub exposure: Duration,
    pub gain: f64,
    pub pixel_format: PixelFormat,
    pub binning: Binning,
}

impl CameraStatus {
    fn read(camera: &dyn CameraDevice) -> Self {
        let (sensor_width, sensor_height) = camera.sensor_size();
        Self {
            sensor_width,
            sensor_height,
            roi: camera.roi(),
            exposure: camera.exposure(),
            gain: camera.gain(),
            pixel_format: camera.pixel_format(),
            binning: camera.binning(),
        }
    }
}

/// Rolling frame-rate estimate over a fixed wall-clock window.
#[derive(Debug)]
pub struct FpsMeter {
    window: Duration,
    started: Instant,
    count: u64,
}

impl FpsMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            started: Instant::now(),
            count: 0,
        }
    }

    /// Counts one frame; returns a new estimate when the window closes.
    pub fn tick(&mut self, now: Instant) -> Option<f64> {
        self.count += 1;
        let elapsed = now.saturating_duration_since(self.started);
        if elapsed < self.window {
            return None;
        }
        let fps = self.count as f64 / elapsed.as_secs_f64();
        self.started = now;
        self.count = 0;
        Some(fps)
    }
}

struct LoopShared {
    camera_id: String,
    state: AtomicU8,
    running: AtomicBool,
    cancel: AtomicBool,
    sequence: AtomicU64,
    frames: AtomicU64,
    fps_bits: AtomicU64,
    latest: LatestFrame,
    status: Mutex<CameraStatus>,
    error: Mutex<Option<AcquisitionError>>,
}

impl LoopShared {
    fn set_state(&self, state: AcquisitionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn set_fps(&self, fps: f64) {
        self.fps_bits.store(fps.to_bits(), Ordering::Relaxed);
    }
}

/// Continuously triggers one camera and publishes its frames.
pub struct AcquisitionLoop {
    topic: String,
    hub: BroadcastHub,
    shared: Arc<LoopShared>,
    camera: Option<Box<dyn CameraDevice>>,
    worker: Option<JoinHandle<Box<dyn CameraDevice>>>,
}

impl AcquisitionLoop {
    /// Wraps an opened camera; frames go to `<camera_id>_free_run`.
    pub fn new(camera_id: impl Into<String>, camera: Box<dyn CameraDevice>, hub: BroadcastHub) -> Self {
        let camera_id = camera_id.into();
        let status = CameraStatus::read(camera.as_ref());
        Self {
            topic: free_run_topic(&camera_id),
            hub,
            shared: Arc::new(LoopShared {
                camera_id,
                state: AtomicU8::new(AcquisitionState::Idle as u8),
                running: AtomicBool::new(false),
                cancel: AtomicBool::new(false),
                sequence: AtomicU64::new(0),
                frames: AtomicU64::new(0),
                fps_bits: AtomicU64::new(0f64.to_bits()),
                latest: LatestFrame::new(),
                status: Mutex::new(status),
                error: Mutex::new(None),
            }),
            camera: Some(camera),
            worker: None,
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.shared.camera_id
    }

    /// Topic the frames are published on.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> AcquisitionState {
        AcquisitionState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// True while the worker thread is in its read cycle.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Frames acquired since the last `start`.
    pub fn frames_acquired(&self) -> u64 {
        self.shared.frames.load(Ordering::Relaxed)
    }

    /// Most recent frame-rate estimate.
    pub fn fps(&self) -> f64 {
        f64::from_bits(self.shared.fps_bits.load(Ordering::Relaxed))
    }

    /// Takes the most recent frame out of the snapshot slot.
    pub fn take_latest(&self) -> Option<Frame> {
        self.shared.latest.take_latest()
    }

    /// Camera parameters as last applied.
    pub fn status(&self) -> CameraStatus {
        self.shared.status.lock().clone()
    }

    /// Returns (once) the error that stopped the loop, if any.
    pub fn take_error(&self) -> Option<AcquisitionError> {
        self.shared.error.lock().take()
    }

    /// Starts free-run acquisition.
    pub fn start(&mut self) -> Result<(), AcquisitionError> {
        self.reap()?;
        if self.worker.is_some() {
            return Err(AcquisitionError::AlreadyRunning(self.shared.camera_id.clone()));
        }
        let mut camera = self
            .camera
            .take()
            .ok_or_else(|| AcquisitionError::CameraUnavailable(self.shared.camera_id.clone()))?;

        let prepared = camera
            .set_mode(AcquisitionMode::Continuous)
            .and_then(|()| camera.trigger());
        if let Err(err) = prepared {
            if let Err(stop_err) = camera.stop() {
                tracing::warn!(camera = %self.shared.camera_id, error = %stop_err, "Failed to stop camera after start error");
            }
            self.camera = Some(camera);
            return Err(err.into());
        }

        let shared = Arc::clone(&self.shared);
        shared.cancel.store(false, Ordering::Release);
        shared.frames.store(0, Ordering::Relaxed);
        shared.set_fps(0.0);
        shared.running.store(true, Ordering::Release);
        shared.set_state(AcquisitionState::Triggered);

        let hub = self.hub.clone();
        let topic = self.topic.clone();
        let spawned = thread::Builder::new()
            .name(format!("acq-{}", shared.camera_id))
            .spawn(move || run_loop(camera, shared, hub, topic));

        match spawned {
            Ok(handle) => {
                tracing::info!(camera = %self.shared.camera_id, topic = %self.topic, "Started free run");
                self.worker = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.shared.running.store(false, Ordering::Release);
                self.shared.set_state(AcquisitionState::Idle);
                Err(AcquisitionError::Spawn(err))
            }
        }
    }

    /// Asks the loop to exit at the top of its next iteration.
    ///
    /// Returns immediately; poll [`is_running`](Self::is_running) or call
    /// [`stop`](Self::stop) to wait.
    pub fn request_stop(&self) {
        if self.is_running() {
            self.shared.cancel.store(true, Ordering::Release);
            self.shared.set_state(AcquisitionState::Stopping);
        }
    }

    /// Stops acquisition and waits for the loop to hand the camera back.
    ///
    /// Stopping an idle loop is a no-op.
    pub fn stop(&mut self) -> Result<(), AcquisitionError> {
        self.request_stop();
        let Some(handle) = self.worker.take() else {
            return Ok(());
        };
        match handle.join() {
            Ok(camera) => {
                self.camera = Some(camera);
                tracing::info!(camera = %self.shared.camera_id, "Free run stopped");
                Ok(())
            }
            Err(_) => {
                self.shared.running.store(false, Ordering::Release);
                self.shared.set_state(AcquisitionState::Idle);
                Err(AcquisitionError::WorkerPanicked(self.shared.camera_id.clone()))
            }
        }
    }

    /// Collects the camera from a worker that exited on its own.
    fn reap(&mut self) -> Result<(), AcquisitionError> {
        if self.worker.as_ref().is_some_and(JoinHandle::is_finished) {
            self.stop()?;
        }
        Ok(())
    }

    fn idle_camera(&mut self) -> Result<&mut Box<dyn CameraDevice>, AcquisitionError> {
        self.reap()?;
        if self.worker.is_some() {
            return Err(AcquisitionError::NotIdle(self.shared.camera_id.clone()));
        }
        let id = &self.shared.camera_id;
        self.camera
            .as_mut()
            .ok_or_else(|| AcquisitionError::CameraUnavailable(id.clone()))
    }

    fn refresh_status(&mut self) {
        if let Some(camera) = self.camera.as_ref() {
            *self.shared.status.lock() = CameraStatus::read(camera.as_ref());
        }
    }

    /// Applies a ROI (idle only) and returns the aligned window in use.
    pub fn set_roi(&mut self, roi: Roi) -> Result<Roi, AcquisitionError> {
        let applied = self.idle_camera()?.set_roi(roi)?;
        self.shared.latest.clear();
        self.refresh_status();
        Ok(applied)
    }

    /// Resets the ROI to the full sensor (idle only).
    pub fn clear_roi(&mut self) -> Result<Roi, AcquisitionError> {
        let applied = self.idle_camera()?.clear_roi()?;
        self.shared.latest.clear();
        self.refresh_status();
        Ok(applied)
    }

    pub fn set_exposure(&mut self, exposure: Duration) -> Result<Duration, AcquisitionError> {
        let applied = self.idle_camera()?.set_exposure(exposure)?;
        self.refresh_status();
        Ok(applied)
    }

    pub fn set_gain(&mut self, gain: f64) -> Result<f64, AcquisitionError> {
        let applied = self.idle_camera()?.set_gain(gain)?;
        self.refresh_status();
        Ok(applied)
    }

    pub fn set_pixel_format(&mut self, format: PixelFormat) -> Result<(), AcquisitionError> {
        self.idle_camera()?.set_pixel_format(format)?;
        self.shared.latest.clear();
        self.refresh_status();
        Ok(())
    }

    /// Sets on-sensor binning (idle only); returns the factors in use.
    pub fn set_binning(&mut self, binning: Binning) -> Result<Binning, AcquisitionError> {
        let applied = self.idle_camera()?.set_binning(binning)?;
        self.shared.latest.clear();
        self.refresh_status();
        Ok(applied)
    }

    /// Applies a full settings block (idle only).
    pub fn configure(&mut self, settings: &CameraSettings) -> Result<CameraStatus, AcquisitionError> {
        let camera = self.idle_camera()?;
        camera.set_exposure(settings.exposure())?;
        camera.set_gain(settings.gain)?;
        camera.set_pixel_format(settings.pixel_format)?;
        // Binning last: it is checked against the ROI in effect.
        camera.set_binning(Binning::default())?;
        match settings.roi {
            Some(roi) => camera.set_roi(roi)?,
            None => camera.clear_roi()?,
        };
        camera.set_binning(settings.binning)?;
        self.shared.latest.clear();
        self.refresh_status();
        Ok(self.status())
    }

    /// Acquires a single frame in single-shot mode (idle only).
    ///
    /// The frame is returned to the caller and not published.
    pub fn acquire_single(&mut self) -> Result<Frame, AcquisitionError> {
        let shared = Arc::clone(&self.shared);
        let camera = self.idle_camera()?;
        camera.set_mode(AcquisitionMode::SingleShot)?;
        camera.trigger()?;
        let timeout = camera.exposure() + RETRIEVE_MARGIN;
        let result = camera.retrieve(timeout);
        if let Err(err) = camera.stop() {
            tracing::warn!(camera = %shared.camera_id, error = %err, "Failed to stop camera after single shot");
        }
        let raw = result?;
        let sequence = shared.sequence.fetch_add(1, Ordering::Relaxed);
        Ok(Frame::from_raw(raw, sequence))
    }

    /// Stops acquisition and releases the camera.
    pub fn close(&mut self) -> Result<(), AcquisitionError> {
        let stopped = self.stop();
        if let Some(mut camera) = self.camera.take() {
            camera.close();
        }
        stopped
    }
}

impl Drop for AcquisitionLoop {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            tracing::warn!(camera = %self.shared.camera_id, error = %err, "Acquisition loop dropped with error");
        }
    }
}

impl std::fmt::Debug for AcquisitionLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionLoop")
            .field("camera_id", &self.shared.camera_id)
            .field("topic", &self.topic)
            .field("state", &self.state())
            .field("frames", &self.frames_acquired())
            .finish()
    }
}

fn run_loop(
    mut camera: Box<dyn CameraDevice>,
    shared: Arc<LoopShared>,
    hub: BroadcastHub,
    topic: String,
) -> Box<dyn CameraDevice> {
    let timeout = camera.exposure() + RETRIEVE_MARGIN;
    let mut meter = FpsMeter::new(FPS_WINDOW);
    shared.set_state(AcquisitionState::FreeRunning);

    while !shared.cancel.load(Ordering::Acquire) {
        match camera.retrieve(timeout) {
            Ok(raw) => {
                let sequence = shared.sequence.fetch_add(1, Ordering::Relaxed);
                let frame = Frame::from_raw(raw, sequence);
                let count = shared.frames.fetch_add(1, Ordering::Relaxed) + 1;
                if let Some(fps) = meter.tick(Instant::now()) {
                    shared.set_fps(fps);
                }
                tracing::trace!(camera = %shared.camera_id, sequence, count, "Frame acquired");
                hub.publish(&topic, Message::Frame(frame.clone()));
                shared.latest.store(frame);
            }
            Err(err) if err.is_transient() => continue,
            Err(err) => {
                tracing::error!(camera = %shared.camera_id, error = %err, "Camera failed during free run");
                *shared.error.lock() = Some(AcquisitionError::Camera(err));
                break;
            }
        }
    }

    shared.set_state(AcquisitionState::Stopping);
    if let Err(err) = camera.stop() {
        tracing::warn!(camera = %shared.camera_id, error = %err, "Failed to stop camera");
    }
    shared.running.store(false, Ordering::Release);
    shared.set_state(AcquisitionState::Idle);
    camera
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{DeliveryPolicy, MessageSource};
    use crate::capture::SimulatedCamera;

    fn simulated(exposure_ms: u64) -> Box<dyn CameraDevice> {
        let mut camera = SimulatedCamera::new("cam", 64, 48);
        camera
            .set_exposure(Duration::from_millis(exposure_ms))
            .unwrap();
        Box::new(camera)
    }

    fn wait_for(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    #[test]
    fn test_fps_meter_window() {
        let start = Instant::now();
        let mut meter = FpsMeter {
            window: Duration::from_secs(1),
            started: start,
            count: 0,
        };
        for i in 1..100 {
            assert!(meter.tick(start + Duration::from_millis(i * 10)).is_none());
        }
        let fps = meter.tick(start + Duration::from_millis(1000)).unwrap();
        assert!((fps - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_start_publishes_in_order_and_stop_is_idempotent() {
        let hub = BroadcastHub::new();
        let mut sub = hub.subscribe("cam_free_run", DeliveryPolicy::Block {
            capacity: 1024,
            timeout: Duration::from_secs(1),
        });
        let mut acq = AcquisitionLoop::new("cam", simulated(1), hub.clone());

        acq.start().unwrap();
        assert!(matches!(acq.start(), Err(AcquisitionError::AlreadyRunning(_))));
        assert!(wait_for(|| acq.frames_acquired() >= 10, Duration::from_secs(2)));
        acq.stop().unwrap();
        acq.stop().unwrap();
        assert!(!acq.is_running());
        assert_eq!(acq.state(), AcquisitionState::Idle);

        let mut expected = 0;
        while let Some(message) = sub.try_receive().unwrap() {
            let frame = message.into_frame().unwrap();
            assert_eq!(frame.sequence(), expected);
            expected += 1;
        }
        assert_eq!(expected, acq.frames_acquired());
        assert!(acq.take_latest().is_some());
        assert!(acq.take_latest().is_none());
    }

    #[test]
    fn test_reconfigure_only_when_idle() {
        let mut acq = AcquisitionLoop::new("cam", simulated(1), BroadcastHub::new());
        acq.start().unwrap();
        assert!(matches!(
            acq.set_roi(Roi::new(0, 0, 32, 32)),
            Err(AcquisitionError::NotIdle(_))
        ));
        acq.stop().unwrap();

        let applied = acq.set_roi(Roi::new(0, 0, 33, 31)).unwrap();
        assert_eq!(applied, Roi::new(0, 0, 32, 30));
        assert_eq!(acq.status().roi, applied);

        acq.start().unwrap();
        assert!(wait_for(|| acq.take_latest().is_some(), Duration::from_secs(2)));
        acq.stop().unwrap();
    }

    #[test]
    fn test_device_error_stops_loop_and_surfaces_once() {
        let mut camera = SimulatedCamera::new("cam", 16, 16).fail_after(3);
        camera.set_exposure(Duration::from_millis(1)).unwrap();
        let mut acq = AcquisitionLoop::new("cam", Box::new(camera), BroadcastHub::new());

        acq.start().unwrap();
        assert!(wait_for(|| !acq.is_running(), Duration::from_secs(2)));
        assert!(matches!(
            acq.take_error(),
            Some(AcquisitionError::Camera(CameraError::Device(_)))
        ));
        assert!(acq.take_error().is_none());
        assert_eq!(acq.frames_acquired(), 3);

        // The handle is recovered, so the loop can be reconfigured.
        assert!(acq.set_gain(1.0).is_ok());
    }

    #[test]
    fn test_fps_tracks_exposure() {
        let mut acq = AcquisitionLoop::new("cam", simulated(10), BroadcastHub::new());
        acq.start().unwrap();
        assert!(wait_for(|| acq.fps() > 0.0, Duration::from_secs(2)));
        let fps = acq.fps();
        acq.stop().unwrap();
        assert!((90.0..=110.0).contains(&fps), "fps was {fps}");
    }

    #[test]
    fn test_acquire_single() {
        let mut acq = AcquisitionLoop::new("cam", simulated(1), BroadcastHub::new());
        let frame = acq.acquire_single().unwrap();
        assert!(frame.is_valid());
        assert_eq!((frame.width(), frame.height()), (64, 48));
    }
}
