//! Experiment controller: owns every component and sequences their
//! lifecycle.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use chrono::Local;
use serde::Serialize;

use super::config::ExperimentConfig;
use super::error::ExperimentError;
use crate::broadcast::{locations_topic, BroadcastHub, DeliveryPolicy, Subscription};
use crate::capture::{
    AcquisitionError, AcquisitionLoop, Binning, CameraRegistry, CameraStatus, Frame, PixelFormat, Roi,
    RollingBackground,
};
use crate::electronics::{DeviceChannel, ElectronicsDevice, Led, SerialBoard, SimulatedBoard, Temperatures};
use crate::localization::LocalizationWorker;
use crate::metrics::{CameraMetrics, MetricsSnapshot, RecordingMetrics};
use crate::recording::{
    dated_folder, next_free_path, ContainerWriter, RecorderState, RecordingRequest, StreamRecorder,
};
use crate::worker::{Isolation, WorkerCommand};

/// Time granted to a recorder to flush and close during shutdown.
pub const RECORDING_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Time granted to a localization worker to exit.
pub const TRACKING_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames averaged for the display background.
const BACKGROUND_DEPTH: usize = 10;

/// Queue depth of location subscriptions handed to callers.
const LOCATIONS_QUEUE: usize = 16;

/// Lifecycle of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Uninitialized,
    Initializing,
    /// Initialized, no camera has run yet.
    Ready,
    /// At least one camera is free-running.
    Acquiring,
    /// Cameras were running and are all stopped.
    Idle,
    Finalizing,
    Finalized,
}

/// An acquisition loop that stopped on a device error.
#[derive(Debug)]
pub struct CameraFault {
    pub camera_id: String,
    pub error: AcquisitionError,
}

/// Owns cameras, electronics, recorder and trackers for one experiment.
///
/// Components talk to each other only through the broadcast hub; the
/// controller starts and stops them in a fixed order.
pub struct ExperimentController {
    config: ExperimentConfig,
    state: ControllerState,
    hub: BroadcastHub,
    registry: CameraRegistry,
    injected_device: Option<Box<dyn ElectronicsDevice>>,
    electronics: Option<DeviceChannel>,
    cameras: BTreeMap<String, AcquisitionLoop>,
    backgrounds: HashMap<String, RollingBackground>,
    recorder: StreamRecorder,
    recordings: HashMap<String, PathBuf>,
    trackers: HashMap<String, LocalizationWorker>,
}

impl ExperimentController {
    pub fn new(config: ExperimentConfig) -> Self {
        let hub = BroadcastHub::new();
        let mut recorder = StreamRecorder::new(hub.clone()).with_policy(config.hub.recorder_policy());
        if let Some(program) = &config.worker_executable {
            recorder = recorder.with_worker_command(WorkerCommand::new(program));
        }
        Self {
            config,
            state: ControllerState::Uninitialized,
            hub,
            registry: CameraRegistry::default(),
            injected_device: None,
            electronics: None,
            cameras: BTreeMap::new(),
            backgrounds: HashMap::new(),
            recorder,
            recordings: HashMap::new(),
            trackers: HashMap::new(),
        }
    }

    /// Uses `device` instead of opening the configured board.
    pub fn with_electronics(mut self, device: Box<dyn ElectronicsDevice>) -> Self {
        self.injected_device = Some(device);
        self
    }

    /// Resolves camera kinds through `registry`.
    pub fn with_registry(mut self, registry: CameraRegistry) -> Self {
        self.registry = registry;
        self
    }

    #[inline]
    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    /// Configured camera ids, sorted.
    pub fn camera_ids(&self) -> Vec<String> {
        self.cameras.keys().cloned().collect()
    }

    /// Opens cameras and connects the electronics.
    ///
    /// On failure everything opened so far is closed again and the
    /// controller is back to `Uninitialized`.
    pub fn initialize(&mut self) -> Result<(), ExperimentError> {
        self.require("initialize", &[ControllerState::Uninitialized])?;
        self.state = ControllerState::Initializing;
        tracing::info!(cameras = self.config.cameras.len(), "Initializing experiment");

        match self.open_components() {
            Ok(()) => {
                self.state = ControllerState::Ready;
                tracing::info!(cameras = ?self.camera_ids(), "Experiment ready");
                Ok(())
            }
            Err(err) => {
                tracing::error!(error = %err, "Initialization failed");
                for (camera_id, mut acquisition) in std::mem::take(&mut self.cameras) {
                    if let Err(close_err) = acquisition.close() {
                        tracing::warn!(camera = %camera_id, error = %close_err, "Failed to close camera during rollback");
                    }
                }
                self.backgrounds.clear();
                if let Some(channel) = self.electronics.take() {
                    channel.finalize();
                }
                self.state = ControllerState::Uninitialized;
                Err(err)
            }
        }
    }

    fn open_components(&mut self) -> Result<(), ExperimentError> {
        self.config.validate()?;
        for camera in &self.config.cameras {
            let device = self.registry.open(&camera.kind, camera.device_selector())?;
            let mut acquisition = AcquisitionLoop::new(camera.id.clone(), device, self.hub.clone());
            let status = acquisition.configure(&camera.settings)?;
            tracing::info!(
                camera = %camera.id,
                roi = ?status.roi,
                exposure = ?status.exposure,
                "Camera configured"
            );
            self.backgrounds
                .insert(camera.id.clone(), RollingBackground::new(BACKGROUND_DEPTH));
            self.cameras.insert(camera.id.clone(), acquisition);
        }

        let electronics = &self.config.electronics;
        let device: Option<Box<dyn ElectronicsDevice>> = match self.injected_device.take() {
            Some(device) => Some(device),
            None if !electronics.enabled => None,
            None if electronics.simulated => Some(Box::new(SimulatedBoard::new())),
            None => Some(Box::new(SerialBoard::discover(
                electronics.port.as_deref(),
                electronics.device_index,
                electronics.baud_rate,
                electronics.response_timeout(),
            )?)),
        };
        if let Some(device) = device {
            let channel = DeviceChannel::connect(device, &electronics.channel)?;
            channel.start_temperature_monitor(electronics.channel.temperature_interval())?;
            self.electronics = Some(channel);
        }
        Ok(())
    }

    fn require(&self, operation: &'static str, allowed: &[ControllerState]) -> Result<(), ExperimentError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(ExperimentError::WrongState {
                operation,
                state: self.state,
            })
        }
    }

    fn require_operational(&self, operation: &'static str) -> Result<(), ExperimentError> {
        self.require(
            operation,
            &[ControllerState::Ready, ControllerState::Acquiring, ControllerState::Idle],
        )
    }

    fn camera(&self, camera_id: &str) -> Result<&AcquisitionLoop, ExperimentError> {
        self.cameras
            .get(camera_id)
            .ok_or_else(|| ExperimentError::UnknownCamera(camera_id.to_string()))
    }

    fn camera_mut(&mut self, camera_id: &str) -> Result<&mut AcquisitionLoop, ExperimentError> {
        self.cameras
            .get_mut(camera_id)
            .ok_or_else(|| ExperimentError::UnknownCamera(camera_id.to_string()))
    }

    fn refresh_state(&mut self) {
        if matches!(self.state, ControllerState::Acquiring | ControllerState::Idle) {
            self.state = if self.cameras.values().any(AcquisitionLoop::is_running) {
                ControllerState::Acquiring
            } else {
                ControllerState::Idle
            };
        }
    }

    /// Starts free-run acquisition of `camera_id`.
    pub fn start_free_run(&mut self, camera_id: &str) -> Result<(), ExperimentError> {
        self.require_operational("start free run")?;
        self.camera_mut(camera_id)?.start()?;
        self.state = ControllerState::Acquiring;
        Ok(())
    }

    /// Stops free-run acquisition of `camera_id`. Consumers stay subscribed.
    pub fn stop_free_run(&mut self, camera_id: &str) -> Result<(), ExperimentError> {
        self.require_operational("stop free run")?;
        self.camera_mut(camera_id)?.stop()?;
        self.refresh_state();
        Ok(())
    }

    /// Applies a camera change, pausing acquisition around it if needed.
    fn reconfigure<T>(
        &mut self,
        camera_id: &str,
        change: impl FnOnce(&mut AcquisitionLoop) -> Result<T, AcquisitionError>,
    ) -> Result<T, ExperimentError> {
        self.require_operational("reconfigure camera")?;
        let acquisition = self.camera_mut(camera_id)?;
        let was_running = acquisition.is_running();
        if was_running {
            acquisition.stop()?;
        }
        let result = change(acquisition);
        if was_running {
            acquisition.start()?;
        }
        if let Some(background) = self.backgrounds.get_mut(camera_id) {
            background.reset();
        }
        Ok(result?)
    }

    /// Sets the region of interest; returns the aligned ROI in effect.
    pub fn set_roi(&mut self, camera_id: &str, roi: Roi) -> Result<Roi, ExperimentError> {
        let applied = self.reconfigure(camera_id, |acquisition| acquisition.set_roi(roi))?;
        tracing::info!(camera = camera_id, roi = ?applied, "ROI updated");
        Ok(applied)
    }

    pub fn clear_roi(&mut self, camera_id: &str) -> Result<Roi, ExperimentError> {
        self.reconfigure(camera_id, AcquisitionLoop::clear_roi)
    }

    /// Sets the exposure; returns the value the camera accepted.
    pub fn set_exposure(&mut self, camera_id: &str, exposure: Duration) -> Result<Duration, ExperimentError> {
        self.reconfigure(camera_id, |acquisition| acquisition.set_exposure(exposure))
    }

    pub fn set_gain(&mut self, camera_id: &str, gain: f64) -> Result<f64, ExperimentError> {
        self.reconfigure(camera_id, |acquisition| acquisition.set_gain(gain))
    }

    pub fn set_pixel_format(&mut self, camera_id: &str, format: PixelFormat) -> Result<(), ExperimentError> {
        self.reconfigure(camera_id, |acquisition| acquisition.set_pixel_format(format))
    }

    /// Sets on-sensor binning; the ROI is kept. Returns the binning in effect.
    pub fn set_binning(&mut self, camera_id: &str, binning: Binning) -> Result<Binning, ExperimentError> {
        let applied = self.reconfigure(camera_id, |acquisition| acquisition.set_binning(binning))?;
        tracing::info!(camera = camera_id, ?applied, "Binning updated");
        Ok(applied)
    }

    pub fn camera_status(&self, camera_id: &str) -> Result<CameraStatus, ExperimentError> {
        Ok(self.camera(camera_id)?.status())
    }

    /// Takes the newest frame for display; `None` if nothing new arrived.
    pub fn latest_frame(&self, camera_id: &str) -> Result<Option<Frame>, ExperimentError> {
        Ok(self.camera(camera_id)?.take_latest())
    }

    /// Like [`latest_frame`](Self::latest_frame) with the rolling
    /// background subtracted.
    pub fn latest_corrected_frame(&mut self, camera_id: &str) -> Result<Option<Frame>, ExperimentError> {
        let Some(frame) = self.camera(camera_id)?.take_latest() else {
            return Ok(None);
        };
        let background = self
            .backgrounds
            .entry(camera_id.to_string())
            .or_insert_with(|| RollingBackground::new(BACKGROUND_DEPTH));
        Ok(Some(background.apply(&frame)))
    }

    pub fn fps(&self, camera_id: &str) -> Result<f64, ExperimentError> {
        Ok(self.camera(camera_id)?.fps())
    }

    /// Last temperatures read by the monitor.
    pub fn temperatures(&self) -> Option<Temperatures> {
        self.electronics.as_ref().and_then(DeviceChannel::temperatures)
    }

    /// Starts recording the free-run stream of `camera_id` to the next free
    /// file of today's folder. Returns the file path.
    pub fn start_recording(&mut self, camera_id: &str) -> Result<PathBuf, ExperimentError> {
        self.require_operational("start recording")?;
        if self.is_recording(camera_id) {
            let path = self.recordings.get(camera_id).cloned().unwrap_or_default();
            return Err(crate::recording::RecordingError::AlreadyRecording(path).into());
        }
        let acquisition = self.camera(camera_id)?;
        let topic = acquisition.topic().to_string();
        let status = acquisition.status();

        let recording = &self.config.recording;
        let folder = dated_folder(&recording.folder, Local::now().date_naive())?;
        let path = next_free_path(&folder, &recording.filename, &recording.cartridge_number)?;
        let metadata = self.recording_metadata(camera_id, &status);

        let mut request = RecordingRequest::new(&path, topic);
        request.max_memory_bytes = recording.max_memory_bytes;
        request.metadata = metadata;
        request.isolation = recording.isolation;
        self.recorder.prune();
        self.recorder.start(request)?;
        self.recordings.insert(camera_id.to_string(), path.clone());
        Ok(path)
    }

    fn recording_metadata(&self, camera_id: &str, status: &CameraStatus) -> serde_json::Value {
        serde_json::json!({
            "camera_id": camera_id,
            "cartridge_number": self.config.recording.cartridge_number,
            "exposure_ms": status.exposure.as_secs_f64() * 1000.0,
            "gain": status.gain,
            "pixel_format": status.pixel_format,
            "roi": status.roi,
            "binning": status.binning,
            "sensor": [status.sensor_width, status.sensor_height],
            "laser_power": self.electronics.as_ref().map(|e| e.state().laser_power),
            "fiberscope_version": crate::VERSION,
        })
    }

    /// Grabs one frame in single-shot mode and writes it to the next free
    /// snapshot file of today's folder. Free run is paused around the shot
    /// and resumed afterwards.
    pub fn save_snapshot(&mut self, camera_id: &str) -> Result<PathBuf, ExperimentError> {
        self.require_operational("save snapshot")?;
        let acquisition = self.camera_mut(camera_id)?;
        let was_running = acquisition.is_running();
        if was_running {
            acquisition.stop()?;
        }
        let shot = acquisition.acquire_single();
        let status = acquisition.status();
        if was_running {
            acquisition.start()?;
        }
        let frame = shot?;

        let recording = &self.config.recording;
        let folder = dated_folder(&recording.folder, Local::now().date_naive())?;
        let path = next_free_path(&folder, &recording.snapshot_filename, &recording.cartridge_number)?;
        let mut writer = ContainerWriter::create(&path, self.recording_metadata(camera_id, &status))?;
        writer.append_batch(std::slice::from_ref(&frame))?;
        writer.finish()?;
        tracing::info!(camera = camera_id, path = %path.display(), sequence = frame.sequence(), "Snapshot saved");
        Ok(path)
    }

    /// Asks the recorder of `camera_id` to drain and close. Returns at once
    /// with the file path, if a recording existed.
    pub fn stop_recording(&mut self, camera_id: &str) -> Option<PathBuf> {
        let path = self.recordings.get(camera_id)?;
        self.recorder.stop(path);
        Some(path.clone())
    }

    /// Waits for the recording of `camera_id` to close.
    pub fn wait_recording_closed(&mut self, camera_id: &str, timeout: Duration) -> Result<bool, ExperimentError> {
        match self.recordings.get(camera_id) {
            Some(path) => Ok(self.recorder.wait_closed(path, timeout)?),
            None => Ok(true),
        }
    }

    pub fn is_recording(&self, camera_id: &str) -> bool {
        self.recordings
            .get(camera_id)
            .map_or(false, |path| self.recorder.state(path) != RecorderState::Closed)
    }

    /// Starts locating features in the stream of `camera_id`. Returns the
    /// topic the locations are published on.
    pub fn start_tracking(&mut self, camera_id: &str) -> Result<String, ExperimentError> {
        self.require_operational("start tracking")?;
        if let Some(worker) = self.trackers.get(camera_id) {
            if worker.is_alive() {
                return Ok(worker.output_topic().to_string());
            }
        }
        let topic = self.camera(camera_id)?.topic().to_string();
        let tracking = &self.config.tracking;
        let params = tracking.params();
        let worker = match (&self.config.worker_executable, tracking.isolation) {
            (Some(program), Isolation::Process) => {
                LocalizationWorker::start_process(&self.hub, &topic, params, WorkerCommand::new(program))?
            }
            (_, isolation) => LocalizationWorker::start(&self.hub, &topic, params, isolation)?,
        };
        let output = worker.output_topic().to_string();
        self.trackers.insert(camera_id.to_string(), worker);
        Ok(output)
    }

    /// Stops the tracker of `camera_id` and waits for it to exit.
    pub fn stop_tracking(&mut self, camera_id: &str) -> Result<(), ExperimentError> {
        if let Some(mut worker) = self.trackers.remove(camera_id) {
            worker.stop();
            if !worker.wait_stopped(TRACKING_STOP_TIMEOUT)? {
                tracing::warn!(camera = camera_id, "Localization worker did not stop in time");
            }
        }
        Ok(())
    }

    /// Subscribes to the locations found in the stream of `camera_id`.
    pub fn subscribe_locations(&self, camera_id: &str) -> Result<Subscription, ExperimentError> {
        let topic = locations_topic(self.camera(camera_id)?.topic());
        Ok(self
            .hub
            .subscribe(topic, DeliveryPolicy::DropOldest { capacity: LOCATIONS_QUEUE }))
    }

    fn electronics(&self) -> Result<&DeviceChannel, ExperimentError> {
        self.electronics.as_ref().ok_or(ExperimentError::NoElectronics)
    }

    pub fn set_laser_power(&self, percent: f64) -> Result<(), ExperimentError> {
        Ok(self.electronics()?.set_laser_power(percent)?)
    }

    pub fn set_led(&self, led: Led, on: bool) -> Result<(), ExperimentError> {
        Ok(self.electronics()?.set_led(led, on)?)
    }

    /// Flips an LED; returns its new state.
    pub fn toggle_led(&self, led: Led) -> Result<bool, ExperimentError> {
        Ok(self.electronics()?.toggle_led(led)?)
    }

    pub fn move_servo(&self, position: u32) -> Result<(), ExperimentError> {
        Ok(self.electronics()?.move_servo(position)?)
    }

    pub fn move_piezo(&self, speed: u8, direction: u8, axis: u8) -> Result<String, ExperimentError> {
        Ok(self.electronics()?.move_piezo(speed, direction, axis)?)
    }

    /// Collects cameras whose loop stopped on a device error. Only the
    /// affected cameras are stopped; everything else keeps running.
    pub fn poll_faults(&mut self) -> Vec<CameraFault> {
        let mut faults = Vec::new();
        for (camera_id, acquisition) in &mut self.cameras {
            if let Some(error) = acquisition.take_error() {
                tracing::error!(camera = %camera_id, error = %error, "Acquisition stopped on error");
                if let Err(err) = acquisition.stop() {
                    tracing::warn!(camera = %camera_id, error = %err, "Failed to join acquisition loop");
                }
                faults.push(CameraFault {
                    camera_id: camera_id.clone(),
                    error,
                });
            }
        }
        self.refresh_state();
        faults
    }

    /// Current figures of every component.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        let cameras = self
            .cameras
            .iter()
            .map(|(camera_id, acquisition)| CameraMetrics {
                camera_id: camera_id.clone(),
                state: acquisition.state(),
                frames_acquired: acquisition.frames_acquired(),
                fps: acquisition.fps(),
            })
            .collect();
        let recordings = self
            .recordings
            .iter()
            .filter_map(|(camera_id, path)| {
                let report = self.recorder.report(path)?;
                Some(RecordingMetrics {
                    camera_id: camera_id.clone(),
                    frames_written: report.processed,
                    bytes_written: report.bytes_written,
                    buffered_bytes: report.buffered_bytes,
                })
            })
            .collect();
        MetricsSnapshot {
            cameras,
            recordings,
            hub_published: self.hub.published_total(),
            hub_dropped: self.hub.dropped_total(),
            frames_located: self.trackers.values().map(|t| t.report().processed).sum(),
            temperatures: self.temperatures(),
        }
    }

    /// Shuts everything down: acquisition, then recorders and trackers
    /// (drained), then electronics, then cameras.
    ///
    /// Every step runs even if an earlier one fails. Calling this again is
    /// a no-op.
    pub fn finalize(&mut self) {
        if matches!(
            self.state,
            ControllerState::Finalized | ControllerState::Finalizing | ControllerState::Uninitialized
        ) {
            return;
        }
        self.state = ControllerState::Finalizing;
        tracing::info!("Finalizing experiment");

        for acquisition in self.cameras.values() {
            acquisition.request_stop();
        }
        for (camera_id, acquisition) in &mut self.cameras {
            if let Err(err) = acquisition.stop() {
                tracing::warn!(camera = %camera_id, error = %err, "Failed to stop acquisition");
            }
        }

        self.recorder.stop_all();
        for (camera_id, path) in &self.recordings {
            match self.recorder.wait_closed(path, RECORDING_DRAIN_TIMEOUT) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(camera = %camera_id, path = %path.display(), "Recording did not close in time")
                }
                Err(err) => tracing::warn!(camera = %camera_id, error = %err, "Failed to wait for recording"),
            }
        }
        let tracked: Vec<String> = self.trackers.keys().cloned().collect();
        for camera_id in tracked {
            if let Err(err) = self.stop_tracking(&camera_id) {
                tracing::warn!(camera = %camera_id, error = %err, "Failed to stop tracking");
            }
        }

        if let Some(channel) = self.electronics.take() {
            channel.finalize();
        }

        for (camera_id, acquisition) in &mut self.cameras {
            if let Err(err) = acquisition.close() {
                tracing::warn!(camera = %camera_id, error = %err, "Failed to close camera");
            }
        }
        self.state = ControllerState::Finalized;
        tracing::info!("Experiment finalized");
    }
}

impl Drop for ExperimentController {
    fn drop(&mut self) {
        self.finalize();
    }
}

impl std::fmt::Debug for ExperimentController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentController")
            .field("state", &self.state)
            .field("cameras", &self.camera_ids())
            .field("electronics", &self.electronics.as_ref().map(DeviceChannel::name))
            .field("recordings", &self.recordings.len())
            .field("trackers", &self.trackers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{Message, MessageSource};
    use crate::capture::{CameraConfig, SimulatedDriver};
    use crate::electronics::WireLog;
    use crate::recording::ContainerReader;
    use std::sync::Arc;
    use std::time::Instant;

    fn small_registry(driver: SimulatedDriver) -> CameraRegistry {
        let mut registry = CameraRegistry::empty();
        registry.register_driver("simulated", Arc::new(driver.with_sensor(64, 48)));
        registry
    }

    fn controller(folder: &std::path::Path) -> (ExperimentController, WireLog) {
        let mut config = ExperimentConfig::simulated("cam");
        config.cameras[0].settings.exposure_ms = 5.0;
        config.recording.folder = folder.to_path_buf();
        config.electronics.channel.settle_ms = 0;
        let board = SimulatedBoard::new();
        let log = board.wire_log();
        let controller = ExperimentController::new(config)
            .with_registry(small_registry(SimulatedDriver::new()))
            .with_electronics(Box::new(board));
        (controller, log)
    }

    /// Board traffic without the temperature monitor's polling.
    fn board_commands(log: &WireLog) -> Vec<String> {
        log.commands().into_iter().filter(|c| !c.starts_with("TEM")).collect()
    }

    fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        done()
    }

    #[test]
    fn test_lifecycle_states() {
        let dir = tempfile::tempdir().unwrap();
        let (mut controller, _) = controller(dir.path());
        assert_eq!(controller.state(), ControllerState::Uninitialized);
        assert!(matches!(
            controller.start_free_run("cam"),
            Err(ExperimentError::WrongState { .. })
        ));

        controller.initialize().unwrap();
        assert_eq!(controller.state(), ControllerState::Ready);
        controller.start_free_run("cam").unwrap();
        assert_eq!(controller.state(), ControllerState::Acquiring);
        assert!(wait_until(Duration::from_secs(2), || controller.latest_frame("cam").unwrap().is_some()));
        controller.stop_free_run("cam").unwrap();
        assert_eq!(controller.state(), ControllerState::Idle);

        controller.finalize();
        assert_eq!(controller.state(), ControllerState::Finalized);
        controller.finalize();
    }

    #[test]
    fn test_unknown_camera_kind_leaves_uninitialized() {
        let mut config = ExperimentConfig::simulated("cam");
        config.cameras[0].kind = "vendor".into();
        config.electronics.enabled = false;
        let mut controller = ExperimentController::new(config);
        assert!(matches!(controller.initialize(), Err(ExperimentError::Camera(_))));
        assert_eq!(controller.state(), ControllerState::Uninitialized);
    }

    #[test]
    fn test_set_roi_restarts_running_camera() {
        let dir = tempfile::tempdir().unwrap();
        let (mut controller, _) = controller(dir.path());
        controller.initialize().unwrap();
        controller.start_free_run("cam").unwrap();

        let roi = controller.set_roi("cam", Roi::new(3, 3, 33, 21)).unwrap();
        assert_eq!(roi, Roi::new(0, 2, 32, 20));
        assert_eq!(controller.state(), ControllerState::Acquiring);
        assert!(controller.camera_status("cam").unwrap().roi == roi);

        let mut cropped = None;
        assert!(wait_until(Duration::from_secs(2), || {
            cropped = controller
                .latest_corrected_frame("cam")
                .unwrap()
                .filter(|frame| frame.width() == 32);
            cropped.is_some()
        }));
        assert_eq!(cropped.unwrap().height(), 20);
    }

    #[test]
    fn test_set_binning_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let (mut controller, _) = controller(dir.path());
        controller.initialize().unwrap();
        controller.start_free_run("cam").unwrap();

        let applied = controller.set_binning("cam", Binning::vertical(4)).unwrap();
        assert_eq!(applied, Binning::vertical(4));
        assert_eq!(controller.state(), ControllerState::Acquiring);
        assert_eq!(controller.camera_status("cam").unwrap().binning, applied);

        let mut binned = None;
        assert!(wait_until(Duration::from_secs(2), || {
            binned = controller
                .latest_corrected_frame("cam")
                .unwrap()
                .filter(|frame| frame.height() == 12);
            binned.is_some()
        }));
        assert_eq!(binned.unwrap().width(), 64);

        assert!(controller.set_binning("cam", Binning::vertical(5)).is_err());
        assert_eq!(controller.state(), ControllerState::Acquiring);
        assert_eq!(controller.camera_status("cam").unwrap().binning, applied);
    }

    #[test]
    fn test_save_snapshot_resumes_free_run() {
        let dir = tempfile::tempdir().unwrap();
        let (mut controller, _) = controller(dir.path());
        assert!(matches!(
            controller.save_snapshot("cam"),
            Err(ExperimentError::WrongState { .. })
        ));
        controller.initialize().unwrap();

        let first = controller.save_snapshot("cam").unwrap();
        assert!(first.ends_with("snapshot_0_0.fsrec"));
        assert_eq!(controller.state(), ControllerState::Ready);

        controller.start_free_run("cam").unwrap();
        let second = controller.save_snapshot("cam").unwrap();
        assert!(second.ends_with("snapshot_0_1.fsrec"));
        assert_eq!(controller.state(), ControllerState::Acquiring);
        assert!(wait_until(Duration::from_secs(2), || controller.latest_frame("cam").unwrap().is_some()));

        let reader = ContainerReader::open(&second).unwrap();
        assert_eq!(reader.header().metadata["camera_id"], "cam");
        let frames: Vec<_> = reader.map(Result::unwrap).collect();
        assert_eq!(frames.len(), 1);
        assert_eq!((frames[0].width(), frames[0].height()), (64, 48));
    }

    #[test]
    fn test_recording_drains_on_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let (mut controller, _) = controller(dir.path());
        controller.initialize().unwrap();
        controller.start_free_run("cam").unwrap();
        let path = controller.start_recording("cam").unwrap();
        assert!(path.starts_with(dir.path()));
        assert!(path.ends_with("cartridge_0_0.fsrec"));
        assert!(controller.is_recording("cam"));
        assert!(matches!(
            controller.start_recording("cam"),
            Err(ExperimentError::Recording(_))
        ));

        assert!(wait_until(Duration::from_secs(2), || {
            controller.metrics_snapshot().camera("cam").unwrap().frames_acquired >= 5
        }));
        controller.finalize();
        assert!(!controller.is_recording("cam"));

        let reader = ContainerReader::open(&path).unwrap();
        assert_eq!(reader.header().metadata["camera_id"], "cam");
        let frames: Vec<_> = reader.map(Result::unwrap).collect();
        assert!(!frames.is_empty());
        assert!(frames.windows(2).all(|w| w[0].sequence() < w[1].sequence()));
    }

    #[test]
    fn test_stop_tracking_keeps_recording() {
        let dir = tempfile::tempdir().unwrap();
        let (mut controller, _) = controller(dir.path());
        controller.initialize().unwrap();
        controller.start_free_run("cam").unwrap();
        controller.start_recording("cam").unwrap();
        let mut locations = controller.subscribe_locations("cam").unwrap();
        let topic = controller.start_tracking("cam").unwrap();
        assert_eq!(topic, "cam_free_run_locations");

        let received = loop {
            match locations.receive(Duration::from_secs(2)).unwrap() {
                Some(Message::Locations(set)) => break set,
                Some(_) => continue,
                None => panic!("no locations published"),
            }
        };
        assert!(received.len() <= 64);

        controller.stop_tracking("cam").unwrap();
        assert!(controller.is_recording("cam"));
        controller.stop_recording("cam");
        assert!(controller
            .wait_recording_closed("cam", Duration::from_secs(5))
            .unwrap());
    }

    #[test]
    fn test_fault_stops_only_failing_camera() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ExperimentConfig::simulated("bad");
        config.cameras.push(CameraConfig::simulated("good"));
        config.cameras[0].kind = "failing".into();
        config.electronics.enabled = false;
        config.recording.folder = dir.path().to_path_buf();
        let mut registry = small_registry(SimulatedDriver::new());
        registry.register_driver(
            "failing",
            Arc::new(SimulatedDriver::new().with_sensor(64, 48).failing_after(3)),
        );
        let mut controller = ExperimentController::new(config).with_registry(registry);
        controller.initialize().unwrap();
        controller.start_free_run("bad").unwrap();
        controller.start_free_run("good").unwrap();

        let mut faults = Vec::new();
        assert!(wait_until(Duration::from_secs(3), || {
            faults.extend(controller.poll_faults());
            !faults.is_empty()
        }));
        assert_eq!(faults[0].camera_id, "bad");
        assert_eq!(controller.state(), ControllerState::Acquiring);
        let snapshot = controller.metrics_snapshot();
        assert_eq!(snapshot.camera("good").unwrap().state, crate::capture::AcquisitionState::FreeRunning);
    }

    #[test]
    fn test_electronics_commands_and_finalize_order() {
        let dir = tempfile::tempdir().unwrap();
        let (mut controller, log) = controller(dir.path());
        controller.initialize().unwrap();
        log.clear();

        controller.set_laser_power(50.0).unwrap();
        assert!(controller.toggle_led(Led::Fiber).unwrap());
        controller.move_servo(90).unwrap();
        assert_eq!(controller.move_piezo(10, 1, 2).unwrap(), "moved");
        assert_eq!(
            board_commands(&log),
            vec!["LED:4:1", "OUT:2048", "LED:2:1", "serv:90", "mot2"]
        );

        log.clear();
        controller.finalize();
        assert_eq!(board_commands(&log), vec!["LED:2:0", "LED:1:0", "LED:4:0", "OUT:0"]);
        assert!(matches!(controller.set_led(Led::Top, true), Err(ExperimentError::NoElectronics)));
    }
}
