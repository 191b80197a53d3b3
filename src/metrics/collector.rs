//! Metrics collection and registry.

use parking_lot::Mutex;
use prometheus::{Encoder, Gauge, GaugeVec, IntCounter, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::Serialize;
use thiserror::Error;

use crate::capture::AcquisitionState;
use crate::electronics::Temperatures;

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

/// Per-camera acquisition figures.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraMetrics {
    pub camera_id: String,
    pub state: AcquisitionState,
    /// Frames of the current (or last) run.
    pub frames_acquired: u64,
    pub fps: f64,
}

/// Progress of the recording attached to one camera.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordingMetrics {
    pub camera_id: String,
    pub frames_written: u64,
    pub bytes_written: u64,
    pub buffered_bytes: u64,
}

/// A snapshot of system state for metrics update.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub cameras: Vec<CameraMetrics>,
    pub recordings: Vec<RecordingMetrics>,
    /// Messages accepted by the hub since start.
    pub hub_published: u64,
    /// Messages dropped by full subscriber queues since start.
    pub hub_dropped: u64,
    /// Frames processed by all localization workers.
    pub frames_located: u64,
    pub temperatures: Option<Temperatures>,
}

impl MetricsSnapshot {
    pub fn camera(&self, camera_id: &str) -> Option<&CameraMetrics> {
        self.cameras.iter().find(|c| c.camera_id == camera_id)
    }
}

/// Prometheus metrics registry for the acquisition pipeline.
pub struct MetricsRegistry {
    registry: Registry,

    camera_running: IntGaugeVec,
    camera_frames: IntGaugeVec,
    camera_fps: GaugeVec,

    recording_frames: IntGaugeVec,
    recording_bytes: IntGaugeVec,
    recording_buffered: IntGaugeVec,

    hub_published: IntCounter,
    hub_dropped: IntCounter,
    frames_located: IntGauge,

    electronics_temperature: Gauge,
    sample_temperature: Gauge,

    latest: Mutex<Option<MetricsSnapshot>>,
}

impl MetricsRegistry {
    /// Creates a registry with all pipeline metrics registered.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let camera_running = IntGaugeVec::new(
            Opts::new("fiberscope_camera_running", "Camera free-run state (1=running, 0=idle)"),
            &["camera"],
        )?;
        let camera_frames = IntGaugeVec::new(
            Opts::new("fiberscope_camera_frames_acquired", "Frames acquired in the current run"),
            &["camera"],
        )?;
        let camera_fps = GaugeVec::new(
            Opts::new("fiberscope_camera_fps", "Frame rate over the last second"),
            &["camera"],
        )?;

        let recording_frames = IntGaugeVec::new(
            Opts::new("fiberscope_recording_frames_written", "Frames written to the current recording"),
            &["camera"],
        )?;
        let recording_bytes = IntGaugeVec::new(
            Opts::new("fiberscope_recording_bytes_written", "Bytes written to the current recording"),
            &["camera"],
        )?;
        let recording_buffered = IntGaugeVec::new(
            Opts::new("fiberscope_recording_buffered_bytes", "Bytes waiting for the next flush"),
            &["camera"],
        )?;

        let hub_published = IntCounter::new(
            "fiberscope_hub_published_total",
            "Messages published through the broadcast hub",
        )?;
        let hub_dropped = IntCounter::new(
            "fiberscope_hub_dropped_total",
            "Messages dropped by full subscriber queues",
        )?;
        let frames_located = IntGauge::new(
            "fiberscope_tracking_frames_processed",
            "Frames processed by running localization workers",
        )?;

        let electronics_temperature = Gauge::new(
            "fiberscope_electronics_temperature_celsius",
            "Temperature of the electronics board",
        )?;
        let sample_temperature = Gauge::new(
            "fiberscope_sample_temperature_celsius",
            "Temperature at the sample",
        )?;

        registry.register(Box::new(camera_running.clone()))?;
        registry.register(Box::new(camera_frames.clone()))?;
        registry.register(Box::new(camera_fps.clone()))?;
        registry.register(Box::new(recording_frames.clone()))?;
        registry.register(Box::new(recording_bytes.clone()))?;
        registry.register(Box::new(recording_buffered.clone()))?;
        registry.register(Box::new(hub_published.clone()))?;
        registry.register(Box::new(hub_dropped.clone()))?;
        registry.register(Box::new(frames_located.clone()))?;
        registry.register(Box::new(electronics_temperature.clone()))?;
        registry.register(Box::new(sample_temperature.clone()))?;

        Ok(Self {
            registry,
            camera_running,
            camera_frames,
            camera_fps,
            recording_frames,
            recording_bytes,
            recording_buffered,
            hub_published,
            hub_dropped,
            frames_located,
            electronics_temperature,
            sample_temperature,
            latest: Mutex::new(None),
        })
    }

    /// Updates all metrics from a snapshot of system state.
    pub fn update(&self, snapshot: &MetricsSnapshot) {
        for camera in &snapshot.cameras {
            let labels = [camera.camera_id.as_str()];
            let running = matches!(camera.state, AcquisitionState::FreeRunning);
            self.camera_running.with_label_values(&labels).set(i64::from(running));
            self.camera_frames.with_label_values(&labels).set(camera.frames_acquired as i64);
            self.camera_fps.with_label_values(&labels).set(camera.fps);
        }

        for recording in &snapshot.recordings {
            let labels = [recording.camera_id.as_str()];
            self.recording_frames.with_label_values(&labels).set(recording.frames_written as i64);
            self.recording_bytes.with_label_values(&labels).set(recording.bytes_written as i64);
            self.recording_buffered.with_label_values(&labels).set(recording.buffered_bytes as i64);
        }

        // Counters only move forward; add the difference.
        let published = self.hub_published.get();
        if snapshot.hub_published > published {
            self.hub_published.inc_by(snapshot.hub_published - published);
        }
        let dropped = self.hub_dropped.get();
        if snapshot.hub_dropped > dropped {
            self.hub_dropped.inc_by(snapshot.hub_dropped - dropped);
        }
        self.frames_located.set(snapshot.frames_located as i64);

        if let Some(temperatures) = &snapshot.temperatures {
            self.electronics_temperature.set(temperatures.electronics);
            self.sample_temperature.set(temperatures.sample);
        }
        *self.latest.lock() = Some(snapshot.clone());
    }

    /// The snapshot passed to the last [`update`](Self::update).
    pub fn latest_snapshot(&self) -> Option<MetricsSnapshot> {
        self.latest.lock().clone()
    }

    /// Returns the underlying Prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            cameras: vec![CameraMetrics {
                camera_id: "microscope".into(),
                state: AcquisitionState::FreeRunning,
                frames_acquired: 120,
                fps: 49.5,
            }],
            recordings: vec![RecordingMetrics {
                camera_id: "microscope".into(),
                frames_written: 100,
                bytes_written: 4096,
                buffered_bytes: 512,
            }],
            hub_published: 240,
            hub_dropped: 3,
            frames_located: 60,
            temperatures: Some(Temperatures {
                electronics: 31.5,
                sample: 22.0,
                read_at: Utc::now(),
            }),
        }
    }

    #[test]
    fn test_registry_creation() {
        assert!(MetricsRegistry::new().is_ok());
    }

    #[test]
    fn test_metrics_update() {
        let registry = MetricsRegistry::new().unwrap();
        registry.update(&snapshot());

        let output = registry.encode().unwrap();
        assert!(output.contains("fiberscope_camera_running{camera=\"microscope\"} 1"));
        assert!(output.contains("fiberscope_camera_frames_acquired{camera=\"microscope\"} 120"));
        assert!(output.contains("fiberscope_recording_bytes_written{camera=\"microscope\"} 4096"));
        assert!(output.contains("fiberscope_hub_published_total 240"));
        assert!(output.contains("fiberscope_sample_temperature_celsius 22"));
        assert_eq!(registry.latest_snapshot().unwrap().frames_located, 60);
    }

    #[test]
    fn test_counters_never_decrease() {
        let registry = MetricsRegistry::new().unwrap();
        registry.update(&snapshot());
        let mut older = snapshot();
        older.hub_published = 10;
        older.hub_dropped = 0;
        registry.update(&older);

        let output = registry.encode().unwrap();
        assert!(output.contains("fiberscope_hub_published_total 240"));
        assert!(output.contains("fiberscope_hub_dropped_total 3"));
    }

    #[test]
    fn test_metrics_encode() {
        let registry = MetricsRegistry::new().unwrap();
        let output = registry.encode().unwrap();
        assert!(output.contains("fiberscope_hub_published_total"));
        assert!(output.contains("fiberscope_electronics_temperature_celsius"));
    }
}
