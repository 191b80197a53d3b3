//! Prometheus metrics for the acquisition pipeline.
//!
//! # Metrics Exposed
//!
//! ## Cameras (label `camera`)
//! - `fiberscope_camera_running` - Free-run state (1=running, 0=idle)
//! - `fiberscope_camera_frames_acquired` - Frames of the current run
//! - `fiberscope_camera_fps` - Frame rate over the last second
//!
//! ## Recordings (label `camera`)
//! - `fiberscope_recording_frames_written`
//! - `fiberscope_recording_bytes_written`
//! - `fiberscope_recording_buffered_bytes` - Bytes waiting for the next flush
//!
//! ## Hub and tracking
//! - `fiberscope_hub_published_total`
//! - `fiberscope_hub_dropped_total` - Messages lost to full subscriber queues
//! - `fiberscope_tracking_frames_processed`
//!
//! ## Electronics
//! - `fiberscope_electronics_temperature_celsius`
//! - `fiberscope_sample_temperature_celsius`
//!
//! With the `metrics` feature, [`MetricsServer`] serves the registry over
//! HTTP on `/metrics`.
//!
//! # Example
//!
//! ```no_run
//! use fiberscope::metrics::{MetricsRegistry, MetricsSnapshot};
//!
//! let registry = MetricsRegistry::new().expect("Failed to create registry");
//! let snapshot = MetricsSnapshot {
//!     hub_published: 1200,
//!     hub_dropped: 4,
//!     ..MetricsSnapshot::default()
//! };
//! registry.update(&snapshot);
//! print!("{}", registry.encode().unwrap());
//! ```

mod collector;
#[cfg(feature = "metrics")]
mod server;

pub use collector::{CameraMetrics, MetricsError, MetricsRegistry, MetricsSnapshot, RecordingMetrics};
#[cfg(feature = "metrics")]
pub use server::{MetricsServer, MetricsServerConfig, ServerError};
