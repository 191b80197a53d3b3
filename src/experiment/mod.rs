//! Experiment orchestration.
//!
//! [`ExperimentController`] loads the configured cameras and the control
//! board, runs one acquisition loop per camera and attaches recorders and
//! localization workers to the frame topics on demand. Shutdown always
//! follows the same order: acquisition, consumers, electronics, cameras.

mod config;
mod controller;
mod error;

pub use config::{ElectronicsConfig, ExperimentConfig, HubConfig, RecordingConfig, TrackingConfig};
pub use controller::{
    CameraFault, ControllerState, ExperimentController, RECORDING_DRAIN_TIMEOUT, TRACKING_STOP_TIMEOUT,
};
pub use error::ExperimentError;
