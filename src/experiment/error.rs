use thiserror::Error;

use super::controller::ControllerState;
use crate::capture::{AcquisitionError, CameraError, ConfigError};
use crate::electronics::DeviceError;
use crate::localization::{LocalizationError, LocateError};
use crate::metrics::MetricsError;
use crate::recording::RecordingError;
use crate::worker::WorkerError;

/// Errors surfaced by the experiment controller.
#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("acquisition error: {0}")]
    Acquisition(#[from] AcquisitionError),
    #[error("electronics error: {0}")]
    Device(#[from] DeviceError),
    #[error("recording error: {0}")]
    Recording(#[from] RecordingError),
    #[error("localization error: {0}")]
    Localization(#[from] LocalizationError),
    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),
    #[error("metrics error: {0}")]
    Metrics(#[from] MetricsError),
    #[error("unknown camera: {0}")]
    UnknownCamera(String),
    #[error("electronics not configured")]
    NoElectronics,
    #[error("cannot {operation} while {state:?}")]
    WrongState {
        operation: &'static str,
        state: ControllerState,
    },
}

impl From<LocateError> for ExperimentError {
    fn from(err: LocateError) -> Self {
        ExperimentError::Localization(LocalizationError::Locate(err))
    }
}
