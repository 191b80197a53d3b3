//! Camera input and frame handling.
//!
//! Cameras are reached through the [`CameraDevice`] capability and resolved
//! by kind from a [`CameraRegistry`]. Each opened camera is driven by an
//! [`AcquisitionLoop`] that publishes immutable [`Frame`]s to the broadcast
//! hub and keeps the most recent one in a [`LatestFrame`] slot for display.

mod acquisition;
mod background;
mod camera;
mod config;
mod frame;
mod registry;
mod snapshot;

pub use acquisition::{
    AcquisitionError, AcquisitionLoop, AcquisitionState, CameraStatus, FpsMeter, FPS_WINDOW,
    RETRIEVE_MARGIN,
};
pub use background::RollingBackground;
pub use camera::{
    AcquisitionMode, CameraDevice, CameraDriver, CameraError, CameraInfo, SimulatedCamera,
    SimulatedDriver,
};
pub use config::{Binning, CameraConfig, CameraSettings, ConfigError, Roi, RoiError, RoiGranularity};
pub use frame::{Frame, PixelFormat, RawImage};
pub use registry::CameraRegistry;
pub use snapshot::LatestFrame;
