//! Camera configuration and region-of-interest geometry.
//!
//! Sensors only accept windows aligned to a device-specific granularity.
//! Requests are floored to that grid before being applied, so the value
//! read back from a camera is the aligned one.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::frame::PixelFormat;

/// Alignment imposed by the sensor on ROI offsets and dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoiGranularity {
    /// Horizontal step in pixels (offsets and widths).
    pub horizontal: u32,
    /// Vertical step in pixels (offsets and heights).
    pub vertical: u32,
}

impl Default for RoiGranularity {
    fn default() -> Self {
        Self {
            horizontal: 4,
            vertical: 2,
        }
    }
}

/// On-sensor binning factors. Each output pixel sums a
/// `horizontal` x `vertical` block of the ROI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binning {
    pub horizontal: u32,
    pub vertical: u32,
}

impl Default for Binning {
    fn default() -> Self {
        Self {
            horizontal: 1,
            vertical: 1,
        }
    }
}

impl Binning {
    /// Largest factor accepted on either axis.
    pub const MAX_FACTOR: u32 = 4;

    /// Vertical-only binning, as used for dim fluorescence samples.
    pub fn vertical(factor: u32) -> Self {
        Self {
            horizontal: 1,
            vertical: factor,
        }
    }

    pub fn is_enabled(&self) -> bool {
        *self != Self::default()
    }

    /// Checks both factors are within `1..=MAX_FACTOR`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid = 1..=Self::MAX_FACTOR;
        if valid.contains(&self.horizontal) && valid.contains(&self.vertical) {
            Ok(())
        } else {
            Err(ConfigError::InvalidValue {
                field: "binning",
                reason: format!(
                    "{}x{} outside 1..={}",
                    self.horizontal,
                    self.vertical,
                    Self::MAX_FACTOR
                ),
            })
        }
    }

    /// Frame size produced from a `width` x `height` window.
    pub fn output_size(&self, width: u32, height: u32) -> (u32, u32) {
        (width / self.horizontal.max(1), height / self.vertical.max(1))
    }
}

/// Region of interest read out by the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub x_offset: u32,
    pub y_offset: u32,
    pub width: u32,
    pub height: u32,
}

/// ROI validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoiError {
    #[error("ROI has zero area after alignment ({width}x{height})")]
    Empty { width: u32, height: u32 },
    #[error("ROI exceeds sensor width: {x_offset} + {width} > {max}")]
    ExceedsWidth { x_offset: u32, width: u32, max: u32 },
    #[error("ROI exceeds sensor height: {y_offset} + {height} > {max}")]
    ExceedsHeight { y_offset: u32, height: u32, max: u32 },
    #[error("invalid granularity {0:?}")]
    InvalidGranularity(RoiGranularity),
}

impl Roi {
    pub fn new(x_offset: u32, y_offset: u32, width: u32, height: u32) -> Self {
        Self {
            x_offset,
            y_offset,
            width,
            height,
        }
    }

    /// The full sensor area.
    pub fn full(sensor_width: u32, sensor_height: u32) -> Self {
        Self::new(0, 0, sensor_width, sensor_height)
    }

    /// Floors every field to the granularity grid.
    pub fn align(&self, granularity: RoiGranularity) -> Self {
        let h = granularity.horizontal.max(1);
        let v = granularity.vertical.max(1);
        Self {
            x_offset: self.x_offset - self.x_offset % h,
            y_offset: self.y_offset - self.y_offset % v,
            width: self.width - self.width % h,
            height: self.height - self.height % v,
        }
    }

    /// Aligns the ROI and checks it against the sensor bounds.
    pub fn validate(
        &self,
        sensor_width: u32,
        sensor_height: u32,
        granularity: RoiGranularity,
    ) -> Result<Roi, RoiError> {
        if granularity.horizontal == 0 || granularity.vertical == 0 {
            return Err(RoiError::InvalidGranularity(granularity));
        }
        let aligned = self.align(granularity);
        if aligned.width == 0 || aligned.height == 0 {
            return Err(RoiError::Empty {
                width: aligned.width,
                height: aligned.height,
            });
        }
        if u64::from(aligned.x_offset) + u64::from(aligned.width) > u64::from(sensor_width) {
            return Err(RoiError::ExceedsWidth {
                x_offset: aligned.x_offset,
                width: aligned.width,
                max: sensor_width,
            });
        }
        if u64::from(aligned.y_offset) + u64::from(aligned.height) > u64::from(sensor_height) {
            return Err(RoiError::ExceedsHeight {
                y_offset: aligned.y_offset,
                height: aligned.height,
                max: sensor_height,
            });
        }
        Ok(aligned)
    }

    /// Number of pixels in the window.
    pub fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Per-camera settings applied while the camera is idle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    /// Exposure time in milliseconds.
    pub exposure_ms: f64,
    /// Analog gain (camera-specific units).
    pub gain: f64,
    /// Pixel layout.
    pub pixel_format: PixelFormat,
    /// Region of interest; `None` means the full sensor.
    pub roi: Option<Roi>,
    /// On-sensor binning; 1x1 by default.
    pub binning: Binning,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            exposure_ms: 10.0,
            gain: 0.0,
            pixel_format: PixelFormat::Mono8,
            roi: None,
            binning: Binning::default(),
        }
    }
}

impl CameraSettings {
    /// Exposure as a [`Duration`].
    pub fn exposure(&self) -> Duration {
        Duration::try_from_secs_f64(self.exposure_ms / 1000.0).unwrap_or(Duration::ZERO)
    }
}

/// Camera entry of the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Identifier used for topics and lookups (e.g. "microscope").
    pub id: String,
    /// Driver kind resolved through the camera registry.
    #[serde(default = "default_kind")]
    pub kind: String,
    /// Device selector passed to the driver; defaults to `id`.
    #[serde(default)]
    pub device: Option<String>,
    /// Settings applied after opening.
    #[serde(default)]
    pub settings: CameraSettings,
}

fn default_kind() -> String {
    "simulated".to_string()
}

impl CameraConfig {
    /// Creates a simulated camera entry with default settings.
    pub fn simulated(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: default_kind(),
            device: None,
            settings: CameraSettings::default(),
        }
    }

    /// Device selector handed to the driver.
    pub fn device_selector(&self) -> &str {
        self.device.as_deref().unwrap_or(&self.id)
    }

    /// Validates the configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::MissingCameraId);
        }
        if !(self.settings.exposure_ms > 0.0 && self.settings.exposure_ms <= 60_000.0) {
            return Err(ConfigError::InvalidExposure(self.settings.exposure_ms));
        }
        if self.settings.gain < 0.0 {
            return Err(ConfigError::InvalidGain(self.settings.gain));
        }
        self.settings.binning.validate()
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("camera entry without an id")]
    MissingCameraId,
    #[error("duplicate camera id: {0}")]
    DuplicateCameraId(String),
    #[error("invalid exposure time: {0} ms")]
    InvalidExposure(f64),
    #[error("invalid gain: {0}")]
    InvalidGain(f64),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("failed to read config file: {0}")]
    FileReadError(String),
    #[error("failed to parse config file: {0}")]
    ParseError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_config_valid() {
        assert!(CameraConfig::simulated("cam").validate().is_ok());
    }

    #[test]
    fn test_zero_exposure_invalid() {
        let mut config = CameraConfig::simulated("cam");
        config.settings.exposure_ms = 0.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidExposure(_))
        ));
    }

    #[test]
    fn test_binning_bounds() {
        assert!(!Binning::default().is_enabled());
        assert_eq!(Binning::vertical(4).output_size(64, 48), (64, 12));

        let mut config = CameraConfig::simulated("cam");
        config.settings.binning = Binning::vertical(4);
        assert!(config.validate().is_ok());
        config.settings.binning = Binning::vertical(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "binning", .. })
        ));
    }

    #[test]
    fn test_width_floored_to_granularity() {
        let roi = Roi::new(0, 0, 101, 51)
            .validate(640, 480, RoiGranularity::default())
            .unwrap();
        assert_eq!(roi.width, 100);
        assert_eq!(roi.height, 50);
    }

    #[test]
    fn test_roi_out_of_bounds() {
        let err = Roi::new(600, 0, 64, 10)
            .validate(640, 480, RoiGranularity::default())
            .unwrap_err();
        assert!(matches!(err, RoiError::ExceedsWidth { .. }));

        let err = Roi::new(0, 0, 3, 10)
            .validate(640, 480, RoiGranularity::default())
            .unwrap_err();
        assert!(matches!(err, RoiError::Empty { .. }));
    }

    proptest! {
        #[test]
        fn aligned_roi_is_on_grid_and_inside_sensor(
            x in 0u32..640, y in 0u32..480, w in 4u32..640, h in 2u32..480,
        ) {
            let g = RoiGranularity::default();
            if let Ok(roi) = Roi::new(x, y, w, h).validate(640, 480, g) {
                prop_assert_eq!(roi.x_offset % 4, 0);
                prop_assert_eq!(roi.width % 4, 0);
                prop_assert_eq!(roi.y_offset % 2, 0);
                prop_assert_eq!(roi.height % 2, 0);
                prop_assert!(roi.x_offset + roi.width <= 640);
                prop_assert!(roi.y_offset + roi.height <= 480);
                prop_assert!(roi.width <= w && w - roi.width < 4);
            }
        }
    }
}
