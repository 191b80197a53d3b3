//! Experiment configuration file.
//!
//! ```toml
//! [[cameras]]
//! id = "microscope"
//! kind = "simulated"
//! settings = { exposure_ms = 20.0, gain = 1.0 }
//!
//! [electronics]
//! simulated = true
//!
//! [recording]
//! folder = "data"
//! filename = "cartridge_{cartridge_number}_{i}.fsrec"
//! snapshot_filename = "snapshot_{cartridge_number}_{i}.fsrec"
//!
//! [tracking]
//! diameter = 9
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::broadcast::DeliveryPolicy;
use crate::capture::{CameraConfig, ConfigError};
use crate::electronics::{ChannelConfig, DEFAULT_BAUD_RATE, MAX_TEMPERATURE_INTERVAL};
use crate::localization::LocateParams;
use crate::recording::DEFAULT_MAX_MEMORY;
use crate::worker::Isolation;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub cameras: Vec<CameraConfig>,
    pub electronics: ElectronicsConfig,
    pub recording: RecordingConfig,
    pub tracking: TrackingConfig,
    pub hub: HubConfig,
    /// Executable for process-isolated workers; defaults to the running binary.
    pub worker_executable: Option<PathBuf>,
}

/// Control board connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectronicsConfig {
    /// Run without a board.
    pub enabled: bool,
    /// Use the in-memory board instead of a serial port.
    pub simulated: bool,
    /// Serial port path; discovered among USB ports when unset.
    pub port: Option<String>,
    /// Index among discovered USB ports when `port` is unset.
    pub device_index: usize,
    pub baud_rate: u32,
    pub response_timeout_ms: u64,
    #[serde(flatten)]
    pub channel: ChannelConfig,
}

impl Default for ElectronicsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            simulated: true,
            port: None,
            device_index: 0,
            baud_rate: DEFAULT_BAUD_RATE,
            response_timeout_ms: 1000,
            channel: ChannelConfig::default(),
        }
    }
}

impl ElectronicsConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// Where and how recordings are written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Base folder; recordings go to a dated subfolder.
    pub folder: PathBuf,
    /// File name template with `{cartridge_number}` and `{i}` placeholders.
    pub filename: String,
    /// Template for single-frame snapshots, same placeholders.
    pub snapshot_filename: String,
    pub cartridge_number: String,
    pub max_memory_bytes: usize,
    pub isolation: Isolation,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            folder: PathBuf::from("data"),
            filename: "cartridge_{cartridge_number}_{i}.fsrec".to_string(),
            snapshot_filename: "snapshot_{cartridge_number}_{i}.fsrec".to_string(),
            cartridge_number: "0".to_string(),
            max_memory_bytes: DEFAULT_MAX_MEMORY,
            isolation: Isolation::Thread,
        }
    }
}

/// Localization parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub diameter: u32,
    pub min_mass: f64,
    pub threshold: f64,
    pub max_features: Option<usize>,
    pub isolation: Isolation,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            diameter: 9,
            min_mass: 0.0,
            threshold: 10.0,
            max_features: None,
            isolation: Isolation::Thread,
        }
    }
}

impl TrackingConfig {
    pub fn params(&self) -> LocateParams {
        LocateParams {
            diameter: self.diameter,
            min_mass: self.min_mass,
            threshold: self.threshold,
            max_features: self.max_features,
        }
    }
}

/// Queue settings of recorder subscriptions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub queue_capacity: usize,
    pub block_timeout_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            block_timeout_ms: 20,
        }
    }
}

impl HubConfig {
    /// Policy used for lossless consumers.
    pub fn recorder_policy(&self) -> DeliveryPolicy {
        DeliveryPolicy::Block {
            capacity: self.queue_capacity,
            timeout: Duration::from_millis(self.block_timeout_ms),
        }
    }
}

impl ExperimentConfig {
    /// Loads and validates a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileReadError(e.to_string()))?;
        let config: ExperimentConfig =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// A single simulated camera and a simulated board.
    pub fn simulated(camera_id: &str) -> Self {
        Self {
            cameras: vec![CameraConfig::simulated(camera_id)],
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for camera in &self.cameras {
            camera.validate()?;
            if !seen.insert(camera.id.as_str()) {
                return Err(ConfigError::DuplicateCameraId(camera.id.clone()));
            }
        }
        for (field, template) in [
            ("recording.filename", &self.recording.filename),
            ("recording.snapshot_filename", &self.recording.snapshot_filename),
        ] {
            if !template.contains("{i}") {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must contain the {i} placeholder".into(),
                });
            }
        }
        if self.recording.max_memory_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "recording.max_memory_bytes",
                reason: "must be positive".into(),
            });
        }
        if let Err(err) = self.tracking.params().validate() {
            return Err(ConfigError::InvalidValue {
                field: "tracking",
                reason: err.to_string(),
            });
        }
        if self.hub.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "hub.queue_capacity",
                reason: "must be positive".into(),
            });
        }
        if self.electronics.baud_rate == 0 {
            return Err(ConfigError::InvalidValue {
                field: "electronics.baud_rate",
                reason: "must be positive".into(),
            });
        }
        let interval = self.electronics.channel.temperature_interval_s;
        let max_interval = MAX_TEMPERATURE_INTERVAL.as_secs_f64();
        if !(interval > 0.0 && interval <= max_interval) {
            return Err(ConfigError::InvalidValue {
                field: "electronics.temperature_interval_s",
                reason: format!("{interval} outside (0, {max_interval}]"),
            });
        }
        Ok(())
    }
}
