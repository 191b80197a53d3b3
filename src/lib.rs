//! Fiberscope acquisition library
//!
//! Real-time frame acquisition, fan-out and recording for a fiber
//! microscope: one or more cameras plus a control board driving a laser,
//! LEDs, a shutter servo and a piezo mirror.
//!
//! # Architecture
//!
//! Every camera runs its own acquisition loop, which publishes immutable
//! frames to a topic of the broadcast hub. Consumers subscribe to topics
//! and never talk to the producer directly:
//!
//! ```text
//! camera → acquisition ──► hub ──► recorder   (container file)
//!              │            │
//!              ▼            └──► localization ──► hub (locations)
//!         latest frame
//!          (display)
//! ```
//!
//! Recorder and localization can run on a thread or in a child process;
//! the same worker loop serves both, fed through the
//! [`broadcast::MessageSource`] / [`broadcast::MessageSink`] channel ends.
//!
//! # Example
//!
//! ```no_run
//! use fiberscope::experiment::{ExperimentConfig, ExperimentController};
//!
//! let config = ExperimentConfig::simulated("microscope");
//! let mut controller = ExperimentController::new(config);
//! controller.initialize().unwrap();
//!
//! controller.start_free_run("microscope").unwrap();
//! let path = controller.start_recording("microscope").unwrap();
//! std::thread::sleep(std::time::Duration::from_secs(1));
//! println!("recorded to {}", path.display());
//!
//! controller.finalize();
//! ```

#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod broadcast;
pub mod capture;
pub mod electronics;
pub mod experiment;
pub mod localization;
pub mod metrics;
pub mod recording;
pub mod worker;

// Re-export commonly used types at crate root
pub use broadcast::{BroadcastHub, DeliveryPolicy, Message, Subscription};
pub use capture::{AcquisitionLoop, CameraDevice, Frame, PixelFormat, Roi};
pub use electronics::{DeviceChannel, Led};
pub use experiment::{ExperimentConfig, ExperimentController, ExperimentError};
pub use localization::{LocalizationWorker, Location, LocationSet};
pub use recording::{ContainerReader, StreamRecorder};
pub use worker::Isolation;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
