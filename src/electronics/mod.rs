//! Control board: laser, LEDs, shutter servo, piezo mirror, thermistors.
//!
//! The board speaks newline-terminated ASCII over a serial port. All access
//! goes through a [`DeviceChannel`], which serialises commands from the
//! controller, the temperature monitor and any other thread.

mod board;
mod channel;
mod device;
mod serial;
mod simulated;

pub use board::{
    encode_motion, laser_output, BoardState, Led, Temperatures, LASER_DAC_MAX, LASER_LED_THRESHOLD,
    MAX_PIEZO_SPEED,
};
pub use channel::{
    ChannelConfig, ChannelGuard, DeviceChannel, DEFAULT_TEMPERATURE_INTERVAL, MAX_TEMPERATURE_INTERVAL,
};
pub use device::{DeviceError, ElectronicsDevice};
pub use serial::{SerialBoard, DEFAULT_BAUD_RATE};
pub use simulated::{SimulatedBoard, WireEvent, WireLog};
