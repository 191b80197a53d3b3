//! Board-level vocabulary: LEDs, motion bytes and temperature readings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::device::DeviceError;

/// Full-scale value of the laser DAC.
pub const LASER_DAC_MAX: u32 = 4095;

/// Below this DAC output the laser indicator LED is switched off.
pub const LASER_LED_THRESHOLD: u32 = 100;

/// Largest piezo speed that fits the 6-bit field.
pub const MAX_PIEZO_SPEED: u8 = 63;

/// Indicator and illumination LEDs, numbered as the firmware expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Led {
    Side = 0,
    Top = 1,
    Fiber = 2,
    Power = 3,
    Laser = 4,
    Measure = 5,
}

impl Led {
    pub const ALL: [Led; 6] = [Led::Side, Led::Top, Led::Fiber, Led::Power, Led::Laser, Led::Measure];

    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Led::Side => "side",
            Led::Top => "top",
            Led::Fiber => "fiber",
            Led::Power => "power",
            Led::Laser => "laser",
            Led::Measure => "measure",
        }
    }
}

impl std::str::FromStr for Led {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Led::ALL
            .into_iter()
            .find(|led| led.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| DeviceError::InvalidArgument(format!("unknown LED: {s}")))
    }
}

/// Packs a piezo move into the single byte the firmware reads after `mot<axis>`.
///
/// Layout, most significant bit first: direction (1), enable (1, always
/// set), speed (6).
pub fn encode_motion(speed: u8, direction: u8) -> Result<u8, DeviceError> {
    if speed > MAX_PIEZO_SPEED {
        return Err(DeviceError::InvalidArgument(format!(
            "piezo speed {speed} exceeds {MAX_PIEZO_SPEED}"
        )));
    }
    if direction > 1 {
        return Err(DeviceError::InvalidArgument(format!(
            "piezo direction must be 0 or 1, got {direction}"
        )));
    }
    Ok((direction << 7) | (1 << 6) | speed)
}

/// DAC output for a laser power percentage.
pub fn laser_output(percent: f64) -> Result<u32, DeviceError> {
    if !(0.0..=100.0).contains(&percent) {
        return Err(DeviceError::InvalidArgument(format!(
            "laser power {percent}% outside 0-100"
        )));
    }
    Ok((percent / 100.0 * LASER_DAC_MAX as f64).round() as u32)
}

/// Last reading of the two board thermistors, in °C.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Temperatures {
    pub electronics: f64,
    pub sample: f64,
    pub read_at: DateTime<Utc>,
}

/// Commanded board state, mirrored on the host.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoardState {
    pub leds: [bool; 6],
    pub laser_power: f64,
    pub servo: Option<u32>,
}

impl BoardState {
    #[inline]
    pub fn led(&self, led: Led) -> bool {
        self.leds[led.code() as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_motion_layout() {
        assert_eq!(encode_motion(60, 1).unwrap(), 0b1111_1100);
        assert_eq!(encode_motion(0, 0).unwrap(), 0b0100_0000);
        assert_eq!(encode_motion(63, 0).unwrap(), 0b0111_1111);
    }

    #[test]
    fn test_encode_motion_rejects_out_of_range() {
        assert!(matches!(encode_motion(64, 0), Err(DeviceError::InvalidArgument(_))));
        assert!(matches!(encode_motion(10, 2), Err(DeviceError::InvalidArgument(_))));
    }

    #[test]
    fn test_laser_output_rounding() {
        assert_eq!(laser_output(0.0).unwrap(), 0);
        assert_eq!(laser_output(50.0).unwrap(), 2048);
        assert_eq!(laser_output(100.0).unwrap(), 4095);
        assert_eq!(laser_output(2.0).unwrap(), 82);
        assert!(laser_output(101.0).is_err());
        assert!(laser_output(f64::NAN).is_err());
    }

    #[test]
    fn test_led_from_str() {
        assert_eq!("Fiber".parse::<Led>().unwrap(), Led::Fiber);
        assert!("strobe".parse::<Led>().is_err());
    }

    proptest! {
        #[test]
        fn motion_byte_round_trips(speed in 0u8..=63, direction in 0u8..=1) {
            let byte = encode_motion(speed, direction).unwrap();
            prop_assert_eq!(byte >> 7, direction);
            prop_assert_eq!((byte >> 6) & 1, 1);
            prop_assert_eq!(byte & 0x3F, speed);
        }
    }
}
