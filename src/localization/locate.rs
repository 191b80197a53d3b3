//! Particle localization on single frames.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capture::Frame;

/// Errors raised by locators.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LocateError {
    #[error("a diameter is mandatory for locating particles")]
    DiameterNotDefined,
    #[error("invalid feature diameter {0}: must be odd and positive")]
    InvalidDiameter(u32),
    #[error("invalid locate parameter {field}: {reason}")]
    InvalidParameter { field: &'static str, reason: String },
}

/// One detected particle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Column of the centroid, in pixels.
    pub x: f64,
    /// Row of the centroid, in pixels.
    pub y: f64,
    /// Integrated brightness above background.
    pub intensity: f64,
    /// Radius of gyration, in pixels.
    pub size: f64,
}

/// All particles found in one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSet {
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub locations: Vec<Location>,
}

impl LocationSet {
    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}

/// Parameters of a locate call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocateParams {
    /// Expected feature diameter in pixels. Odd.
    pub diameter: u32,
    /// Minimum integrated brightness of a feature.
    #[serde(default)]
    pub min_mass: f64,
    /// Minimum peak height above the frame mean.
    #[serde(default)]
    pub threshold: f64,
    /// Keep only the brightest N features.
    #[serde(default)]
    pub max_features: Option<usize>,
}

impl LocateParams {
    pub fn new(diameter: u32) -> Self {
        Self {
            diameter,
            min_mass: 0.0,
            threshold: 0.0,
            max_features: None,
        }
    }

    pub fn validate(&self) -> Result<(), LocateError> {
        if self.diameter == 0 || self.diameter % 2 == 0 {
            return Err(LocateError::InvalidDiameter(self.diameter));
        }
        if !self.min_mass.is_finite() || self.min_mass < 0.0 {
            return Err(LocateError::InvalidParameter {
                field: "min_mass",
                reason: format!("{} is not a non-negative number", self.min_mass),
            });
        }
        if !self.threshold.is_finite() || self.threshold < 0.0 {
            return Err(LocateError::InvalidParameter {
                field: "threshold",
                reason: format!("{} is not a non-negative number", self.threshold),
            });
        }
        Ok(())
    }

    #[inline]
    pub fn radius(&self) -> u32 {
        self.diameter / 2
    }
}

/// Finds particles in a frame.
pub trait Locator: Send {
    fn locate(&self, frame: &Frame, params: &LocateParams) -> Result<Vec<Location>, LocateError>;
}

/// Local-maximum detector with intensity-weighted centroid refinement.
///
/// A pixel is a candidate if it is the brightest within `radius` in both
/// directions and rises at least `threshold` above the frame mean. Features
/// closer than `radius` to the border are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct CentroidLocator;

impl Locator for CentroidLocator {
    fn locate(&self, frame: &Frame, params: &LocateParams) -> Result<Vec<Location>, LocateError> {
        params.validate()?;
        let width = frame.width() as usize;
        let height = frame.height() as usize;
        let r = params.radius() as usize;
        if width <= 2 * r || height <= 2 * r || !frame.is_valid() {
            return Ok(Vec::new());
        }

        let pixels: Vec<f64> = frame.to_u16().into_iter().map(f64::from).collect();
        let background = pixels.iter().sum::<f64>() / pixels.len() as f64;
        let at = |x: usize, y: usize| pixels[y * width + x];
        let r2 = (r * r) as isize;

        let mut found = Vec::new();
        for y in r..height - r {
            for x in r..width - r {
                let peak = at(x, y);
                if peak - background < params.threshold || peak <= background {
                    continue;
                }
                if !is_local_max(&pixels, width, x, y, r) {
                    continue;
                }

                let mut mass = 0.0;
                let mut sx = 0.0;
                let mut sy = 0.0;
                let mut srr = 0.0;
                for dy in -(r as isize)..=r as isize {
                    for dx in -(r as isize)..=r as isize {
                        if dx * dx + dy * dy > r2 {
                            continue;
                        }
                        let px = (x as isize + dx) as usize;
                        let py = (y as isize + dy) as usize;
                        let weight = (at(px, py) - background).max(0.0);
                        mass += weight;
                        sx += weight * dx as f64;
                        sy += weight * dy as f64;
                        srr += weight * (dx * dx + dy * dy) as f64;
                    }
                }
                if mass <= 0.0 || mass < params.min_mass {
                    continue;
                }
                found.push(Location {
                    x: x as f64 + sx / mass,
                    y: y as f64 + sy / mass,
                    intensity: mass,
                    size: (srr / mass).sqrt(),
                });
            }
        }

        found.sort_by(|a, b| b.intensity.total_cmp(&a.intensity));
        if let Some(max) = params.max_features {
            found.truncate(max);
        }
        Ok(found)
    }
}

// Plateaus resolve to their first pixel in scan order.
fn is_local_max(pixels: &[f64], width: usize, x: usize, y: usize, r: usize) -> bool {
    let peak = pixels[y * width + x];
    for ny in y - r..=y + r {
        for nx in x - r..=x + r {
            if (nx, ny) == (x, y) {
                continue;
            }
            let value = pixels[ny * width + nx];
            let before = (ny, nx) < (y, x);
            if value > peak || (before && value >= peak) {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;

    fn frame_with_spots(width: u32, height: u32, spots: &[(u32, u32, u8)]) -> Frame {
        let mut data = vec![10u8; (width * height) as usize];
        for &(cx, cy, peak) in spots {
            for dy in -2i32..=2 {
                for dx in -2i32..=2 {
                    let x = cx as i32 + dx;
                    let y = cy as i32 + dy;
                    let falloff = (dx.abs() + dy.abs()) as u8 * 20;
                    let value = peak.saturating_sub(falloff);
                    let idx = (y as u32 * width + x as u32) as usize;
                    data[idx] = data[idx].max(value);
                }
            }
        }
        Frame::new(data, width, height, PixelFormat::Mono8, 0)
    }

    #[test]
    fn test_diameter_must_be_odd() {
        assert_eq!(LocateParams::new(4).validate(), Err(LocateError::InvalidDiameter(4)));
        assert_eq!(LocateParams::new(0).validate(), Err(LocateError::InvalidDiameter(0)));
        assert!(LocateParams::new(5).validate().is_ok());
    }

    #[test]
    fn test_finds_spots_at_their_centres() {
        let frame = frame_with_spots(40, 30, &[(10, 8, 200), (30, 20, 150)]);
        let found = CentroidLocator.locate(&frame, &LocateParams::new(5)).unwrap();

        assert_eq!(found.len(), 2);
        assert!((found[0].x - 10.0).abs() < 0.01 && (found[0].y - 8.0).abs() < 0.01);
        assert!((found[1].x - 30.0).abs() < 0.01 && (found[1].y - 20.0).abs() < 0.01);
        assert!(found[0].intensity > found[1].intensity);
        assert!(found[0].size > 0.0);
    }

    #[test]
    fn test_min_mass_and_max_features() {
        let frame = frame_with_spots(40, 30, &[(10, 8, 200), (30, 20, 60)]);
        let mut params = LocateParams::new(5);
        params.max_features = Some(1);
        let found = CentroidLocator.locate(&frame, &params).unwrap();
        assert_eq!(found.len(), 1);
        assert!((found[0].x - 10.0).abs() < 0.01);

        params.max_features = None;
        params.min_mass = 100_000.0;
        assert!(CentroidLocator.locate(&frame, &params).unwrap().is_empty());
    }

    #[test]
    fn test_flat_frame_has_no_features() {
        let frame = Frame::new(vec![50u8; 100], 10, 10, PixelFormat::Mono8, 0);
        assert!(CentroidLocator.locate(&frame, &LocateParams::new(3)).unwrap().is_empty());
    }
}
