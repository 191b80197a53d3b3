//! Frame type representing a captured image with metadata.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pixel layout of a frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// 8 bits per pixel.
    #[default]
    Mono8,
    /// 12 significant bits stored in a little-endian u16.
    Mono12,
    /// 16 bits per pixel, little-endian.
    Mono16,
}

impl PixelFormat {
    /// Number of bytes each pixel occupies in the buffer.
    #[inline]
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Mono8 => 1,
            PixelFormat::Mono12 | PixelFormat::Mono16 => 2,
        }
    }

    /// Stable one-byte code used by the recording container.
    pub fn code(self) -> u8 {
        match self {
            PixelFormat::Mono8 => 0,
            PixelFormat::Mono12 => 1,
            PixelFormat::Mono16 => 2,
        }
    }

    /// Inverse of [`PixelFormat::code`].
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(PixelFormat::Mono8),
            1 => Some(PixelFormat::Mono12),
            2 => Some(PixelFormat::Mono16),
            _ => None,
        }
    }
}

/// Image data as handed over by a camera device, before the acquisition
/// loop stamps it with a sequence number.
#[derive(Debug, Clone)]
pub struct RawImage {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Pixel layout.
    pub pixel_format: PixelFormat,
    /// Pixel buffer.
    pub data: Bytes,
}

/// A single captured frame from a camera.
///
/// Frames are immutable once published. The pixel buffer is a reference
/// counted [`Bytes`], so cloning a frame for every subscriber shares the
/// same allocation; it is released when the last clone is dropped.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    sequence: u64,
    captured_at: DateTime<Utc>,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    data: Bytes,
}

impl Frame {
    /// Creates a frame captured now.
    pub fn new(
        data: impl Into<Bytes>,
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
        sequence: u64,
    ) -> Self {
        Self::with_timestamp(data, width, height, pixel_format, sequence, Utc::now())
    }

    /// Creates a frame with an explicit capture timestamp.
    pub fn with_timestamp(
        data: impl Into<Bytes>,
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
        sequence: u64,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self {
            sequence,
            captured_at,
            width,
            height,
            pixel_format,
            data: data.into(),
        }
    }

    /// Stamps a raw device image.
    pub fn from_raw(raw: RawImage, sequence: u64) -> Self {
        Self::new(raw.data, raw.width, raw.height, raw.pixel_format, sequence)
    }

    /// Returns the raw pixel buffer.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns a shared handle to the pixel buffer.
    #[inline]
    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    /// Returns the capture timestamp.
    #[inline]
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Returns the sequence number assigned by the acquisition loop.
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Returns the total number of pixels (width * height).
    #[inline]
    pub fn pixel_count(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }

    /// Size of the pixel buffer in bytes.
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Validates that the pixel buffer size matches dimensions and format.
    pub fn is_valid(&self) -> bool {
        self.data.len() == self.pixel_count() * self.pixel_format.bytes_per_pixel()
    }

    /// Reads the pixel at `(x, y)` widened to u16.
    ///
    /// Returns `None` outside the frame.
    pub fn pixel(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let index = y as usize * self.width as usize + x as usize;
        match self.pixel_format {
            PixelFormat::Mono8 => self.data.get(index).map(|&v| u16::from(v)),
            PixelFormat::Mono12 | PixelFormat::Mono16 => {
                let offset = index * 2;
                let lo = *self.data.get(offset)?;
                let hi = *self.data.get(offset + 1)?;
                Some(u16::from_le_bytes([lo, hi]))
            }
        }
    }

    /// Copies the pixels into a widened buffer, row-major.
    pub fn to_u16(&self) -> Vec<u16> {
        match self.pixel_format {
            PixelFormat::Mono8 => self.data.iter().map(|&v| u16::from(v)).collect(),
            PixelFormat::Mono12 | PixelFormat::Mono16 => self
                .data
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect(),
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.sequence)
            .field("captured_at", &self.captured_at)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pixel_format", &self.pixel_format)
            .field("pixel_bytes", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_creation() {
        let frame = Frame::new(vec![0u8; 640 * 480], 640, 480, PixelFormat::Mono8, 1);

        assert_eq!(frame.width(), 640);
        assert_eq!(frame.height(), 480);
        assert_eq!(frame.sequence(), 1);
        assert!(frame.is_valid());
    }

    #[test]
    fn test_frame_invalid_size() {
        let frame = Frame::new(vec![0u8; 100], 640, 480, PixelFormat::Mono8, 1);
        assert!(!frame.is_valid());

        let frame = Frame::new(vec![0u8; 640 * 480], 640, 480, PixelFormat::Mono16, 1);
        assert!(!frame.is_valid());
    }

    #[test]
    fn test_clone_shares_buffer() {
        let frame = Frame::new(vec![7u8; 16], 4, 4, PixelFormat::Mono8, 3);
        let copy = frame.clone();
        assert_eq!(frame.data().as_ptr(), copy.data().as_ptr());
    }

    #[test]
    fn test_pixel_access_mono16() {
        let mut data = vec![0u8; 8];
        data[2..4].copy_from_slice(&1000u16.to_le_bytes());
        let frame = Frame::new(data, 2, 2, PixelFormat::Mono16, 0);
        assert_eq!(frame.pixel(1, 0), Some(1000));
        assert_eq!(frame.pixel(2, 0), None);
        assert_eq!(frame.to_u16(), vec![0, 1000, 0, 0]);
    }

    #[test]
    fn test_pixel_format_codes() {
        for fmt in [PixelFormat::Mono8, PixelFormat::Mono12, PixelFormat::Mono16] {
            assert_eq!(PixelFormat::from_code(fmt.code()), Some(fmt));
        }
        assert_eq!(PixelFormat::from_code(9), None);
    }
}
