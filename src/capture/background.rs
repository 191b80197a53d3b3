//! Rolling background subtraction for display frames.

use std::collections::VecDeque;

use bytes::Bytes;

use super::{Frame, PixelFormat};

/// Subtracts the per-pixel mean of the last `depth` frames.
///
/// Frames of a different shape or pixel format reset the history, which
/// happens naturally after an ROI or binning change.
#[derive(Debug)]
pub struct RollingBackground {
    depth: usize,
    history: VecDeque<Vec<u16>>,
    sums: Vec<u32>,
    shape: Option<(u32, u32, PixelFormat)>,
}

impl RollingBackground {
    pub fn new(depth: usize) -> Self {
        Self {
            depth: depth.max(1),
            history: VecDeque::new(),
            sums: Vec::new(),
            shape: None,
        }
    }

    /// Number of frames currently averaged.
    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.sums.clear();
        self.shape = None;
    }

    /// Adds `frame` to the history and returns it with the background
    /// removed (clamped at zero).
    pub fn apply(&mut self, frame: &Frame) -> Frame {
        let shape = (frame.width(), frame.height(), frame.pixel_format());
        if self.shape != Some(shape) {
            self.reset();
            self.shape = Some(shape);
            self.sums = vec![0; frame.pixel_count()];
        }

        let pixels = frame.to_u16();
        if pixels.len() != self.sums.len() {
            tracing::warn!(
                sequence = frame.sequence(),
                "Frame buffer does not match its dimensions, skipping background"
            );
            return frame.clone();
        }

        for (sum, &p) in self.sums.iter_mut().zip(&pixels) {
            *sum += u32::from(p);
        }
        self.history.push_back(pixels);
        if self.history.len() > self.depth {
            if let Some(old) = self.history.pop_front() {
                for (sum, p) in self.sums.iter_mut().zip(old) {
                    *sum -= u32::from(p);
                }
            }
        }

        let n = self.history.len() as u32;
        let current = self.history.back().map(Vec::as_slice).unwrap_or(&[]);
        let corrected: Vec<u16> = current
            .iter()
            .zip(&self.sums)
            .map(|(&p, &sum)| p.saturating_sub((sum / n) as u16))
            .collect();

        let data: Vec<u8> = match frame.pixel_format() {
            PixelFormat::Mono8 => corrected.iter().map(|&v| v as u8).collect(),
            PixelFormat::Mono12 | PixelFormat::Mono16 => {
                corrected.iter().flat_map(|v| v.to_le_bytes()).collect()
            }
        };

        Frame::with_timestamp(
            Bytes::from(data),
            frame.width(),
            frame.height(),
            frame.pixel_format(),
            frame.sequence(),
            frame.captured_at(),
        )
    }
}

impl Default for RollingBackground {
    fn default() -> Self {
        Self::new(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(value: u8, seq: u64) -> Frame {
        Frame::new(vec![value; 4], 2, 2, PixelFormat::Mono8, seq)
    }

    #[test]
    fn test_constant_scene_goes_dark() {
        let mut bg = RollingBackground::new(3);
        for seq in 0..5 {
            let out = bg.apply(&frame(50, seq));
            assert!(out.data().iter().all(|&v| v == 0));
        }
        assert_eq!(bg.len(), 3);
    }

    #[test]
    fn test_new_signal_stands_out() {
        let mut bg = RollingBackground::new(4);
        for seq in 0..4 {
            bg.apply(&frame(10, seq));
        }
        let out = bg.apply(&frame(90, 4));
        // mean of [10, 10, 10, 90] = 30
        assert!(out.data().iter().all(|&v| v == 60));
    }

    #[test]
    fn test_shape_change_resets() {
        let mut bg = RollingBackground::new(4);
        bg.apply(&frame(10, 0));
        bg.apply(&frame(10, 1));
        let wide = Frame::new(vec![10u8; 8], 4, 2, PixelFormat::Mono8, 2);
        bg.apply(&wide);
        assert_eq!(bg.len(), 1);
    }
}
