//! Single-slot holder for the most recent frame of a camera.

use parking_lot::Mutex;

use super::Frame;

/// Latest-frame slot with take-on-read semantics.
///
/// The acquisition loop overwrites the slot on every frame; a reader takes
/// the frame out, leaving the slot empty until the next one arrives. At
/// most one reader observes a given frame.
#[derive(Debug, Default)]
pub struct LatestFrame {
    slot: Mutex<Option<Frame>>,
}

impl LatestFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the stored frame.
    pub fn store(&self, frame: Frame) {
        *self.slot.lock() = Some(frame);
    }

    /// Removes and returns the stored frame, if any.
    pub fn take_latest(&self) -> Option<Frame> {
        self.slot.lock().take()
    }

    /// Returns true if a frame is waiting to be taken.
    pub fn is_pending(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Drops any stored frame.
    pub fn clear(&self) {
        self.slot.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;

    #[test]
    fn test_take_clears_slot() {
        let slot = LatestFrame::new();
        assert!(slot.take_latest().is_none());

        slot.store(Frame::new(vec![0u8; 4], 2, 2, PixelFormat::Mono8, 1));
        slot.store(Frame::new(vec![0u8; 4], 2, 2, PixelFormat::Mono8, 2));
        assert!(slot.is_pending());

        let frame = slot.take_latest().unwrap();
        assert_eq!(frame.sequence(), 2);
        assert!(slot.take_latest().is_none());
    }
}
