//! In-memory batching of frames between container flushes.

use crate::capture::Frame;

use super::container::record_size;

/// Frames waiting to be written, with byte accounting against a ceiling.
///
/// A frame that would push the buffer past `max_memory` causes the pending
/// frames to be flushed first, so the buffered size never exceeds
/// `max(max_memory, one frame)`.
#[derive(Debug)]
pub struct FrameBuffer {
    max_memory: usize,
    frames: Vec<Frame>,
    buffered: usize,
    peak: usize,
}

impl FrameBuffer {
    pub fn new(max_memory: usize) -> Self {
        Self {
            max_memory,
            frames: Vec::new(),
            buffered: 0,
            peak: 0,
        }
    }

    pub fn max_memory(&self) -> usize {
        self.max_memory
    }

    /// True if `frame` has to wait for a flush of the pending frames.
    pub fn needs_flush_before(&self, frame: &Frame) -> bool {
        !self.frames.is_empty() && self.buffered + record_size(frame) > self.max_memory
    }

    /// Adds a frame. Callers flush first when
    /// [`needs_flush_before`](Self::needs_flush_before) says so.
    pub fn push(&mut self, frame: Frame) {
        self.buffered += record_size(&frame);
        self.peak = self.peak.max(self.buffered);
        self.frames.push(frame);
    }

    /// True once the ceiling is reached and the next push would flush anyway.
    pub fn is_full(&self) -> bool {
        self.buffered >= self.max_memory
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered
    }

    pub fn peak_bytes(&self) -> usize {
        self.peak
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Forgets the pending frames after they were written.
    pub fn clear(&mut self) {
        self.frames.clear();
        self.buffered = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use crate::recording::container::RECORD_HEADER_SIZE;

    fn frame(len: usize) -> Frame {
        Frame::new(vec![0u8; len], len as u32, 1, PixelFormat::Mono8, 0)
    }

    #[test]
    fn test_flush_before_exceeding_ceiling() {
        let record = RECORD_HEADER_SIZE + 100;
        let mut buffer = FrameBuffer::new(record * 3);
        for _ in 0..3 {
            assert!(!buffer.needs_flush_before(&frame(100)));
            buffer.push(frame(100));
        }
        assert!(buffer.is_full());
        assert!(buffer.needs_flush_before(&frame(100)));
        buffer.clear();
        assert_eq!(buffer.buffered_bytes(), 0);
        assert_eq!(buffer.peak_bytes(), record * 3);
    }

    #[test]
    fn test_oversized_frame_accepted_alone() {
        let mut buffer = FrameBuffer::new(10);
        assert!(!buffer.needs_flush_before(&frame(1000)));
        buffer.push(frame(1000));
        assert!(buffer.needs_flush_before(&frame(1)));
        assert_eq!(buffer.peak_bytes(), RECORD_HEADER_SIZE + 1000);
    }
}
