use bytes::BytesMut;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use super::traits::FrameSource;
use crate::pipeline::{Frame, FrameShape};

/// Test-pattern source: a diagonal gradient that scrolls one pixel per frame.
/// Every call produces a new frame.
pub struct SyntheticSource {
    shape: FrameShape,
    sequence: AtomicU64,
}

impl SyntheticSource {
    pub fn new(shape: FrameShape) -> Self {
        Self {
            shape,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    /// Frames produced so far
    pub fn produced(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }

    fn render(&self, sequence: u64) -> BytesMut {
        let FrameShape {
            width,
            height,
            channels,
        } = self.shape;
        let mut data = BytesMut::zeroed(self.shape.byte_len());
        let offset = sequence as usize;
        let channels = channels as usize;

        for y in 0..height as usize {
            for x in 0..width as usize {
                let value = ((x + y + offset) % 256) as u8;
                let start = (y * width as usize + x) * channels;
                for (c, byte) in data[start..start + channels].iter_mut().enumerate() {
                    *byte = value.wrapping_add((c * 85) as u8);
                }
            }
        }
        data
    }
}

impl FrameSource for SyntheticSource {
    fn capture_latest(&self) -> Option<Frame> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        Some(Frame {
            data: self.render(sequence).freeze(),
            shape: self.shape,
            sequence,
            captured_at: Instant::now(),
        })
    }
}
