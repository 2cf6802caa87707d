//! Core types for the pipeline system

use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Key/value results accumulated by process stages for one frame.
pub type ResultMap = BTreeMap<String, serde_json::Value>;

/// Fixed shape of a frame buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameShape {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
}

impl FrameShape {
    pub fn new(width: u32, height: u32, channels: u8) -> Self {
        Self {
            width,
            height,
            channels,
        }
    }

    /// Number of bytes a frame of this shape occupies
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize
    }
}

impl std::fmt::Display for FrameShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}x{}", self.width, self.height, self.channels)
    }
}

/// One captured frame.
///
/// The payload is shared and immutable: cloning a frame is cheap, and a stage
/// that wants to change pixels goes through [`Frame::map_pixels`], which
/// writes into a fresh buffer.
#[derive(Clone)]
pub struct Frame {
    /// Interleaved pixel data, `shape.byte_len()` bytes
    pub data: Bytes,

    pub shape: FrameShape,

    /// Monotonic sequence number assigned by the frame source
    pub sequence: u64,

    /// When the frame was captured
    pub captured_at: Instant,
}

impl Frame {
    /// Create a frame, checking the payload against the shape.
    pub fn new(data: Bytes, shape: FrameShape, sequence: u64) -> anyhow::Result<Self> {
        if data.len() != shape.byte_len() {
            anyhow::bail!(
                "frame payload is {} bytes, shape {} needs {}",
                data.len(),
                shape,
                shape.byte_len()
            );
        }
        Ok(Self {
            data,
            shape,
            sequence,
            captured_at: Instant::now(),
        })
    }

    /// A zero-filled frame
    pub fn blank(shape: FrameShape, sequence: u64) -> Self {
        Self {
            data: BytesMut::zeroed(shape.byte_len()).freeze(),
            shape,
            sequence,
            captured_at: Instant::now(),
        }
    }

    /// Copy the payload, let `f` edit the copy, and return the edited frame.
    pub fn map_pixels(self, f: impl FnOnce(&mut [u8])) -> Self {
        let mut data = BytesMut::from(&self.data[..]);
        f(&mut data);
        Self {
            data: data.freeze(),
            ..self
        }
    }

    /// Get the size of the frame data in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Time since capture
    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("shape", &self.shape)
            .field("sequence", &self.sequence)
            .field("size", &self.size())
            .field("age", &self.age())
            .finish()
    }
}

/// A frame that went through every stage, with the results extracted from it.
#[derive(Debug, Clone)]
pub struct ProcessedFrame {
    pub frame: Frame,
    pub results: ResultMap,
    /// Time spent inside the stages
    pub latency: Duration,
}
