//! Traits for frame acquisition

use crate::pipeline::Frame;

/// Anything the engine can poll for frames.
///
/// Must return promptly: the engine calls it once per loop iteration.
pub trait FrameSource: Send + Sync {
    /// The most recent frame not yet handed out, if any.
    fn capture_latest(&self) -> Option<Frame>;
}

impl<S: FrameSource + ?Sized> FrameSource for std::sync::Arc<S> {
    fn capture_latest(&self) -> Option<Frame> {
        (**self).capture_latest()
    }
}
