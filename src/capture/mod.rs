//! Frame acquisition
//!
//! The engine only depends on [`FrameSource`]. A [`CaptureWorker`] decouples
//! the capture rate from the engine loop by polling a source into a
//! [`LatestFrame`] slot, which is itself a source.

pub mod latest;
pub mod synthetic;
pub mod traits;

pub use latest::{CaptureWorker, LatestFrame};
pub use synthetic::SyntheticSource;
pub use traits::FrameSource;
