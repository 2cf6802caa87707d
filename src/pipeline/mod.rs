//! Stage pipeline
//!
//! Frames move through a bounded input queue, a fixed preprocess → process →
//! postprocess composition of user stages, and a bounded output queue:
//! - Stages are single-method capabilities registered once, at build time
//! - Both queues drop instead of blocking when full
//! - Every pass is timed into telemetry; a failing pass is recorded and skipped
//! - Health counters track submissions, drops and failures

pub mod coordinator;
pub mod health;
pub mod stage;
pub mod state;
pub mod types;

pub use coordinator::{PipelineBuilder, StagePipeline};
pub use health::{HealthSummary, PipelineHealth};
pub use stage::{Postprocessor, Preprocessor, Processor, Stage, StageKind, StageSet};
pub use state::PipelineState;
pub use types::{Frame, FrameShape, ProcessedFrame, ResultMap};
