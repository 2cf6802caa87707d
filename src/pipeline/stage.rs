//! Pipeline stage capabilities
//!
//! A stage is one of three closed variants, each wrapping a single-method
//! capability. [`StageSet`] keeps them in registration order and runs the
//! fixed preprocess → process → postprocess composition for one frame.

use anyhow::Result;
use std::time::Instant;

use super::types::{Frame, ProcessedFrame, ResultMap};

/// Rewrites a frame before extraction
pub trait Preprocessor: Send + Sync {
    fn name(&self) -> &str;

    fn transform(&self, frame: Frame) -> Result<Frame>;
}

/// Extracts results from a frame; sees the results of earlier process stages
pub trait Processor: Send + Sync {
    fn name(&self) -> &str;

    fn extract(&self, frame: &Frame, results: &ResultMap) -> Result<ResultMap>;
}

/// Side-effecting consumer of a frame and its results
pub trait Postprocessor: Send + Sync {
    fn name(&self) -> &str;

    fn act(&self, frame: &Frame, results: &ResultMap) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Preprocess,
    Process,
    Postprocess,
}

/// A registered transformation
pub enum Stage {
    Preprocess(Box<dyn Preprocessor>),
    Process(Box<dyn Processor>),
    Postprocess(Box<dyn Postprocessor>),
}

impl Stage {
    pub fn kind(&self) -> StageKind {
        match self {
            Stage::Preprocess(_) => StageKind::Preprocess,
            Stage::Process(_) => StageKind::Process,
            Stage::Postprocess(_) => StageKind::Postprocess,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Stage::Preprocess(s) => s.name(),
            Stage::Process(s) => s.name(),
            Stage::Postprocess(s) => s.name(),
        }
    }

    /// Preprocess stage from a closure
    pub fn preprocess<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Frame) -> Result<Frame> + Send + Sync + 'static,
    {
        Stage::Preprocess(Box::new(FnStage { name: name.into(), f }))
    }

    /// Process stage from a closure
    pub fn process<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Frame, &ResultMap) -> Result<ResultMap> + Send + Sync + 'static,
    {
        Stage::Process(Box::new(FnStage { name: name.into(), f }))
    }

    /// Postprocess stage from a closure
    pub fn postprocess<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Frame, &ResultMap) -> Result<()> + Send + Sync + 'static,
    {
        Stage::Postprocess(Box::new(FnStage { name: name.into(), f }))
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self.kind(), self.name())
    }
}

struct FnStage<F> {
    name: String,
    f: F,
}

impl<F> Preprocessor for FnStage<F>
where
    F: Fn(Frame) -> Result<Frame> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn transform(&self, frame: Frame) -> Result<Frame> {
        (self.f)(frame)
    }
}

impl<F> Processor for FnStage<F>
where
    F: Fn(&Frame, &ResultMap) -> Result<ResultMap> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn extract(&self, frame: &Frame, results: &ResultMap) -> Result<ResultMap> {
        (self.f)(frame, results)
    }
}

impl<F> Postprocessor for FnStage<F>
where
    F: Fn(&Frame, &ResultMap) -> Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn act(&self, frame: &Frame, results: &ResultMap) -> Result<()> {
        (self.f)(frame, results)
    }
}

/// Registered stages, split by kind, each list in registration order.
#[derive(Default)]
pub struct StageSet {
    preprocessors: Vec<Box<dyn Preprocessor>>,
    processors: Vec<Box<dyn Processor>>,
    postprocessors: Vec<Box<dyn Postprocessor>>,
}

impl StageSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stage: Stage) {
        match stage {
            Stage::Preprocess(s) => self.preprocessors.push(s),
            Stage::Process(s) => self.processors.push(s),
            Stage::Postprocess(s) => self.postprocessors.push(s),
        }
    }

    pub fn len(&self) -> usize {
        self.preprocessors.len() + self.processors.len() + self.postprocessors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stage names in execution order
    pub fn names(&self) -> Vec<&str> {
        self.preprocessors
            .iter()
            .map(|s| s.name())
            .chain(self.processors.iter().map(|s| s.name()))
            .chain(self.postprocessors.iter().map(|s| s.name()))
            .collect()
    }

    /// Run every stage on `frame`. The first failing stage aborts the pass.
    pub fn run(&self, frame: Frame) -> Result<ProcessedFrame> {
        let started = Instant::now();

        let mut frame = frame;
        for stage in &self.preprocessors {
            frame = stage.transform(frame)?;
        }

        let mut results = ResultMap::new();
        for stage in &self.processors {
            let partial = stage.extract(&frame, &results)?;
            results.extend(partial);
        }

        for stage in &self.postprocessors {
            stage.act(&frame, &results)?;
        }

        Ok(ProcessedFrame {
            frame,
            results,
            latency: started.elapsed(),
        })
    }
}
