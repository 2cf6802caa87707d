//! Stage pipeline coordinator
//!
//! Owns the bounded input and output queues and two scheduling units: the
//! processor, which runs every frame through the registered stages, and the
//! drainer, which keeps the output queue from filling up when nobody polls it.

use anyhow::Result;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{error, info, warn};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::config::PipelineConfig;
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::stage::{Stage, StageSet};
use crate::pipeline::state::PipelineState;
use crate::pipeline::types::{Frame, ProcessedFrame};
use crate::telemetry::{Category, Telemetry};
use crate::utils::sos::SignalOfStop;
use crate::utils::thread::{ContextHandle, panic_message};

/// Collects stages before the pipeline is built. Stages are frozen afterwards.
pub struct PipelineBuilder {
    config: PipelineConfig,
    telemetry: Arc<Telemetry>,
    stages: StageSet,
}

impl PipelineBuilder {
    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn build(self) -> StagePipeline {
        let capacity = self.config.queue_capacity.max(1);
        let (input_tx, input_rx) = crossbeam_channel::bounded(capacity);
        let (output_tx, output_rx) = crossbeam_channel::bounded(capacity);

        StagePipeline {
            config: self.config,
            capacity,
            stages: Arc::new(self.stages),
            telemetry: self.telemetry,
            health: Arc::new(PipelineHealth::new()),
            input_tx,
            input_rx,
            output_tx,
            output_rx,
            control: Mutex::new(Control {
                state: PipelineState::Idle,
                sos: None,
                units: Vec::new(),
            }),
        }
    }
}

struct Control {
    state: PipelineState,
    sos: Option<SignalOfStop>,
    units: Vec<ContextHandle>,
}

/// Everything a processor unit needs, cloned out of the pipeline.
struct ProcessorUnit {
    stages: Arc<StageSet>,
    telemetry: Arc<Telemetry>,
    health: Arc<PipelineHealth>,
    input: Receiver<Frame>,
    output: Sender<ProcessedFrame>,
    config: PipelineConfig,
}

impl ProcessorUnit {
    fn run(self, sos: SignalOfStop) {
        let poll = self.config.poll_timeout();

        while !sos.cancelled() {
            let frame = match self.input.recv_timeout(poll) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            self.process(frame);
        }
    }

    fn process(&self, frame: Frame) {
        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| self.stages.run(frame)));

        let failure = match outcome {
            Ok(Ok(processed)) => {
                self.telemetry
                    .record_duration(Category::Processing, started.elapsed());
                self.health.record_frame();
                if let Err(TrySendError::Full(_)) = self.output.try_send(processed) {
                    self.health.record_result_drop();
                }
                return;
            }
            Ok(Err(e)) => format!("{:#}", e),
            Err(payload) => format!("stage panicked: {}", panic_message(payload.as_ref())),
        };

        self.health.record_stage_failure();
        error!("Pipeline error: {}", failure);
        self.telemetry.record_error(format!("Pipeline error: {}", failure));
    }
}

fn drain(
    output: Receiver<ProcessedFrame>,
    health: Arc<PipelineHealth>,
    config: PipelineConfig,
    sos: SignalOfStop,
) {
    let poll = config.poll_timeout();

    while !sos.cancelled() {
        match output.recv_timeout(poll) {
            Ok(_) => health.record_drained(),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Bounded producer → processor → consumer frame pipeline.
pub struct StagePipeline {
    config: PipelineConfig,
    capacity: usize,
    stages: Arc<StageSet>,
    telemetry: Arc<Telemetry>,
    health: Arc<PipelineHealth>,
    input_tx: Sender<Frame>,
    input_rx: Receiver<Frame>,
    output_tx: Sender<ProcessedFrame>,
    output_rx: Receiver<ProcessedFrame>,
    control: Mutex<Control>,
}

impl StagePipeline {
    pub fn builder(config: PipelineConfig, telemetry: Arc<Telemetry>) -> PipelineBuilder {
        PipelineBuilder {
            config,
            telemetry,
            stages: StageSet::new(),
        }
    }

    /// Offer a frame without blocking. Returns `false` and drops the frame if
    /// the input queue is full.
    pub fn submit_frame(&self, frame: Frame) -> bool {
        match self.input_tx.try_send(frame) {
            Ok(()) => {
                self.health.record_submission();
                self.telemetry.record_frame_submission();
                true
            }
            Err(_) => {
                self.health.record_frame_drop();
                self.telemetry.record_frame_drop();
                false
            }
        }
    }

    /// Next processed frame, if one is ready.
    pub fn take_processed_frame(&self) -> Option<ProcessedFrame> {
        self.output_rx.try_recv().ok()
    }

    /// Spawn the scheduling units. Starting a running pipeline does nothing.
    pub fn start(&self) -> Result<()> {
        let mut control = self.control();
        if !control.state.can_start() {
            return Ok(());
        }

        let sos = SignalOfStop::new();
        let processor = ProcessorUnit {
            stages: self.stages.clone(),
            telemetry: self.telemetry.clone(),
            health: self.health.clone(),
            input: self.input_rx.clone(),
            output: self.output_tx.clone(),
            config: self.config.clone(),
        };
        let unit_sos = sos.clone();
        let mut units = vec![ContextHandle::spawn("pipeline-processor", move || {
            processor.run(unit_sos)
        })?];

        if self.config.drain_output {
            let output = self.output_rx.clone();
            let health = self.health.clone();
            let config = self.config.clone();
            let unit_sos = sos.clone();
            match ContextHandle::spawn("pipeline-drain", move || {
                drain(output, health, config, unit_sos)
            }) {
                Ok(handle) => units.push(handle),
                Err(e) => {
                    sos.cancel();
                    Self::join_units(units, &self.config);
                    return Err(e);
                }
            }
        }

        control.sos = Some(sos);
        control.units = units;
        control.state = PipelineState::Running {
            since: Instant::now(),
        };
        info!("Stage pipeline started with {} stages", self.stages.len());
        Ok(())
    }

    /// Signal the units and wait for each up to the join timeout.
    ///
    /// Stopping is best-effort: a unit stuck inside a stage is logged and
    /// detached, and keeps running until that stage returns.
    pub fn stop(&self) {
        let mut control = self.control();
        if !control.state.is_running() {
            return;
        }

        let uptime = control.state.uptime().unwrap_or_default();
        control.state = PipelineState::Stopping;
        if let Some(sos) = control.sos.take() {
            sos.cancel();
        }
        let units = std::mem::take(&mut control.units);
        Self::join_units(units, &self.config);

        control.state = PipelineState::Stopped;
        info!(
            "Stage pipeline stopped after {:?}: {}",
            uptime,
            self.health.summary()
        );
    }

    fn join_units(units: Vec<ContextHandle>, config: &PipelineConfig) {
        for unit in units {
            let name = unit.name().to_string();
            if !unit.join_timeout(config.join_timeout()) {
                warn!("Pipeline unit {} did not stop within {:?}", name, config.join_timeout());
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.control().state.is_running()
    }

    pub fn state(&self) -> PipelineState {
        self.control().state
    }

    /// Frames waiting in the input queue
    pub fn queue_len(&self) -> usize {
        self.input_rx.len()
    }

    /// Results waiting in the output queue
    pub fn output_len(&self) -> usize {
        self.output_rx.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn health(&self) -> &Arc<PipelineHealth> {
        &self.health
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.names()
    }

    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for StagePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TelemetryConfig;
    use crate::pipeline::types::{FrameShape, ResultMap};
    use crate::telemetry::ManualMetrics;
    use serde_json::json;
    use std::thread;
    use std::time::Duration;

    fn telemetry() -> Arc<Telemetry> {
        Arc::new(Telemetry::new(
            &TelemetryConfig::default(),
            Arc::new(ManualMetrics::new(0.0, 0.0)),
        ))
    }

    fn config(capacity: usize, drain_output: bool) -> PipelineConfig {
        PipelineConfig {
            queue_capacity: capacity,
            poll_timeout_ms: 10,
            join_timeout_ms: 500,
            drain_output,
        }
    }

    fn frame(sequence: u64) -> Frame {
        Frame::blank(FrameShape::new(2, 2, 1), sequence)
    }

    fn wait_for(mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_submit_drops_when_full() {
        let telemetry = telemetry();
        let pipeline = StagePipeline::builder(config(2, false), telemetry.clone()).build();

        assert!(pipeline.submit_frame(frame(0)));
        assert!(pipeline.submit_frame(frame(1)));
        assert!(!pipeline.submit_frame(frame(2)));

        assert_eq!(pipeline.queue_len(), 2);
        assert_eq!(pipeline.health().frame_drops(), 1);
        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.frames_dropped, 1);
        assert_eq!(snapshot.frames_processed, 2);
    }

    #[test]
    fn test_take_processed_frame_when_empty() {
        let pipeline = StagePipeline::builder(config(2, false), telemetry()).build();
        assert!(pipeline.take_processed_frame().is_none());
    }

    #[test]
    fn test_frames_flow_through_stages_in_order() {
        let pipeline = StagePipeline::builder(config(4, false), telemetry())
            .stage(Stage::preprocess("fill", |f: Frame| {
                Ok(f.map_pixels(|px| px.fill(5)))
            }))
            .stage(Stage::process("sum", |f, _| {
                let mut out = ResultMap::new();
                let sum: u64 = f.data.iter().map(|b| *b as u64).sum();
                out.insert("sum".into(), json!(sum));
                Ok(out)
            }))
            .build();
        pipeline.start().unwrap();

        assert!(pipeline.submit_frame(frame(1)));
        assert!(pipeline.submit_frame(frame(2)));

        let mut seen = Vec::new();
        assert!(wait_for(|| {
            if let Some(processed) = pipeline.take_processed_frame() {
                seen.push(processed);
            }
            seen.len() == 2
        }));

        assert_eq!(seen[0].frame.sequence, 1);
        assert_eq!(seen[1].frame.sequence, 2);
        assert_eq!(seen[0].results["sum"], json!(20));
        assert_eq!(pipeline.health().frames_processed(), 2);
        pipeline.stop();
    }

    #[test]
    fn test_failing_pass_does_not_stop_the_loop() {
        let telemetry = telemetry();
        let pipeline = StagePipeline::builder(config(4, false), telemetry.clone())
            .stage(Stage::process("picky", |f, _| match f.sequence {
                0 => anyhow::bail!("bad frame"),
                1 => panic!("worse frame"),
                _ => Ok(ResultMap::new()),
            }))
            .build();
        pipeline.start().unwrap();

        for sequence in 0..3 {
            assert!(pipeline.submit_frame(frame(sequence)));
        }

        let mut processed = None;
        assert!(wait_for(|| {
            processed = pipeline.take_processed_frame();
            processed.is_some()
        }));
        assert_eq!(processed.map(|p| p.frame.sequence), Some(2));
        assert!(pipeline.is_running());
        assert_eq!(pipeline.health().stage_failures(), 2);

        let errors = telemetry.snapshot().recent_errors;
        assert_eq!(errors.len(), 2);
        assert!(errors[0].ends_with("Pipeline error: bad frame"));
        assert!(errors[1].contains("Pipeline error: stage panicked: worse frame"));
        pipeline.stop();
    }

    #[test]
    fn test_start_stop_idempotent_and_restartable() {
        let pipeline = StagePipeline::builder(config(2, true), telemetry()).build();
        assert_eq!(pipeline.state(), PipelineState::Idle);

        pipeline.stop();
        assert_eq!(pipeline.state(), PipelineState::Idle);

        pipeline.start().unwrap();
        pipeline.start().unwrap();
        assert!(pipeline.is_running());

        pipeline.stop();
        pipeline.stop();
        assert_eq!(pipeline.state(), PipelineState::Stopped);

        pipeline.start().unwrap();
        assert!(pipeline.is_running());
        pipeline.stop();
    }

    #[test]
    fn test_drain_keeps_output_bounded() {
        let pipeline = StagePipeline::builder(config(2, true), telemetry()).build();
        pipeline.start().unwrap();

        let mut accepted = 0;
        for sequence in 0..20 {
            if pipeline.submit_frame(frame(sequence)) {
                accepted += 1;
            }
            thread::sleep(Duration::from_millis(5));
        }

        assert!(wait_for(|| pipeline.health().frames_drained() == accepted));
        assert_eq!(pipeline.output_len(), 0);
        assert_eq!(pipeline.health().result_drops(), 0);
        pipeline.stop();
    }

    #[test]
    fn test_full_output_drops_results() {
        let pipeline = StagePipeline::builder(config(1, false), telemetry()).build();
        pipeline.start().unwrap();

        assert!(pipeline.submit_frame(frame(0)));
        assert!(wait_for(|| pipeline.output_len() == 1));
        assert!(pipeline.submit_frame(frame(1)));
        assert!(wait_for(|| pipeline.health().result_drops() == 1));

        assert_eq!(pipeline.take_processed_frame().map(|p| p.frame.sequence), Some(0));
        pipeline.stop();
    }

    #[test]
    fn test_stop_is_bounded_with_stuck_stage() {
        let mut config = config(2, false);
        config.join_timeout_ms = 50;
        let pipeline = StagePipeline::builder(config, telemetry())
            .stage(Stage::process("slow", |_, _| {
                thread::sleep(Duration::from_millis(600));
                Ok(ResultMap::new())
            }))
            .build();
        pipeline.start().unwrap();
        pipeline.submit_frame(frame(0));
        assert!(wait_for(|| pipeline.queue_len() == 0));

        let started = Instant::now();
        pipeline.stop();
        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(pipeline.state(), PipelineState::Stopped);
    }
}
