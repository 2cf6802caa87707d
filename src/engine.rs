//! Engine orchestration
//!
//! Builds every component from one [`EngineConfig`] and runs the main loop:
//! poll the frame source while the safety gate authorizes action, hand
//! processed frames to the result sink through the dispatcher, and reclaim
//! memory periodically.

use anyhow::Result;
use crossbeam_channel::Receiver;
use log::{info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::capture::FrameSource;
use crate::config::EngineConfig;
use crate::dispatch::{AdaptiveDispatcher, DispatchError, TaskCategory};
use crate::pipeline::{PipelineHealth, ProcessedFrame, Stage, StagePipeline};
use crate::resources::ResourcePool;
use crate::safety::{InputListener, SafetyGate, SafetyInput};
use crate::telemetry::{SystemMetrics, Telemetry, TelemetrySnapshot};
use crate::utils::perf::hybrid_sleep;
use crate::utils::sos::SignalOfStop;
use crate::workers::{PeriodicWorker, Worker, WorkerManager};

const STATS_WORKER: &str = "stats";
const INPUT_WORKER: &str = "safety-input";

/// Consumer of processed frames, called on the dispatcher's I/O pool
pub type ResultSink = Arc<dyn Fn(ProcessedFrame) + Send + Sync>;

/// What one iteration of the engine loop did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Emergency stop latched; nothing is captured until reset
    Halted,
    /// Action not enabled
    Idle,
    /// Source had nothing new
    NoFrame,
    Submitted,
    /// Pipeline input queue full
    Dropped,
}

pub struct EngineBuilder {
    config: EngineConfig,
    telemetry: Arc<Telemetry>,
    resources: Arc<ResourcePool>,
    safety: Arc<SafetyGate>,
    stages: Vec<Stage>,
    sink: Option<ResultSink>,
}

impl EngineBuilder {
    /// Shared telemetry, for stages that time their own work
    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    pub fn resources(&self) -> Arc<ResourcePool> {
        self.resources.clone()
    }

    /// Gate to wrap action-taking stages with
    pub fn safety(&self) -> Arc<SafetyGate> {
        self.safety.clone()
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn on_result(mut self, sink: impl Fn(ProcessedFrame) + Send + Sync + 'static) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    pub fn build(self) -> Result<Engine> {
        let mut pipeline_config = self.config.pipeline.clone();
        // the run loop drains the output queue itself
        pipeline_config.drain_output = false;

        let pipeline = self
            .stages
            .into_iter()
            .fold(
                StagePipeline::builder(pipeline_config, self.telemetry.clone()),
                |builder, stage| builder.stage(stage),
            )
            .build();

        let dispatcher =
            AdaptiveDispatcher::new(self.config.dispatch.clone(), self.resources.clone())?;

        let telemetry = self.telemetry.clone();
        self.safety.on_emergency(move || {
            telemetry.record_error("Emergency stop activated, frame submission halted");
        });

        Ok(Engine {
            workers: WorkerManager::new(self.config.workers.clone()),
            config: self.config,
            telemetry: self.telemetry,
            resources: self.resources,
            safety: self.safety,
            pipeline,
            dispatcher,
            sink: self.sink,
            started: AtomicBool::new(false),
            delivered: Arc::new(AtomicU64::new(0)),
            undelivered: AtomicU64::new(0),
        })
    }
}

pub struct Engine {
    config: EngineConfig,
    telemetry: Arc<Telemetry>,
    resources: Arc<ResourcePool>,
    safety: Arc<SafetyGate>,
    pipeline: StagePipeline,
    dispatcher: AdaptiveDispatcher,
    workers: WorkerManager,
    sink: Option<ResultSink>,
    started: AtomicBool,
    delivered: Arc<AtomicU64>,
    undelivered: AtomicU64,
}

impl Engine {
    pub fn builder(config: EngineConfig, metrics: Arc<dyn SystemMetrics>) -> EngineBuilder {
        let telemetry = Arc::new(Telemetry::new(&config.telemetry, metrics.clone()));
        let resources = Arc::new(ResourcePool::new(
            config.resources.clone(),
            metrics,
            telemetry.clone(),
        ));
        let safety = Arc::new(SafetyGate::new(&config.safety));

        EngineBuilder {
            config,
            telemetry,
            resources,
            safety,
            stages: Vec::new(),
            sink: None,
        }
    }

    /// An engine with no stages and no result sink.
    pub fn new(config: EngineConfig, metrics: Arc<dyn SystemMetrics>) -> Result<Self> {
        Self::builder(config, metrics).build()
    }

    /// Start the background components. Calling it again does nothing.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.resources.start_monitoring()?;
        self.pipeline.start()?;

        let telemetry = self.telemetry.clone();
        let resources = self.resources.clone();
        let health = self.pipeline.health().clone();
        let interval = self.config.engine.stats_interval();
        let stats = PeriodicWorker::new(STATS_WORKER, interval, move || {
            info!("{}", telemetry.snapshot());
            log::debug!("{:?}", resources.system_status());
            if stalled(&health, interval) {
                warn!(
                    "Pipeline stalled: {} frames in flight, none completed in {:?}",
                    health.in_flight(),
                    interval
                );
            }
            Ok(())
        });
        self.workers.start_worker(STATS_WORKER, Arc::new(stats));

        info!(
            "Engine started, stages: {}",
            self.pipeline.stage_names().join(" -> ")
        );
        Ok(())
    }

    /// Apply operator inputs from `inputs` on a worker. An exit input cancels `exit`.
    pub fn listen_for_inputs(&self, inputs: Receiver<SafetyInput>, exit: SignalOfStop) -> bool {
        let listener = InputListener::new(self.safety.clone(), inputs, exit);
        self.workers.start_worker(INPUT_WORKER, Arc::new(listener))
    }

    /// Run an extra named worker alongside the engine, stopped with it.
    pub fn spawn_worker(&self, name: &str, worker: Arc<dyn Worker>) -> bool {
        self.workers.start_worker(name, worker)
    }

    /// One loop iteration: capture and submit a frame if action is authorized.
    pub fn tick(&self, source: &dyn FrameSource) -> TickOutcome {
        if !self.safety.is_safe() {
            return TickOutcome::Halted;
        }
        if !self.safety.is_action_authorized() {
            return TickOutcome::Idle;
        }

        match source.capture_latest() {
            None => TickOutcome::NoFrame,
            Some(frame) => {
                if self.pipeline.submit_frame(frame) {
                    TickOutcome::Submitted
                } else {
                    TickOutcome::Dropped
                }
            }
        }
    }

    /// Hand every ready result to the sink. Returns how many were taken.
    pub fn drain_results(&self) -> usize {
        let mut taken = 0;
        while let Some(processed) = self.pipeline.take_processed_frame() {
            taken += 1;
            let Some(sink) = self.sink.clone() else {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                continue;
            };

            let sequence = processed.frame.sequence;
            let delivered = self.delivered.clone();
            let handle = self.dispatcher.submit(TaskCategory::Io, move || {
                sink(processed);
                delivered.fetch_add(1, Ordering::Relaxed);
                Ok(())
            });

            // a rejected submission is already settled; an accepted one is left to run
            if let Some(Err(e)) = handle.try_take()
                && e.downcast_ref::<DispatchError>().is_some()
            {
                warn!("Result of frame {} not delivered: {}", sequence, e);
                self.undelivered.fetch_add(1, Ordering::Relaxed);
                self.pipeline.health().record_result_drop();
            }
        }
        taken
    }

    /// Loop until `sos` is cancelled, then shut everything down.
    ///
    /// An emergency stop does not end the loop: the engine idles until the
    /// gate is reset.
    pub fn run(&self, source: &dyn FrameSource, sos: &SignalOfStop) -> Result<()> {
        self.start()?;
        info!("Engine main loop running");

        let loop_sleep = self.config.engine.loop_sleep();
        let optimize_interval = self.config.engine.optimize_interval();
        let mut last_optimize = Instant::now();
        let mut halted = false;

        while !sos.cancelled() {
            let outcome = self.tick(source);
            match (outcome, halted) {
                (TickOutcome::Halted, false) => {
                    warn!("Safety violation detected, idling until reset");
                    halted = true;
                }
                (TickOutcome::Halted, true) => {}
                (_, true) => {
                    info!("Safety reset, resuming");
                    halted = false;
                }
                _ => {}
            }

            self.drain_results();

            if last_optimize.elapsed() >= optimize_interval {
                self.resources.optimize();
                last_optimize = Instant::now();
            }

            hybrid_sleep(loop_sleep);
        }

        self.shutdown();
        Ok(())
    }

    /// Stop components in reverse start order. Idempotent.
    pub fn shutdown(&self) {
        if !self.started.swap(false, Ordering::AcqRel) && self.dispatcher.is_shut_down() {
            return;
        }

        info!("Shutting down engine");
        self.workers.stop_all();
        self.pipeline.stop();
        self.drain_results();
        self.dispatcher.shutdown();
        self.resources.stop_monitoring();
        info!("Engine shutdown complete");
    }

    /// Frames are waiting but none completed within `threshold`.
    pub fn pipeline_stalled(&self, threshold: Duration) -> bool {
        stalled(self.pipeline.health(), threshold)
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    /// Results handed to the sink so far
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Results the dispatcher refused, because its queue was full or it was shut down
    pub fn undelivered(&self) -> u64 {
        self.undelivered.load(Ordering::Relaxed)
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    pub fn resources(&self) -> &Arc<ResourcePool> {
        &self.resources
    }

    pub fn safety(&self) -> &Arc<SafetyGate> {
        &self.safety
    }

    pub fn pipeline(&self) -> &StagePipeline {
        &self.pipeline
    }

    pub fn dispatcher(&self) -> &AdaptiveDispatcher {
        &self.dispatcher
    }

    pub fn workers(&self) -> &WorkerManager {
        &self.workers
    }
}

fn stalled(health: &PipelineHealth, threshold: Duration) -> bool {
    health.in_flight() > 0 && health.is_stalled(threshold)
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{LatestFrame, SyntheticSource};
    use crate::config::PipelineConfig;
    use crate::pipeline::{Frame, FrameShape, ResultMap};
    use crate::telemetry::ManualMetrics;

    fn config(queue_capacity: usize) -> EngineConfig {
        EngineConfig {
            pipeline: PipelineConfig {
                queue_capacity,
                poll_timeout_ms: 10,
                ..PipelineConfig::default()
            },
            ..EngineConfig::default()
        }
    }

    fn metrics() -> Arc<ManualMetrics> {
        Arc::new(ManualMetrics::new(20.0, 30.0))
    }

    #[test]
    fn test_tick_follows_safety_state() {
        let engine = Engine::new(config(1), metrics()).unwrap();
        let source = SyntheticSource::new(FrameShape::new(2, 2, 1));

        assert_eq!(engine.tick(&source), TickOutcome::Idle);
        assert_eq!(source.produced(), 0);

        assert!(engine.safety().toggle());
        assert_eq!(engine.tick(&source), TickOutcome::Submitted);
        // pipeline not started: the single queue slot stays taken
        assert_eq!(engine.tick(&source), TickOutcome::Dropped);

        engine.safety().trigger_emergency();
        assert_eq!(engine.tick(&source), TickOutcome::Halted);

        engine.safety().reset_emergency();
        assert_eq!(engine.tick(&source), TickOutcome::Idle);
    }

    #[test]
    fn test_tick_without_frame() {
        let engine = Engine::new(config(4), metrics()).unwrap();
        engine.safety().toggle();

        let slot = LatestFrame::new();
        assert_eq!(engine.tick(&slot), TickOutcome::NoFrame);
        slot.store(Frame::blank(FrameShape::new(1, 1, 1), 0));
        assert_eq!(engine.tick(&slot), TickOutcome::Submitted);
        assert_eq!(engine.tick(&slot), TickOutcome::NoFrame);
    }

    #[test]
    fn test_results_reach_sink() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let builder = Engine::builder(config(4), metrics());
        let engine = builder
            .stage(Stage::process("mark", |f, _| {
                let mut out = ResultMap::new();
                out.insert("sequence".into(), f.sequence.into());
                Ok(out)
            }))
            .on_result(move |processed| {
                tx.send(processed.results).ok();
            })
            .build()
            .unwrap();
        engine.start().unwrap();
        engine.safety().toggle();

        let source = SyntheticSource::new(FrameShape::new(2, 2, 1));
        assert_eq!(engine.tick(&source), TickOutcome::Submitted);

        let deadline = Instant::now() + Duration::from_secs(2);
        while engine.delivered() == 0 && Instant::now() < deadline {
            engine.drain_results();
            std::thread::sleep(Duration::from_millis(5));
        }

        let results = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(results["sequence"], 0);
        assert_eq!(engine.delivered(), 1);
        engine.shutdown();
        assert!(engine.dispatcher().is_shut_down());
    }

    #[test]
    fn test_rejected_results_are_counted() {
        let builder = Engine::builder(config(4), metrics());
        let engine = builder.on_result(|_| {}).build().unwrap();
        engine.start().unwrap();
        engine.safety().toggle();
        engine.dispatcher().shutdown();

        let source = SyntheticSource::new(FrameShape::new(2, 2, 1));
        assert_eq!(engine.tick(&source), TickOutcome::Submitted);

        let deadline = Instant::now() + Duration::from_secs(2);
        while engine.undelivered() == 0 && Instant::now() < deadline {
            engine.drain_results();
            std::thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(engine.undelivered(), 1);
        assert_eq!(engine.delivered(), 0);
        assert_eq!(engine.pipeline().health().result_drops(), 1);
    }

    #[test]
    fn test_stall_needs_waiting_frames() {
        let engine = Engine::new(config(4), metrics()).unwrap();
        engine.safety().toggle();
        std::thread::sleep(Duration::from_millis(30));
        assert!(!engine.pipeline_stalled(Duration::from_millis(10)));

        // pipeline not started: the frame waits in the input queue
        let source = SyntheticSource::new(FrameShape::new(2, 2, 1));
        assert_eq!(engine.tick(&source), TickOutcome::Submitted);
        assert!(engine.pipeline_stalled(Duration::from_millis(10)));
        assert!(!engine.pipeline_stalled(Duration::from_secs(60)));
    }

    #[test]
    fn test_run_stops_on_signal() {
        let engine = Arc::new(Engine::new(config(4), metrics()).unwrap());
        let sos = SignalOfStop::new();

        let runner = {
            let engine = engine.clone();
            let sos = sos.clone();
            std::thread::spawn(move || {
                let source = SyntheticSource::new(FrameShape::new(4, 4, 1));
                engine.run(&source, &sos)
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        engine.safety().toggle();
        std::thread::sleep(Duration::from_millis(100));
        sos.cancel();

        runner.join().unwrap().unwrap();
        assert!(engine.delivered() > 0);
        assert!(!engine.pipeline().is_running());
        assert!(engine.workers().running_workers().is_empty());
        assert!(!engine.resources().is_monitoring());
    }
}
