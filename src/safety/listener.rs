use anyhow::Result;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;

use super::{SafetyGate, SafetyInput};
use crate::pipeline::{Frame, Postprocessor, ResultMap};
use crate::utils::sos::SignalOfStop;
use crate::workers::Worker;

const INPUT_POLL: Duration = Duration::from_millis(50);

/// Worker applying operator inputs to a gate.
///
/// [`SafetyInput::Exit`] latches the emergency stop, then cancels `exit` so
/// the owner can shut down.
pub struct InputListener {
    gate: Arc<SafetyGate>,
    inputs: Receiver<SafetyInput>,
    exit: SignalOfStop,
}

impl InputListener {
    pub fn new(gate: Arc<SafetyGate>, inputs: Receiver<SafetyInput>, exit: SignalOfStop) -> Self {
        Self { gate, inputs, exit }
    }
}

impl Worker for InputListener {
    fn run(&self, sos: &SignalOfStop) -> Result<()> {
        while !sos.cancelled() {
            match self.inputs.recv_timeout(INPUT_POLL) {
                Ok(SafetyInput::Exit) => {
                    info!("Exit triggered by operator input");
                    self.gate.apply(SafetyInput::Exit);
                    self.exit.cancel();
                    break;
                }
                Ok(input) => {
                    if !self.gate.apply(input) {
                        debug!("{:?} ignored in state {}", input, self.gate.state());
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("Safety input source closed");
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Postprocessor that only acts while the gate authorizes action.
pub struct Gated<P> {
    gate: Arc<SafetyGate>,
    inner: P,
}

impl<P: Postprocessor> Gated<P> {
    pub fn new(gate: Arc<SafetyGate>, inner: P) -> Self {
        Self { gate, inner }
    }
}

impl<P: Postprocessor> Postprocessor for Gated<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn act(&self, frame: &Frame, results: &ResultMap) -> Result<()> {
        if self.gate.is_action_authorized() {
            self.inner.act(frame, results)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SafetyConfig, WorkerConfig};
    use crate::pipeline::FrameShape;
    use crate::safety::SafetyState;
    use crate::workers::WorkerManager;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counting(Arc<AtomicU32>);

    impl Postprocessor for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn act(&self, _frame: &Frame, _results: &ResultMap) -> Result<()> {
            self.0.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    #[test]
    fn test_gated_acts_only_when_authorized() {
        let gate = Arc::new(SafetyGate::new(&SafetyConfig::default()));
        let acted = Arc::new(AtomicU32::new(0));
        let gated = Gated::new(gate.clone(), Counting(acted.clone()));
        let frame = Frame::blank(FrameShape::new(1, 1, 1), 0);
        let results = ResultMap::new();

        gated.act(&frame, &results).unwrap();
        assert_eq!(acted.load(Ordering::Relaxed), 0);

        gate.toggle();
        gated.act(&frame, &results).unwrap();
        assert_eq!(acted.load(Ordering::Relaxed), 1);

        gate.trigger_emergency();
        gated.act(&frame, &results).unwrap();
        assert_eq!(acted.load(Ordering::Relaxed), 1);
        assert_eq!(gated.name(), "counting");
    }

    #[test]
    fn test_listener_applies_inputs_and_exits() {
        let gate = Arc::new(SafetyGate::new(&SafetyConfig::default()));
        let (tx, rx) = crossbeam_channel::unbounded();
        let exit = SignalOfStop::new();
        let manager = WorkerManager::new(WorkerConfig::default());

        manager.start_worker(
            "safety-input",
            Arc::new(InputListener::new(gate.clone(), rx, exit.clone())),
        );

        tx.send(SafetyInput::Toggle).unwrap();
        tx.send(SafetyInput::Exit).unwrap();

        assert!(exit.wait_timeout(Duration::from_secs(2)));
        assert_eq!(gate.state(), SafetyState::EmergencyStopped);
        manager.stop_all();
    }
}
