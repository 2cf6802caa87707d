use anyhow::Result;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::traits::FrameSource;
use crate::pipeline::Frame;
use crate::utils::sos::SignalOfStop;
use crate::workers::Worker;

/// Single-slot mailbox holding the newest captured frame.
///
/// Storing overwrites whatever was not picked up yet, so a slow reader only
/// ever sees the freshest frame.
#[derive(Default)]
pub struct LatestFrame {
    slot: Mutex<Option<Frame>>,
}

impl LatestFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `frame`, returning `true` if it replaced one never taken.
    pub fn store(&self, frame: Frame) -> bool {
        self.lock().replace(frame).is_some()
    }

    pub fn take(&self) -> Option<Frame> {
        self.lock().take()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_none()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Frame>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FrameSource for LatestFrame {
    fn capture_latest(&self) -> Option<Frame> {
        self.take()
    }
}

/// Worker polling a source at a fixed rate into a [`LatestFrame`] slot.
pub struct CaptureWorker<S> {
    source: S,
    slot: Arc<LatestFrame>,
    interval: Duration,
}

impl<S: FrameSource + 'static> CaptureWorker<S> {
    pub fn new(source: S, slot: Arc<LatestFrame>, fps: u32) -> Self {
        Self {
            source,
            slot,
            interval: Duration::from_nanos(1_000_000_000 / fps.max(1) as u64),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl<S: FrameSource + 'static> Worker for CaptureWorker<S> {
    fn run(&self, sos: &SignalOfStop) -> Result<()> {
        let mut overwritten = 0u64;
        loop {
            if let Some(frame) = self.source.capture_latest()
                && self.slot.store(frame)
            {
                overwritten += 1;
            }
            if sos.wait_timeout(self.interval) {
                break;
            }
        }
        log::debug!("Capture stopped, {} frames never picked up", overwritten);
        Ok(())
    }
}
