use anyhow::Result;
use std::time::Duration;

use super::Worker;
use crate::utils::sos::SignalOfStop;

/// Calls `tick` every `interval` until stopped.
///
/// A failing tick is logged and the loop carries on with the next one.
pub struct PeriodicWorker<F> {
    name: String,
    interval: Duration,
    tick: F,
}

impl<F> PeriodicWorker<F>
where
    F: Fn() -> Result<()> + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, interval: Duration, tick: F) -> Self {
        Self {
            name: name.into(),
            interval,
            tick,
        }
    }
}

impl<F> Worker for PeriodicWorker<F>
where
    F: Fn() -> Result<()> + Send + Sync + 'static,
{
    fn run(&self, sos: &SignalOfStop) -> Result<()> {
        while !sos.wait_timeout(self.interval) {
            if let Err(e) = (self.tick)() {
                log::warn!("Periodic task {} failed: {:#}", self.name, e);
            }
        }
        Ok(())
    }
}
