//! Background worker units
//!
//! A worker is a long-running unit of work executed on its own named thread
//! by the [`WorkerManager`], which keeps at most one live instance per name.

pub mod manager;
pub mod periodic;

pub use manager::WorkerManager;
pub use periodic::PeriodicWorker;

use anyhow::Result;

use crate::utils::sos::SignalOfStop;

/// A unit of work that runs until it finishes or `sos` is cancelled.
pub trait Worker: Send + Sync + 'static {
    /// Entry point, called once on the worker's own thread.
    ///
    /// Implementations must check `sos` often enough to stop within the
    /// manager's stop timeout.
    fn run(&self, sos: &SignalOfStop) -> Result<()>;

    /// Called on stop after the signal is raised, for units blocked in calls
    /// that never look at the signal.
    fn close(&self) {}
}
