//! Named background execution contexts with deadline-bounded joins.

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::any::Any;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Handle to a named OS thread.
///
/// `std` offers no timed join, so each context carries the receiving half of a
/// zero-capacity channel whose sender lives on the thread's stack. The sender is
/// dropped when the thread ends (normally or by unwinding), which disconnects
/// the channel and lets [`ContextHandle::join_timeout`] observe the exit.
pub struct ContextHandle {
    name: String,
    handle: Option<JoinHandle<()>>,
    exited: Receiver<()>,
}

impl ContextHandle {
    /// Spawns `body` on a new thread called `name`.
    pub fn spawn<F>(name: impl Into<String>, body: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let (exit_tx, exited) = crossbeam_channel::bounded::<()>(0);

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _exit_guard = exit_tx;
                body();
            })
            .with_context(|| format!("failed to spawn thread {name}"))?;

        Ok(Self {
            name,
            handle: Some(handle),
            exited,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Point-in-time liveness check.
    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Waits up to `timeout` for the thread to end.
    ///
    /// Returns `false` if the deadline passed; the thread is then detached and
    /// keeps winding down on its own.
    pub fn join_timeout(mut self, timeout: Duration) -> bool {
        match self.exited.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => false,
            // Nobody ever sends on the exit channel: any other outcome means the
            // sender was dropped, i.e. the thread has left its body.
            _ => {
                if let Some(handle) = self.handle.take()
                    && let Err(payload) = handle.join()
                {
                    log::error!(
                        "Context {} panicked: {}",
                        self.name,
                        panic_message(payload.as_ref())
                    );
                }
                true
            }
        }
    }
}

impl std::fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextHandle")
            .field("name", &self.name)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
