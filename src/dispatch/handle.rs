use anyhow::{Result, anyhow};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::{DispatchError, Route};

struct SlotState<T> {
    outcome: Option<Result<T>>,
    finished: bool,
    route: Option<Route>,
}

struct Slot<T> {
    state: Mutex<SlotState<T>>,
    ready: Condvar,
}

impl<T> Slot<T> {
    fn lock(&self) -> MutexGuard<'_, SlotState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// First write wins; later ones are ignored.
    fn fill(&self, outcome: Result<T>) {
        let mut state = self.lock();
        if state.finished {
            return;
        }
        state.outcome = Some(outcome);
        state.finished = true;
        self.ready.notify_all();
    }
}

/// Future-like handle to a dispatched task's outcome.
///
/// Dispatcher failures are [`DispatchError`] values inside the returned
/// `anyhow::Error` and can be recovered with `downcast_ref`.
pub struct TaskHandle<T> {
    slot: Arc<Slot<T>>,
}

impl<T> TaskHandle<T> {
    /// Block until the task completes.
    pub fn wait(self) -> Result<T> {
        let mut state = self.slot.lock();
        while !state.finished {
            state = self
                .slot
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state
            .outcome
            .take()
            .unwrap_or_else(|| Err(anyhow!("task outcome already taken")))
    }

    /// Wait up to `timeout`; `None` if the task is still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.slot.lock();
        while !state.finished {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .slot
                .ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        state.outcome.take()
    }

    /// Take the outcome if the task has completed.
    pub fn try_take(&self) -> Option<Result<T>> {
        self.slot.lock().outcome.take()
    }

    pub fn is_finished(&self) -> bool {
        self.slot.lock().finished
    }

    /// Where the task was routed, once the dispatcher has dequeued it.
    pub fn route(&self) -> Option<Route> {
        self.slot.lock().route
    }

    pub(super) fn fail(&self, error: DispatchError) {
        self.slot.fill(Err(error.into()));
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.slot.lock();
        f.debug_struct("TaskHandle")
            .field("finished", &state.finished)
            .field("route", &state.route)
            .finish()
    }
}

/// Producer side of a [`TaskHandle`]. Dropping it before completing fails the
/// handle with [`DispatchError::Cancelled`].
pub(super) struct Completer<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Completer<T> {
    pub(super) fn set_route(&self, route: Route) {
        self.slot.lock().route = Some(route);
    }

    pub(super) fn complete(self, outcome: Result<T>) {
        self.slot.fill(outcome);
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        self.slot.fill(Err(DispatchError::Cancelled.into()));
    }
}

pub(super) fn task_pair<T>() -> (TaskHandle<T>, Completer<T>) {
    let slot = Arc::new(Slot {
        state: Mutex::new(SlotState {
            outcome: None,
            finished: false,
            route: None,
        }),
        ready: Condvar::new(),
    });
    (TaskHandle { slot: slot.clone() }, Completer { slot })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_complete_wakes_waiter() {
        let (handle, completer) = task_pair::<u32>();
        assert!(!handle.is_finished());
        assert!(handle.wait_timeout(Duration::from_millis(10)).is_none());

        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            completer.set_route(Route::Inline);
            completer.complete(Ok(7));
        });

        assert_eq!(handle.wait_timeout(Duration::from_secs(2)).unwrap().unwrap(), 7);
        assert!(handle.is_finished());
        assert_eq!(handle.route(), Some(Route::Inline));
        assert!(handle.try_take().is_none());
    }

    #[test]
    fn test_dropped_completer_cancels() {
        let (handle, completer) = task_pair::<u32>();
        drop(completer);

        let err = handle.wait().unwrap_err();
        assert_eq!(err.downcast_ref::<DispatchError>(), Some(&DispatchError::Cancelled));
    }

    #[test]
    fn test_first_outcome_wins() {
        let (handle, completer) = task_pair::<u32>();
        handle.fail(DispatchError::QueueFull);
        completer.complete(Ok(1));

        let err = handle.try_take().unwrap().unwrap_err();
        assert_eq!(err.downcast_ref::<DispatchError>(), Some(&DispatchError::QueueFull));
    }
}
