//! Load-aware task dispatch
//!
//! Tasks are queued FIFO and routed one at a time by a single router task:
//! I/O work goes to a bounded blocking pool, compute work to an isolated
//! runtime, and low-latency work runs inline on the router itself. The route
//! is decided per task from the current CPU load, never cached.

pub mod handle;

pub use handle::TaskHandle;

use anyhow::{Context, Result};
use log::{debug, info, trace, warn};
use serde::Serialize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{Semaphore, mpsc};
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::config::DispatchConfig;
use crate::resources::ResourcePool;
use crate::utils::thread::panic_message;

/// Kind of work a task does, fixed at submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Io,
    Compute,
    LowLatency,
}

impl FromStr for TaskCategory {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "io" | "io_bound" => Ok(TaskCategory::Io),
            "cpu" | "gpu" | "compute" | "cpu_bound" | "gpu_bound" => Ok(TaskCategory::Compute),
            "low_latency" | "lowlatency" | "inline" => Ok(TaskCategory::LowLatency),
            other => anyhow::bail!("unknown task category: {other}"),
        }
    }
}

impl std::fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskCategory::Io => write!(f, "io"),
            TaskCategory::Compute => write!(f, "compute"),
            TaskCategory::LowLatency => write!(f, "low_latency"),
        }
    }
}

/// Execution context chosen for one task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    /// Bounded blocking pool; `prefer_threads` is set while load is low
    ThreadPool { prefer_threads: bool },
    /// Isolated compute runtime
    ComputePool,
    /// On the router, before the next task is dequeued
    Inline,
}

/// Routing decision for `category` under the given CPU load.
pub fn route(category: TaskCategory, cpu_percent: f32, cpu_threshold: f32) -> Route {
    match category {
        TaskCategory::Io => Route::ThreadPool {
            prefer_threads: cpu_percent < cpu_threshold,
        },
        TaskCategory::Compute => Route::ComputePool,
        TaskCategory::LowLatency => Route::Inline,
    }
}

/// Failures produced by the dispatcher itself, as opposed to by a task
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatch queue is full")]
    QueueFull,
    #[error("task was cancelled before it ran")]
    Cancelled,
    #[error("task panicked: {0}")]
    Panicked(String),
    #[error("dispatcher is shut down")]
    ShutDown,
}

/// Current CPU load as seen by the router. Must not block.
pub trait LoadProbe: Send + Sync {
    fn cpu_percent(&self) -> f32;
}

impl LoadProbe for ResourcePool {
    fn cpu_percent(&self) -> f32 {
        self.cpu_usage()
    }
}

type Job = Box<dyn FnOnce(Route) + Send + 'static>;

struct Task {
    category: TaskCategory,
    job: Job,
}

struct Runtimes {
    io: Runtime,
    compute: Runtime,
}

pub struct AdaptiveDispatcher {
    config: DispatchConfig,
    queue: mpsc::Sender<Task>,
    token: CancellationToken,
    closed: AtomicBool,
    runtimes: Mutex<Option<Runtimes>>,
}

impl AdaptiveDispatcher {
    pub fn new(config: DispatchConfig, probe: Arc<dyn LoadProbe>) -> Result<Self> {
        let io = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(config.io_workers.max(1))
            .thread_name("dispatch-io")
            .enable_all()
            .build()
            .context("cannot build the I/O dispatch runtime")?;

        let compute = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(config.compute_workers())
            .thread_name("dispatch-compute")
            .enable_all()
            .build()
            .context("cannot build the compute dispatch runtime")?;

        let (queue, rx) = mpsc::channel(config.queue_capacity.max(1));
        let token = CancellationToken::new();

        io.spawn(route_tasks(
            rx,
            token.clone(),
            probe,
            config.cpu_threshold,
            Pools {
                io_slots: Arc::new(Semaphore::new(config.io_workers.max(1))),
                compute_slots: Arc::new(Semaphore::new(config.compute_workers())),
                compute: compute.handle().clone(),
            },
        ));

        info!(
            "Dispatcher ready: {} I/O threads, {} compute threads",
            config.io_workers,
            config.compute_workers()
        );

        Ok(Self {
            config,
            queue,
            token,
            closed: AtomicBool::new(false),
            runtimes: Mutex::new(Some(Runtimes { io, compute })),
        })
    }

    /// Enqueue `task` and return its handle without waiting.
    ///
    /// A full queue or a shut down dispatcher fails the handle right away.
    pub fn submit<T, F>(&self, category: TaskCategory, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (handle, completer) = handle::task_pair::<T>();

        if self.closed.load(Ordering::Acquire) {
            handle.fail(DispatchError::ShutDown);
            return handle;
        }

        let job: Job = Box::new(move |route| {
            completer.set_route(route);
            let outcome = match catch_unwind(AssertUnwindSafe(task)) {
                Ok(outcome) => outcome,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    warn!("Dispatched task panicked: {}", message);
                    Err(DispatchError::Panicked(message).into())
                }
            };
            completer.complete(outcome);
        });

        match self.queue.try_send(Task { category, job }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!("Dispatch queue full, rejecting {} task", category);
                handle.fail(DispatchError::QueueFull);
            }
            Err(TrySendError::Closed(_)) => handle.fail(DispatchError::ShutDown),
        }
        handle
    }

    /// Stop routing, cancel queued tasks and wait up to the shutdown timeout
    /// for running ones. Must not be called from inside an async context.
    pub fn shutdown(&self) {
        let Some(runtimes) = self
            .runtimes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        self.closed.store(true, Ordering::Release);
        self.token.cancel();

        let timeout = self.config.shutdown_timeout();
        runtimes.io.shutdown_timeout(timeout);
        runtimes.compute.shutdown_timeout(timeout);
        info!("Dispatcher shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for AdaptiveDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Free thread slots of both pools. A pooled task holds a permit until it
/// returns, so a saturated pool leaves tasks in the bounded queue.
struct Pools {
    io_slots: Arc<Semaphore>,
    compute_slots: Arc<Semaphore>,
    compute: Handle,
}

/// Router loop: one task at a time, in submission order.
async fn route_tasks(
    mut rx: mpsc::Receiver<Task>,
    token: CancellationToken,
    probe: Arc<dyn LoadProbe>,
    cpu_threshold: f32,
    pools: Pools,
) {
    loop {
        let task = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            task = rx.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };

        let route = route(task.category, probe.cpu_percent(), cpu_threshold);
        trace!("Routing {} task to {:?}", task.category, route);

        let job = task.job;
        let slots = match route {
            Route::Inline => {
                job(route);
                continue;
            }
            Route::ThreadPool { .. } => &pools.io_slots,
            Route::ComputePool => &pools.compute_slots,
        };

        // a task dropped here completes its handle as cancelled
        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            permit = slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let run = move || {
            let _permit = permit;
            job(route)
        };
        match route {
            Route::ComputePool => {
                pools.compute.spawn_blocking(run);
            }
            _ => {
                tokio::task::spawn_blocking(run);
            }
        }
    }

    // Whatever is still queued is dropped with `rx`, cancelling its handles
    rx.close();
}
