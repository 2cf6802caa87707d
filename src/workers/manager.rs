use log::{error, info, warn};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::Worker;
use crate::config::WorkerConfig;
use crate::utils::sos::SignalOfStop;
use crate::utils::thread::{ContextHandle, panic_message};

struct Record {
    /// Generation id, unique for the manager's lifetime
    id: u64,
    sos: SignalOfStop,
    handle: ContextHandle,
    worker: Arc<dyn Worker>,
}

#[derive(Default)]
struct Registry {
    records: HashMap<String, Record>,
    next_id: u64,
}

struct Inner {
    config: WorkerConfig,
    registry: Mutex<Registry>,
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exit path of a worker thread: drop the record only if it is still ours.
    fn remove_own(&self, name: &str, id: u64) {
        let mut registry = self.registry();
        if registry.records.get(name).is_some_and(|r| r.id == id) {
            registry.records.remove(name);
        }
    }
}

/// Starts and stops named workers.
///
/// The registry lock is only held to read or mutate records, never while
/// waiting for a thread, so a worker's exit path cannot be blocked by a stop
/// in progress.
pub struct WorkerManager {
    inner: Arc<Inner>,
}

impl WorkerManager {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    /// Launch `worker` under `name`.
    ///
    /// Returns `false` if a worker with that name is still alive. A record
    /// left behind by a dead worker is replaced.
    pub fn start_worker(&self, name: &str, worker: Arc<dyn Worker>) -> bool {
        let mut registry = self.inner.registry();

        if let Some(existing) = registry.records.get(name) {
            if existing.handle.is_alive() {
                warn!("Worker {} is already running", name);
                return false;
            }
            registry.records.remove(name);
        }

        let id = registry.next_id;
        registry.next_id += 1;

        let sos = SignalOfStop::new();
        let thread_sos = sos.clone();
        let thread_worker = worker.clone();
        let inner = self.inner.clone();
        let thread_name = name.to_string();

        // The exit path needs the registry lock, so it cannot run before the
        // record below is inserted.
        let spawned = ContextHandle::spawn(format!("worker-{name}"), move || {
            let outcome = catch_unwind(AssertUnwindSafe(|| thread_worker.run(&thread_sos)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Worker {} error: {:#}", thread_name, e),
                Err(payload) => error!(
                    "Worker {} panicked: {}",
                    thread_name,
                    panic_message(payload.as_ref())
                ),
            }
            inner.remove_own(&thread_name, id);
        });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                error!("Cannot start worker {}: {:#}", name, e);
                return false;
            }
        };

        registry.records.insert(
            name.to_string(),
            Record {
                id,
                sos,
                handle,
                worker,
            },
        );
        info!("Started worker: {}", name);
        true
    }

    /// Signal the worker and wait up to the stop timeout for it to end.
    ///
    /// Returns `false` if no worker is registered under `name`. The record is
    /// removed even when the deadline passes, so the underlying thread may
    /// still be winding down after this returns.
    pub fn stop_worker(&self, name: &str) -> bool {
        let Some(record) = self.inner.registry().records.remove(name) else {
            return false;
        };

        Self::stop_record(name, record, &self.inner.config);
        true
    }

    fn stop_record(name: &str, record: Record, config: &WorkerConfig) {
        record.sos.cancel();
        record.worker.close();

        if record.handle.join_timeout(config.stop_timeout()) {
            info!("Stopped worker: {}", name);
        } else {
            warn!("Worker {} didn't stop gracefully", name);
        }
    }

    /// Point-in-time liveness check.
    pub fn is_running(&self, name: &str) -> bool {
        self.inner
            .registry()
            .records
            .get(name)
            .is_some_and(|r| r.handle.is_alive())
    }

    /// Names of live workers, in start order.
    pub fn running_workers(&self) -> Vec<String> {
        let registry = self.inner.registry();
        let mut live: Vec<(u64, String)> = registry
            .records
            .iter()
            .filter(|(_, r)| r.handle.is_alive())
            .map(|(name, r)| (r.id, name.clone()))
            .collect();
        live.sort_unstable();
        live.into_iter().map(|(_, name)| name).collect()
    }

    /// Stop every tracked worker in start order.
    pub fn stop_all(&self) {
        let mut records: Vec<(String, Record)> =
            self.inner.registry().records.drain().collect();
        records.sort_unstable_by_key(|(_, r)| r.id);

        for (name, record) in records {
            Self::stop_record(&name, record, &self.inner.config);
        }
    }
}

impl Drop for WorkerManager {
    fn drop(&mut self) {
        self.stop_all();
    }
}
