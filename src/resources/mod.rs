//! Buffer cache and host pressure tracking
//!
//! [`ResourcePool`] hands out keyed, reusable buffers and reclaims them when
//! host memory gets tight. A background monitor keeps a cached view of CPU,
//! memory and temperature so that load-dependent decisions never have to wait
//! on a fresh sample.

pub mod buffer;
mod monitor;

pub use buffer::{Buffer, BufferLayout, ElementType};

use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::ResourceConfig;
use crate::telemetry::{SystemMetrics, Telemetry};
use crate::utils::sos::SignalOfStop;
use crate::utils::thread::ContextHandle;

/// Outcome of [`ResourcePool::optimize`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reclamation {
    /// Memory below the high-water mark
    None,
    /// Above high-water: buffers with no outstanding handle were evicted
    Soft { evicted: usize },
    /// Above the critical mark: the whole cache was evicted
    Critical { evicted: usize },
}

/// Host and cache figures reported by [`ResourcePool::system_status`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStatus {
    pub memory_usage: f32,
    pub cpu_usage: f32,
    pub temperature: Option<f32>,
    pub buffer_count: usize,
    pub allocations: u64,
    pub deallocations: u64,
}

#[derive(Default)]
struct Cache {
    buffers: HashMap<String, Buffer>,
    allocations: u64,
    deallocations: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct HostSample {
    cpu: f32,
    memory: f32,
    temperature: Option<f32>,
}

pub(crate) struct Shared {
    config: ResourceConfig,
    metrics: Arc<dyn SystemMetrics>,
    telemetry: Arc<Telemetry>,
    cache: Mutex<Cache>,
    host: Mutex<HostSample>,
}

impl Shared {
    fn cache(&self) -> MutexGuard<'_, Cache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn host(&self) -> MutexGuard<'_, HostSample> {
        self.host.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a fresh host sample. Blocks for the provider's CPU interval.
    fn sample(&self) -> Result<()> {
        let cpu = self.metrics.cpu_percent()?;
        let memory = self.metrics.memory_percent()?;
        let temperature = self.metrics.temperature();

        *self.host() = HostSample {
            cpu,
            memory,
            temperature,
        };
        Ok(())
    }
}

struct Monitor {
    sos: SignalOfStop,
    handle: ContextHandle,
}

pub struct ResourcePool {
    shared: Arc<Shared>,
    monitor: Mutex<Option<Monitor>>,
}

impl ResourcePool {
    pub fn new(
        config: ResourceConfig,
        metrics: Arc<dyn SystemMetrics>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                metrics,
                telemetry,
                cache: Mutex::new(Cache::default()),
                host: Mutex::new(HostSample::default()),
            }),
            monitor: Mutex::new(None),
        }
    }

    /// Return the buffer cached under `key` if its layout matches exactly,
    /// otherwise allocate a zeroed one and cache it in place of any previous entry.
    ///
    /// Fails without touching the cache if the layout's size overflows.
    pub fn acquire_buffer(
        &self,
        key: &str,
        shape: &[usize],
        element: ElementType,
    ) -> Result<Buffer> {
        let layout = BufferLayout::new(shape, element)?;
        let mut cache = self.shared.cache();

        if let Some(buffer) = cache.buffers.get(key)
            && *buffer.layout() == layout
        {
            return Ok(buffer.clone());
        }

        let buffer = Buffer::allocate(layout);
        cache.buffers.insert(key.to_string(), buffer.clone());
        cache.allocations += 1;
        Ok(buffer)
    }

    /// Drop the cached entry for `key`. Outstanding handles stay valid.
    pub fn release_buffer(&self, key: &str) -> bool {
        let mut cache = self.shared.cache();
        if cache.buffers.remove(key).is_some() {
            cache.deallocations += 1;
            true
        } else {
            false
        }
    }

    /// Reclaim cached buffers according to current memory pressure.
    pub fn optimize(&self) -> Reclamation {
        let memory = match self.shared.metrics.memory_percent() {
            Ok(memory) => memory,
            Err(e) => {
                log::warn!("Cannot sample memory for optimization: {:#}", e);
                return Reclamation::None;
            }
        };
        self.shared.host().memory = memory;

        let config = &self.shared.config;
        let outcome = {
            let mut cache = self.shared.cache();
            if memory > config.critical_percent {
                let evicted = cache.buffers.len();
                cache.buffers.clear();
                cache.deallocations += evicted as u64;
                Reclamation::Critical { evicted }
            } else if memory > config.high_water_percent {
                let before = cache.buffers.len();
                cache.buffers.retain(|_, buffer| buffer.handle_count() > 1);
                let evicted = before - cache.buffers.len();
                cache.deallocations += evicted as u64;
                Reclamation::Soft { evicted }
            } else {
                Reclamation::None
            }
        };

        match outcome {
            Reclamation::None => {}
            Reclamation::Soft { evicted } => {
                log::debug!("Memory at {:.1}%: evicted {} idle buffers", memory, evicted);
                self.shared.telemetry.record_reclamation();
            }
            Reclamation::Critical { evicted } => {
                log::warn!(
                    "Memory critical at {:.1}%: evicted all {} cached buffers",
                    memory,
                    evicted
                );
                self.shared.telemetry.record_reclamation();
            }
        }
        outcome
    }

    /// Whether detection work should take the accelerated path.
    pub fn should_prefer_accelerated_path(&self) -> bool {
        self.cpu_usage() > self.shared.config.max_cpu_percent
            || self.shared.metrics.accelerator_present()
    }

    /// Last CPU figure taken by the monitor. Never blocks on the host.
    pub fn cpu_usage(&self) -> f32 {
        self.shared.host().cpu
    }

    /// Take a host sample right away instead of waiting for the monitor.
    pub fn refresh(&self) -> Result<()> {
        self.shared.sample()
    }

    pub fn start_monitoring(&self) -> Result<()> {
        let mut slot = self.monitor();
        if slot.as_ref().is_some_and(|m| m.handle.is_alive()) {
            return Ok(());
        }

        let sos = SignalOfStop::new();
        let shared = self.shared.clone();
        let thread_sos = sos.clone();
        let handle = ContextHandle::spawn("resource-monitor", move || {
            monitor::run(&shared, &thread_sos)
        })?;

        *slot = Some(Monitor { sos, handle });
        Ok(())
    }

    pub fn stop_monitoring(&self) {
        let Some(running) = self.monitor().take() else {
            return;
        };

        running.sos.cancel();
        if !running.handle.join_timeout(monitor::MONITOR_JOIN_TIMEOUT) {
            log::warn!("Resource monitor did not stop in time, detaching");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor().as_ref().is_some_and(|m| m.handle.is_alive())
    }

    pub fn system_status(&self) -> SystemStatus {
        let host = *self.shared.host();
        let cache = self.shared.cache();
        SystemStatus {
            memory_usage: host.memory,
            cpu_usage: host.cpu,
            temperature: host.temperature,
            buffer_count: cache.buffers.len(),
            allocations: cache.allocations,
            deallocations: cache.deallocations,
        }
    }

    pub fn buffer_count(&self) -> usize {
        self.shared.cache().buffers.len()
    }

    pub fn allocation_count(&self) -> u64 {
        self.shared.cache().allocations
    }

    pub fn deallocation_count(&self) -> u64 {
        self.shared.cache().deallocations
    }

    fn monitor(&self) -> MutexGuard<'_, Option<Monitor>> {
        self.monitor.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ResourcePool {
    fn drop(&mut self) {
        self.stop_monitoring();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TelemetryConfig;
    use crate::telemetry::ManualMetrics;
    use std::thread;
    use std::time::Duration;

    fn pool(metrics: Arc<ManualMetrics>) -> (ResourcePool, Arc<Telemetry>) {
        pool_with(ResourceConfig::default(), metrics)
    }

    fn pool_with(
        config: ResourceConfig,
        metrics: Arc<ManualMetrics>,
    ) -> (ResourcePool, Arc<Telemetry>) {
        let telemetry = Arc::new(Telemetry::new(
            &TelemetryConfig::default(),
            metrics.clone(),
        ));
        (
            ResourcePool::new(config, metrics, telemetry.clone()),
            telemetry,
        )
    }

    #[test]
    fn test_acquire_reuses_exact_match() {
        let (pool, _) = pool(Arc::new(ManualMetrics::new(10.0, 10.0)));

        let a = pool.acquire_buffer("frame", &[4, 4, 3], ElementType::U8).unwrap();
        let b = pool.acquire_buffer("frame", &[4, 4, 3], ElementType::U8).unwrap();

        assert!(a.ptr_eq(&b));
        assert_eq!(pool.allocation_count(), 1);
        assert_eq!(a.len(), 48);
        assert!(a.with_data(|bytes| bytes.iter().all(|b| *b == 0)));
    }

    #[test]
    fn test_acquire_mismatch_replaces() {
        let (pool, _) = pool(Arc::new(ManualMetrics::new(10.0, 10.0)));

        let a = pool.acquire_buffer("frame", &[4, 4], ElementType::U8).unwrap();
        let b = pool.acquire_buffer("frame", &[4, 4], ElementType::F32).unwrap();
        let c = pool.acquire_buffer("frame", &[4, 4], ElementType::F32).unwrap();

        assert!(!a.ptr_eq(&b));
        assert!(b.ptr_eq(&c));
        assert_eq!(pool.allocation_count(), 2);
        assert_eq!(pool.buffer_count(), 1);
    }

    #[test]
    fn test_release_buffer() {
        let (pool, _) = pool(Arc::new(ManualMetrics::new(10.0, 10.0)));
        let _buffer = pool.acquire_buffer("mask", &[8], ElementType::U8).unwrap();

        assert!(pool.release_buffer("mask"));
        assert!(!pool.release_buffer("mask"));
        assert_eq!(pool.deallocation_count(), 1);
        assert_eq!(pool.buffer_count(), 0);
    }

    #[test]
    fn test_optimize_below_high_water() {
        let (pool, telemetry) = pool(Arc::new(ManualMetrics::new(10.0, 50.0)));
        pool.acquire_buffer("a", &[1], ElementType::U8).unwrap();

        assert_eq!(pool.optimize(), Reclamation::None);
        assert_eq!(pool.buffer_count(), 1);
        assert_eq!(telemetry.snapshot().reclamations, 0);
    }

    #[test]
    fn test_optimize_soft_keeps_buffers_in_use() {
        let (pool, telemetry) = pool(Arc::new(ManualMetrics::new(10.0, 85.0)));
        let held = pool.acquire_buffer("held", &[16], ElementType::U8).unwrap();
        pool.acquire_buffer("idle", &[16], ElementType::U8).unwrap();

        assert_eq!(pool.optimize(), Reclamation::Soft { evicted: 1 });
        assert_eq!(pool.buffer_count(), 1);
        assert!(pool.acquire_buffer("held", &[16], ElementType::U8).unwrap().ptr_eq(&held));
        assert_eq!(telemetry.snapshot().reclamations, 1);
    }

    #[test]
    fn test_optimize_critical_clears_cache() {
        let metrics = Arc::new(ManualMetrics::new(10.0, 95.0));
        let (pool, telemetry) = pool(metrics);
        let _held = pool.acquire_buffer("held", &[16], ElementType::U8).unwrap();
        pool.acquire_buffer("idle", &[16], ElementType::U8).unwrap();

        assert_eq!(pool.optimize(), Reclamation::Critical { evicted: 2 });
        assert_eq!(pool.buffer_count(), 0);
        assert_eq!(pool.deallocation_count(), 2);
        assert_eq!(telemetry.snapshot().reclamations, 1);
    }

    #[test]
    fn test_oversized_request_leaves_cache_alone() {
        let (pool, _) = pool(Arc::new(ManualMetrics::new(10.0, 10.0)));
        let frame = pool.acquire_buffer("frame", &[4], ElementType::U8).unwrap();

        assert!(
            pool.acquire_buffer("frame", &[usize::MAX, 4], ElementType::F32)
                .is_err()
        );
        assert_eq!(pool.buffer_count(), 1);
        assert_eq!(pool.allocation_count(), 1);
        assert!(
            pool.acquire_buffer("frame", &[4], ElementType::U8)
                .unwrap()
                .ptr_eq(&frame)
        );
    }

    #[test]
    fn test_optimize_sampling_failure() {
        let metrics = Arc::new(ManualMetrics::new(10.0, 95.0));
        metrics.set_failing(true);
        let (pool, _) = pool(metrics);
        pool.acquire_buffer("a", &[1], ElementType::U8).unwrap();

        assert_eq!(pool.optimize(), Reclamation::None);
        assert_eq!(pool.buffer_count(), 1);
    }

    #[test]
    fn test_prefer_accelerated_path() {
        let metrics = Arc::new(ManualMetrics::new(50.0, 10.0));
        let (pool, _) = pool(metrics.clone());

        pool.refresh().unwrap();
        assert!(!pool.should_prefer_accelerated_path());

        metrics.set_cpu(95.0);
        pool.refresh().unwrap();
        assert!(pool.should_prefer_accelerated_path());

        metrics.set_cpu(10.0);
        metrics.set_accelerator(true);
        pool.refresh().unwrap();
        assert!(pool.should_prefer_accelerated_path());
    }

    #[test]
    fn test_monitor_samples_and_stops() {
        let metrics = Arc::new(ManualMetrics::new(33.0, 44.0));
        metrics.set_temperature(Some(60.0));
        let config = ResourceConfig {
            monitor_interval_ms: 20,
            ..ResourceConfig::default()
        };
        let (pool, _) = pool_with(config, metrics.clone());

        pool.start_monitoring().unwrap();
        pool.start_monitoring().unwrap();
        assert!(pool.is_monitoring());
        thread::sleep(Duration::from_millis(150));

        let status = pool.system_status();
        assert_eq!(status.cpu_usage, 33.0);
        assert_eq!(status.memory_usage, 44.0);
        assert_eq!(status.temperature, Some(60.0));
        assert!(metrics.cpu_reads() >= 2);

        pool.stop_monitoring();
        assert!(!pool.is_monitoring());
    }

    #[test]
    fn test_monitor_backs_off_on_failure() {
        let metrics = Arc::new(ManualMetrics::new(33.0, 44.0));
        metrics.set_failing(true);
        let config = ResourceConfig {
            monitor_interval_ms: 10,
            retry_interval_ms: 500,
            ..ResourceConfig::default()
        };
        let (pool, _) = pool_with(config, metrics.clone());

        pool.start_monitoring().unwrap();
        thread::sleep(Duration::from_millis(200));

        // one failed attempt, then waiting out the retry interval
        assert_eq!(metrics.cpu_reads(), 1);
        assert!(pool.is_monitoring());
        assert_eq!(pool.cpu_usage(), 0.0);

        pool.stop_monitoring();
    }
}
