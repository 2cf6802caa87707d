//! Host metrics providers.

use anyhow::{Result, anyhow};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use sysinfo::{Components, System};

/// Source of instantaneous host utilization figures.
///
/// Implementations must be cheap enough to call about once per second.
/// [`SystemMetrics::cpu_percent`] may block for one sampling interval.
pub trait SystemMetrics: Send + Sync {
    /// Global CPU utilization in percent (0..=100).
    fn cpu_percent(&self) -> Result<f32>;

    /// Used physical memory in percent (0..=100).
    fn memory_percent(&self) -> Result<f32>;

    /// Used physical memory in MiB.
    fn memory_used_mb(&self) -> Result<f64> {
        Ok(0.0)
    }

    /// Hottest CPU sensor reading in °C, if the host exposes one.
    fn temperature(&self) -> Option<f32> {
        None
    }

    /// Whether a hardware accelerator is available for detection work.
    fn accelerator_present(&self) -> bool {
        false
    }
}

/// A metrics provider backed by the `sysinfo` crate.
///
/// CPU and memory are read from separate [`System`] instances so a memory read
/// never waits on the CPU sampling interval.
pub struct SysinfoMetrics {
    cpu: Mutex<System>,
    memory: Mutex<System>,
}

impl SysinfoMetrics {
    pub fn new() -> Self {
        let mut cpu = System::new();
        cpu.refresh_cpu_usage();
        let mut memory = System::new();
        memory.refresh_memory();
        Self {
            cpu: Mutex::new(cpu),
            memory: Mutex::new(memory),
        }
    }

    fn cpu(&self) -> MutexGuard<'_, System> {
        self.cpu.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn memory(&self) -> MutexGuard<'_, System> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SysinfoMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemMetrics for SysinfoMetrics {
    fn cpu_percent(&self) -> Result<f32> {
        // CPU usage is a delta between two refreshes; the lock is not held while sleeping
        self.cpu().refresh_cpu_usage();
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        let mut system = self.cpu();
        system.refresh_cpu_usage();
        Ok(system.global_cpu_usage())
    }

    fn memory_percent(&self) -> Result<f32> {
        let mut system = self.memory();
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return Err(anyhow!("host reports no physical memory"));
        }
        Ok((system.used_memory() as f64 / total as f64 * 100.0) as f32)
    }

    fn memory_used_mb(&self) -> Result<f64> {
        let mut system = self.memory();
        system.refresh_memory();
        Ok(system.used_memory() as f64 / (1024.0 * 1024.0))
    }

    fn temperature(&self) -> Option<f32> {
        let components = Components::new_with_refreshed_list();
        let mut max_temp: Option<f32> = None;

        for component in &components {
            let label = component.label().to_lowercase();
            if (label.contains("cpu") || label.contains("core"))
                && let Some(temp) = component.temperature()
            {
                max_temp = Some(max_temp.map_or(temp, |m| m.max(temp)));
            }
        }
        max_temp
    }
}

/// A provider whose readings are set by hand.
///
/// Useful for headless runs and for driving load-dependent behavior
/// deterministically. A reading can be switched into a failing state to
/// exercise error paths.
#[derive(Debug, Default)]
pub struct ManualMetrics {
    cpu: AtomicU32,
    memory: AtomicU32,
    memory_mb: AtomicU64,
    temperature: Mutex<Option<f32>>,
    accelerator: AtomicBool,
    failing: AtomicBool,
    cpu_reads: AtomicU64,
}

impl ManualMetrics {
    pub fn new(cpu_percent: f32, memory_percent: f32) -> Self {
        let metrics = Self::default();
        metrics.set_cpu(cpu_percent);
        metrics.set_memory(memory_percent);
        metrics
    }

    pub fn set_cpu(&self, percent: f32) {
        self.cpu.store(percent.to_bits(), Ordering::Relaxed);
    }

    pub fn set_memory(&self, percent: f32) {
        self.memory.store(percent.to_bits(), Ordering::Relaxed);
    }

    pub fn set_memory_used_mb(&self, mb: f64) {
        self.memory_mb.store(mb.to_bits(), Ordering::Relaxed);
    }

    pub fn set_temperature(&self, celsius: Option<f32>) {
        *self
            .temperature
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = celsius;
    }

    pub fn set_accelerator(&self, present: bool) {
        self.accelerator.store(present, Ordering::Relaxed);
    }

    /// Makes every subsequent cpu/memory read fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Number of `cpu_percent` calls served so far, failed ones included.
    pub fn cpu_reads(&self) -> u64 {
        self.cpu_reads.load(Ordering::Relaxed)
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::Relaxed) {
            Err(anyhow!("metrics provider unavailable"))
        } else {
            Ok(())
        }
    }
}

impl SystemMetrics for ManualMetrics {
    fn cpu_percent(&self) -> Result<f32> {
        self.cpu_reads.fetch_add(1, Ordering::Relaxed);
        self.check()?;
        Ok(f32::from_bits(self.cpu.load(Ordering::Relaxed)))
    }

    fn memory_percent(&self) -> Result<f32> {
        self.check()?;
        Ok(f32::from_bits(self.memory.load(Ordering::Relaxed)))
    }

    fn memory_used_mb(&self) -> Result<f64> {
        self.check()?;
        Ok(f64::from_bits(self.memory_mb.load(Ordering::Relaxed)))
    }

    fn temperature(&self) -> Option<f32> {
        *self
            .temperature
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn accelerator_present(&self) -> bool {
        self.accelerator.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_metrics_readings() {
        let metrics = ManualMetrics::new(42.0, 63.5);
        assert_eq!(metrics.cpu_percent().unwrap(), 42.0);
        assert_eq!(metrics.memory_percent().unwrap(), 63.5);
        assert_eq!(metrics.temperature(), None);

        metrics.set_temperature(Some(71.0));
        metrics.set_accelerator(true);
        assert_eq!(metrics.temperature(), Some(71.0));
        assert!(metrics.accelerator_present());
        assert_eq!(metrics.cpu_reads(), 1);
    }

    #[test]
    fn test_manual_metrics_failure() {
        let metrics = ManualMetrics::new(10.0, 10.0);
        metrics.set_failing(true);
        assert!(metrics.cpu_percent().is_err());
        assert!(metrics.memory_percent().is_err());

        metrics.set_failing(false);
        assert!(metrics.cpu_percent().is_ok());
    }

    #[test]
    fn test_sysinfo_memory_in_range() {
        let metrics = SysinfoMetrics::new();
        if let Ok(percent) = metrics.memory_percent() {
            assert!((0.0..=100.0).contains(&percent));
        }
    }

    #[test]
    fn test_sysinfo_memory_not_blocked_by_cpu_sampling() {
        use std::sync::Arc;
        use std::sync::atomic::AtomicBool;
        use std::time::{Duration, Instant};

        let metrics = Arc::new(SysinfoMetrics::new());
        let done = Arc::new(AtomicBool::new(false));
        let sampler = {
            let metrics = metrics.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    let _ = metrics.cpu_percent();
                }
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        let mut worst = Duration::ZERO;
        for _ in 0..20 {
            let start = Instant::now();
            let _ = metrics.memory_percent();
            worst = worst.max(start.elapsed());
            std::thread::sleep(Duration::from_millis(10));
        }
        done.store(true, Ordering::Relaxed);
        sampler.join().unwrap();

        assert!(
            worst < Duration::from_millis(100),
            "memory read took {worst:?}"
        );
    }
}
