//! Engine configuration
//!
//! Every section deserializes with `#[serde(default)]`, so a partial JSON
//! document only overrides the fields it names.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::assets::*;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub telemetry: TelemetryConfig,
    pub resources: ResourceConfig,
    pub pipeline: PipelineConfig,
    pub dispatch: DispatchConfig,
    pub workers: WorkerConfig,
    pub safety: SafetyConfig,
    pub engine: EngineLoopConfig,
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("invalid engine configuration")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        Self::from_json_str(&raw)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Samples kept per timing category
    pub window_size: usize,
    /// Entries kept in the error log
    pub error_capacity: usize,
    /// Errors reported by a snapshot
    pub recent_errors: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            window_size: TELEMETRY_WINDOW,
            error_capacity: ERROR_LOG_CAPACITY,
            recent_errors: RECENT_ERRORS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// CPU load above which the accelerated path is preferred
    pub max_cpu_percent: f32,
    /// Memory percentage triggering the soft reclamation tier
    pub high_water_percent: f32,
    /// Memory percentage triggering a full cache eviction
    pub critical_percent: f32,
    pub monitor_interval_ms: u64,
    /// Wait after a failed sample before the monitor retries
    pub retry_interval_ms: u64,
}

impl ResourceConfig {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_cpu_percent: MAX_CPU_PERCENT,
            high_water_percent: MEMORY_HIGH_WATER,
            critical_percent: MEMORY_CRITICAL,
            monitor_interval_ms: MONITOR_INTERVAL_MS,
            retry_interval_ms: MONITOR_RETRY_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capacity of the input and output frame queues
    pub queue_capacity: usize,
    pub poll_timeout_ms: u64,
    pub join_timeout_ms: u64,
    /// Run the internal unit that keeps the output queue drained
    pub drain_output: bool,
}

impl PipelineConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: FRAME_QUEUE_CAPACITY,
            poll_timeout_ms: QUEUE_POLL_MS,
            join_timeout_ms: PIPELINE_JOIN_MS,
            drain_output: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Threads available to I/O-bound tasks
    pub io_workers: usize,
    /// Threads available to compute-bound tasks, `None` for one per core
    pub compute_workers: Option<usize>,
    /// CPU load under which I/O tasks get the prefer-threads hint
    pub cpu_threshold: f32,
    pub queue_capacity: usize,
    pub shutdown_timeout_ms: u64,
}

impl DispatchConfig {
    pub fn compute_workers(&self) -> usize {
        self.compute_workers.unwrap_or_else(num_cpus::get).max(1)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            io_workers: IO_WORKERS,
            compute_workers: None,
            cpu_threshold: DISPATCH_CPU_THRESHOLD,
            queue_capacity: DISPATCH_QUEUE_CAPACITY,
            shutdown_timeout_ms: WORKER_STOP_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub stop_timeout_ms: u64,
}

impl WorkerConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: WORKER_STOP_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub toggle_cooldown_ms: u64,
}

impl SafetyConfig {
    pub fn toggle_cooldown(&self) -> Duration {
        Duration::from_millis(self.toggle_cooldown_ms)
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            toggle_cooldown_ms: TOGGLE_COOLDOWN_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineLoopConfig {
    pub loop_sleep_us: u64,
    pub optimize_interval_ms: u64,
    pub stats_interval_ms: u64,
}

impl EngineLoopConfig {
    pub fn loop_sleep(&self) -> Duration {
        Duration::from_micros(self.loop_sleep_us)
    }

    pub fn optimize_interval(&self) -> Duration {
        Duration::from_millis(self.optimize_interval_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }
}

impl Default for EngineLoopConfig {
    fn default() -> Self {
        Self {
            loop_sleep_us: LOOP_SLEEP_US,
            optimize_interval_ms: OPTIMIZE_INTERVAL_MS,
            stats_interval_ms: STATS_INTERVAL_MS,
        }
    }
}

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}
