//! Health counters for the stage pipeline

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Health metrics for a pipeline
///
/// All fields use atomic operations for thread-safe access.
#[derive(Debug)]
pub struct PipelineHealth {
    /// Frames accepted by the input queue
    pub frames_submitted: AtomicU64,

    /// Frames rejected because the input queue was full
    pub frame_drops: AtomicU64,

    /// Results discarded because the output queue was full
    pub result_drops: AtomicU64,

    /// Frames that went through every stage
    pub frames_processed: AtomicU64,

    /// Passes aborted by a failing or panicking stage
    pub stage_failures: AtomicU64,

    /// Results discarded by the drain unit
    pub frames_drained: AtomicU64,

    /// Timestamp (as Unix microseconds) of the last successfully processed frame
    pub last_frame_time: AtomicU64,
}

fn unix_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

impl PipelineHealth {
    /// Create a new health metrics instance
    pub fn new() -> Self {
        Self {
            frames_submitted: AtomicU64::new(0),
            frame_drops: AtomicU64::new(0),
            result_drops: AtomicU64::new(0),
            frames_processed: AtomicU64::new(0),
            stage_failures: AtomicU64::new(0),
            frames_drained: AtomicU64::new(0),
            last_frame_time: AtomicU64::new(unix_micros()),
        }
    }

    pub fn record_submission(&self) {
        self.frames_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_drop(&self) {
        self.frame_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_result_drop(&self) {
        self.result_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stage_failure(&self) {
        self.stage_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drained(&self) {
        self.frames_drained.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successfully processed frame
    pub fn record_frame(&self) {
        self.last_frame_time.store(unix_micros(), Ordering::Relaxed);
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_submitted(&self) -> u64 {
        self.frames_submitted.load(Ordering::Relaxed)
    }

    pub fn frame_drops(&self) -> u64 {
        self.frame_drops.load(Ordering::Relaxed)
    }

    pub fn result_drops(&self) -> u64 {
        self.result_drops.load(Ordering::Relaxed)
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::Relaxed)
    }

    pub fn stage_failures(&self) -> u64 {
        self.stage_failures.load(Ordering::Relaxed)
    }

    pub fn frames_drained(&self) -> u64 {
        self.frames_drained.load(Ordering::Relaxed)
    }

    pub fn last_frame_time(&self) -> u64 {
        self.last_frame_time.load(Ordering::Relaxed)
    }

    /// Share of offered frames rejected at the input, in percent
    pub fn frame_drop_rate(&self) -> f64 {
        let drops = self.frame_drops();
        let offered = self.frames_submitted() + drops;
        if offered == 0 {
            return 0.0;
        }
        (drops as f64 / offered as f64) * 100.0
    }

    /// Accepted frames that have neither completed nor failed yet
    pub fn in_flight(&self) -> u64 {
        self.frames_submitted()
            .saturating_sub(self.frames_processed() + self.stage_failures())
    }

    /// Check if the pipeline has stalled (no frames for given duration)
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        let elapsed_micros = unix_micros().saturating_sub(self.last_frame_time());
        elapsed_micros > threshold.as_micros() as u64
    }

    /// Get a summary of health metrics
    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            frames_submitted: self.frames_submitted(),
            frames_processed: self.frames_processed(),
            frame_drops: self.frame_drops(),
            result_drops: self.result_drops(),
            stage_failures: self.stage_failures(),
            frames_drained: self.frames_drained(),
            frame_drop_rate: self.frame_drop_rate(),
        }
    }
}

impl Default for PipelineHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of health metrics
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthSummary {
    pub frames_submitted: u64,
    pub frames_processed: u64,
    pub frame_drops: u64,
    pub result_drops: u64,
    pub stage_failures: u64,
    pub frames_drained: u64,
    pub frame_drop_rate: f64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Health: {} submitted, {} processed ({} drops, {:.2}%), {} result drops, {} stage failures, {} drained",
            self.frames_submitted,
            self.frames_processed,
            self.frame_drops,
            self.frame_drop_rate,
            self.result_drops,
            self.stage_failures,
            self.frames_drained
        )
    }
}
