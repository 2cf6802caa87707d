//! Rolling-window performance telemetry
//!
//! Every component reports into a shared [`Telemetry`]: frame submission
//! timestamps, detection and processing latencies, drop and reclamation
//! counters, and a bounded log of recent errors. Writers only ever take a
//! short mutex; [`Telemetry::snapshot`] derives the statistics and samples the
//! host through a [`SystemMetrics`] provider.

pub mod system;
pub mod window;

pub use system::{ManualMetrics, SysinfoMetrics, SystemMetrics};
pub use window::SampleWindow;

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::config::TelemetryConfig;

/// Metric category of a timing observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Timestamp (seconds since the telemetry epoch) of a frame entering the pipeline
    FrameSubmission,
    /// Detection latency in milliseconds
    Detection,
    /// Whole-pass processing latency in milliseconds
    Processing,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Category::FrameSubmission => write!(f, "frame_submission"),
            Category::Detection => write!(f, "detection"),
            Category::Processing => write!(f, "processing"),
        }
    }
}

struct Windows {
    frame_times: SampleWindow<f64>,
    detection_times: SampleWindow<f64>,
    processing_times: SampleWindow<f64>,
    errors: SampleWindow<String>,
    frames_processed: u64,
    frames_dropped: u64,
    reclamations: u64,
}

impl Windows {
    fn window_mut(&mut self, category: Category) -> &mut SampleWindow<f64> {
        match category {
            Category::FrameSubmission => &mut self.frame_times,
            Category::Detection => &mut self.detection_times,
            Category::Processing => &mut self.processing_times,
        }
    }
}

/// Thread-safe telemetry recorder.
pub struct Telemetry {
    windows: Mutex<Windows>,
    metrics: Arc<dyn SystemMetrics>,
    epoch: Instant,
    recent_errors: usize,
}

impl Telemetry {
    pub fn new(config: &TelemetryConfig, metrics: Arc<dyn SystemMetrics>) -> Self {
        Self {
            windows: Mutex::new(Windows {
                frame_times: SampleWindow::new(config.window_size),
                detection_times: SampleWindow::new(config.window_size),
                processing_times: SampleWindow::new(config.window_size),
                errors: SampleWindow::new(config.error_capacity),
                frames_processed: 0,
                frames_dropped: 0,
                reclamations: 0,
            }),
            metrics,
            epoch: Instant::now(),
            recent_errors: config.recent_errors,
        }
    }

    /// Append `value` to the window of `category`, evicting the oldest sample when full.
    pub fn record(&self, category: Category, value: f64) {
        let mut windows = self.lock();
        windows.window_mut(category).push(value);
        if category == Category::FrameSubmission {
            windows.frames_processed += 1;
        }
    }

    /// Record a latency observation in milliseconds.
    pub fn record_duration(&self, category: Category, elapsed: Duration) {
        self.record(category, elapsed.as_secs_f64() * 1000.0);
    }

    /// Record a frame entering the pipeline now.
    pub fn record_frame_submission(&self) {
        let now = self.epoch.elapsed().as_secs_f64();
        self.record(Category::FrameSubmission, now);
    }

    pub fn record_frame_drop(&self) {
        self.lock().frames_dropped += 1;
    }

    pub fn record_reclamation(&self) {
        self.lock().reclamations += 1;
    }

    /// Append a timestamped message to the bounded error log.
    pub fn record_error(&self, message: impl AsRef<str>) {
        let stamp = chrono::Local::now().format("%H:%M:%S");
        let entry = format!("[{}] {}", stamp, message.as_ref());
        self.lock().errors.push(entry);
    }

    /// Derive statistics from the current windows and sample the host.
    ///
    /// Blocks for about one CPU sampling interval of the metrics provider, so
    /// keep it off per-frame paths.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let mut snapshot = {
            let windows = self.lock();
            let skip = windows.errors.len().saturating_sub(self.recent_errors);
            TelemetrySnapshot {
                rate: windows.frame_times.rate(),
                average_frame_time: windows.frame_times.mean(),
                average_detection_time: windows.detection_times.mean(),
                average_processing_time: windows.processing_times.mean(),
                cpu_usage: 0.0,
                memory_usage: 0.0,
                memory_usage_mb: 0.0,
                frames_processed: windows.frames_processed,
                frames_dropped: windows.frames_dropped,
                reclamations: windows.reclamations,
                recent_errors: windows.errors.iter().skip(skip).cloned().collect(),
            }
        };

        // Sampled outside the lock: writers must not wait on the host
        match self.metrics.cpu_percent() {
            Ok(cpu) => snapshot.cpu_usage = cpu,
            Err(e) => log::debug!("CPU sample unavailable: {}", e),
        }
        match self.metrics.memory_percent() {
            Ok(mem) => snapshot.memory_usage = mem,
            Err(e) => log::debug!("Memory sample unavailable: {}", e),
        }
        if let Ok(mb) = self.metrics.memory_used_mb() {
            snapshot.memory_usage_mb = mb;
        }

        snapshot
    }

    /// Clear all windows, the error log and every counter.
    pub fn reset(&self) {
        let mut windows = self.lock();
        windows.frame_times.clear();
        windows.detection_times.clear();
        windows.processing_times.clear();
        windows.errors.clear();
        windows.frames_processed = 0;
        windows.frames_dropped = 0;
        windows.reclamations = 0;
    }

    fn lock(&self) -> MutexGuard<'_, Windows> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let windows = self.lock();
        f.debug_struct("Telemetry")
            .field("frame_samples", &windows.frame_times.len())
            .field("frames_processed", &windows.frames_processed)
            .field("frames_dropped", &windows.frames_dropped)
            .field("errors", &windows.errors.len())
            .finish()
    }
}

/// Point-in-time statistics derived by [`Telemetry::snapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    pub rate: f64,
    pub average_frame_time: f64,
    pub average_detection_time: f64,
    pub average_processing_time: f64,
    pub cpu_usage: f32,
    pub memory_usage: f32,
    pub memory_usage_mb: f64,
    pub frames_processed: u64,
    pub frames_dropped: u64,
    pub reclamations: u64,
    pub recent_errors: Vec<String>,
}

impl std::fmt::Display for TelemetrySnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Telemetry: {:.1} fps, detect={:.2}ms process={:.2}ms, cpu={:.1}% mem={:.1}% ({:.0} MB), {} frames ({} dropped), {} reclamations, {} recent errors",
            self.rate,
            self.average_detection_time,
            self.average_processing_time,
            self.cpu_usage,
            self.memory_usage,
            self.memory_usage_mb,
            self.frames_processed,
            self.frames_dropped,
            self.reclamations,
            self.recent_errors.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn telemetry() -> Telemetry {
        Telemetry::new(
            &TelemetryConfig::default(),
            Arc::new(ManualMetrics::new(25.0, 40.0)),
        )
    }

    #[test]
    fn test_snapshot_rate() {
        let telemetry = telemetry();
        let t0 = 100.0;
        telemetry.record(Category::FrameSubmission, t0);
        telemetry.record(Category::FrameSubmission, t0 + 1.0);
        telemetry.record(Category::FrameSubmission, t0 + 2.0);

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.rate, 1.0);
        assert_eq!(snapshot.frames_processed, 3);
        assert_eq!(snapshot.cpu_usage, 25.0);
        assert_eq!(snapshot.memory_usage, 40.0);
    }

    #[test]
    fn test_snapshot_rate_single_sample() {
        let telemetry = telemetry();
        assert_eq!(telemetry.snapshot().rate, 0.0);

        telemetry.record(Category::FrameSubmission, 5.0);
        assert_eq!(telemetry.snapshot().rate, 0.0);
    }

    #[test]
    fn test_category_means() {
        let telemetry = telemetry();
        telemetry.record(Category::Detection, 2.0);
        telemetry.record(Category::Detection, 6.0);
        telemetry.record_duration(Category::Processing, Duration::from_millis(10));

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.average_detection_time, 4.0);
        assert!((snapshot.average_processing_time - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_error_log_keeps_last_five() {
        let telemetry = telemetry();
        for i in 0..60 {
            telemetry.record_error(format!("failure {i}"));
        }

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.recent_errors.len(), 5);
        assert!(snapshot.recent_errors[0].ends_with("failure 55"));
        assert!(snapshot.recent_errors[4].ends_with("failure 59"));
        assert!(snapshot.recent_errors[4].starts_with('['));
        assert_eq!(telemetry.lock().errors.len(), 50);
    }

    #[test]
    fn test_window_capacity_is_fixed() {
        let config = TelemetryConfig {
            window_size: 4,
            ..TelemetryConfig::default()
        };
        let telemetry = Telemetry::new(&config, Arc::new(ManualMetrics::default()));
        for i in 0..10 {
            telemetry.record(Category::Processing, i as f64);
        }
        // 6, 7, 8, 9
        assert_eq!(telemetry.snapshot().average_processing_time, 7.5);
    }

    #[test]
    fn test_reset() {
        let telemetry = telemetry();
        telemetry.record_frame_submission();
        telemetry.record_frame_drop();
        telemetry.record_reclamation();
        telemetry.record_error("oops");

        telemetry.reset();

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.frames_processed, 0);
        assert_eq!(snapshot.frames_dropped, 0);
        assert_eq!(snapshot.reclamations, 0);
        assert!(snapshot.recent_errors.is_empty());
        assert_eq!(snapshot.rate, 0.0);
    }

    #[test]
    fn test_snapshot_survives_failing_provider() {
        let metrics = Arc::new(ManualMetrics::new(50.0, 50.0));
        metrics.set_failing(true);
        let telemetry = Telemetry::new(&TelemetryConfig::default(), metrics);

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.cpu_usage, 0.0);
        assert_eq!(snapshot.memory_usage, 0.0);
    }

    #[test]
    fn test_concurrent_writers() {
        let telemetry = Arc::new(telemetry());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let telemetry = telemetry.clone();
                thread::spawn(move || {
                    for _ in 0..250 {
                        telemetry.record_frame_submission();
                        telemetry.record(Category::Detection, 1.0);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.frames_processed, 1000);
        assert_eq!(snapshot.average_detection_time, 1.0);
    }
}
