use std::time::{Duration, Instant};

use crate::telemetry::{Category, Telemetry};

/// Sleeps shorter than this are spun instead of handed to the scheduler.
pub const SPIN_THRESHOLD: Duration = Duration::from_millis(10);

/// Sleep for `duration`, busy-waiting when it is too short for the OS
/// scheduler to honour precisely.
pub fn hybrid_sleep(duration: Duration) {
    if duration > SPIN_THRESHOLD {
        std::thread::sleep(duration);
        return;
    }

    let start = Instant::now();
    while start.elapsed() < duration {
        std::hint::spin_loop();
    }
}

/// Records the time between its creation and its drop into a telemetry category.
pub struct ScopedTimer<'a> {
    started: Instant,
    category: Category,
    telemetry: &'a Telemetry,
}

impl<'a> ScopedTimer<'a> {
    pub fn new(telemetry: &'a Telemetry, category: Category) -> Self {
        Self {
            started: Instant::now(),
            category,
            telemetry,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for ScopedTimer<'_> {
    fn drop(&mut self) {
        self.telemetry
            .record_duration(self.category, self.started.elapsed());
    }
}
