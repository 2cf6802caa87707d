// telemetry
pub const TELEMETRY_WINDOW: usize = 100;
pub const ERROR_LOG_CAPACITY: usize = 50;
pub const RECENT_ERRORS: usize = 5;

// pipeline
pub const FRAME_QUEUE_CAPACITY: usize = 10;
pub const QUEUE_POLL_MS: u64 = 100;
pub const PIPELINE_JOIN_MS: u64 = 1000;

// resources
pub const MAX_CPU_PERCENT: f32 = 80.0;
pub const MEMORY_HIGH_WATER: f32 = 80.0;
pub const MEMORY_CRITICAL: f32 = 90.0;
pub const MONITOR_INTERVAL_MS: u64 = 1000;
pub const MONITOR_RETRY_MS: u64 = 5000;

// dispatch
pub const IO_WORKERS: usize = 10;
pub const DISPATCH_QUEUE_CAPACITY: usize = 256;
pub const DISPATCH_CPU_THRESHOLD: f32 = 80.0;

// workers
pub const WORKER_STOP_MS: u64 = 2000;

// safety
pub const TOGGLE_COOLDOWN_MS: u64 = 500;

// engine loop
pub const FRAME_RATE: u32 = 60;
pub const FRAME_WIDTH: u32 = 320;
pub const FRAME_HEIGHT: u32 = 240;
pub const LOOP_SLEEP_US: u64 = 1000;
pub const OPTIMIZE_INTERVAL_MS: u64 = 2000;
pub const STATS_INTERVAL_MS: u64 = 5000;

#[cfg(target_os = "windows")]
pub const TARGET_OS: &str = "windows";
#[cfg(target_os = "macos")]
pub const TARGET_OS: &str = "macos";
#[cfg(target_os = "linux")]
pub const TARGET_OS: &str = "linux";
#[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
pub const TARGET_OS: &str = "other";
