use std::time::{Duration, Instant};

/// Lifecycle of a [`StagePipeline`](super::StagePipeline).
///
/// `Idle -> Running -> Stopping -> Stopped`, and a stopped pipeline may run again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Built, never started
    Idle,
    Running { since: Instant },
    /// Units signalled, not joined yet
    Stopping,
    /// Units joined or detached after their deadline
    Stopped,
}

impl PipelineState {
    /// Whether `start` may spawn units from this state
    pub fn can_start(&self) -> bool {
        matches!(self, PipelineState::Idle | PipelineState::Stopped)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, PipelineState::Running { .. })
    }

    /// Time spent in the current run
    pub fn uptime(&self) -> Option<Duration> {
        match self {
            PipelineState::Running { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Running { .. } => "running",
            PipelineState::Stopping => "stopping",
            PipelineState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_idle_or_stopped_can_start() {
        let running = PipelineState::Running {
            since: Instant::now(),
        };

        assert!(PipelineState::Idle.can_start());
        assert!(PipelineState::Stopped.can_start());
        assert!(!running.can_start());
        assert!(!PipelineState::Stopping.can_start());
    }

    #[test]
    fn test_uptime_only_while_running() {
        let running = PipelineState::Running {
            since: Instant::now() - Duration::from_millis(20),
        };

        assert!(running.is_running());
        assert!(running.uptime().unwrap() >= Duration::from_millis(20));
        assert_eq!(PipelineState::Stopped.uptime(), None);
        assert_eq!(PipelineState::Stopping.to_string(), "stopping");
    }
}
