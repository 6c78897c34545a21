use crate::breaker::CircuitState;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerStats {
    pub id: usize,
    pub busy: bool,
    pub processed: u64,
    pub errors: u64,
    pub avg_duration: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub queue_length: usize,
    /// Jobs dispatched to a worker and not yet finished.
    pub processing: usize,
    pub cached: usize,
    pub preloaded: usize,
    pub busy_workers: usize,
    pub total_workers: usize,
    /// Share of worker slots currently busy, in percent.
    pub efficiency: f64,
    /// Share of the target buffer that is filled, in percent.
    pub buffer_health: f64,
    pub distance_from_end: u64,
    pub continuous_enabled: bool,
}

/// Queue depth relative to its capacity ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueHealth {
    Normal,
    Warning,
    Critical,
}

impl QueueHealth {
    pub fn from_depth(len: usize, capacity: usize) -> Self {
        if capacity == 0 {
            return QueueHealth::Critical;
        }
        let used = len as f64 / capacity as f64;
        if used >= 0.8 {
            QueueHealth::Critical
        } else if used >= 0.5 {
            QueueHealth::Warning
        } else {
            QueueHealth::Normal
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SystemHealth {
    pub circuit_breaker_state: CircuitState,
    pub queue_size: usize,
    pub queue_health: QueueHealth,
    /// Failure ratio inside the breaker window, 0.0 to 1.0.
    pub api_failure_rate: f64,
    pub recent_requests: usize,
    pub recent_failures: usize,
}
