use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    pub workers: WorkerPoolConfig,
    pub queue: QueueConfig,
    pub cache: CacheConfig,
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
    pub predictor: PredictorConfig,
    pub buffer: BufferConfig,
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub size: usize,
    pub request_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            size: 30,
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: 200 }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_entries: 150 }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub window: Duration,
    /// Outcomes required in the window before the breaker may trip.
    pub min_samples: usize,
    /// Failure ratio at or above which the breaker opens.
    pub failure_threshold: f64,
    /// Time spent OPEN before a probe is let through.
    pub open_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            min_samples: 10,
            failure_threshold: 0.7,
            open_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PredictorConfig {
    /// Look-ahead when the feed is at rest.
    pub base_window: usize,
    /// Extra positions per unit of absolute velocity.
    pub velocity_factor: f64,
    pub max_window: usize,
    /// Ahead positions within this distance are critical.
    pub near_window: usize,
    /// Positions kept warm behind the scroll direction.
    pub trailing_window: usize,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            base_window: 5,
            velocity_factor: 2.0,
            max_window: 20,
            near_window: 3,
            trailing_window: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub tick_interval: Duration,
    pub target_size: usize,
    /// Refill when the distance from scroll to the last cached position drops below this.
    pub trigger_distance: u64,
    pub batch_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(2),
            target_size: 100,
            trigger_distance: 50,
            batch_size: 10,
        }
    }
}
