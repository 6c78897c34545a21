use crate::config::BufferConfig;
use crate::{JobSpec, Priority, SourceImage};
use tracing::debug;

/// Cache and queue figures the maintainer looks at on each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSnapshot {
    pub scroll_position: u64,
    pub cached: usize,
    pub max_cached: Option<u64>,
    pub queue_len: usize,
    pub queue_capacity: usize,
}

impl BufferSnapshot {
    /// Gap between the scroll position and the highest cached position.
    pub fn distance_from_end(&self) -> u64 {
        self.max_cached
            .map_or(0, |max| max.saturating_sub(self.scroll_position))
    }
}

/// Keeps a target number of generated images ahead of the user,
/// independent of scroll events.
#[derive(Debug)]
pub struct BufferMaintainer {
    config: BufferConfig,
    source: Option<SourceImage>,
    /// Next position the maintainer has not yet considered. Only grows
    /// until [`BufferMaintainer::reset`].
    high_water: u64,
}

impl BufferMaintainer {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            config,
            source: None,
            high_water: 0,
        }
    }

    pub fn enable(&mut self, source: SourceImage) {
        self.source = Some(source);
    }

    pub fn disable(&mut self) {
        self.source = None;
    }

    pub fn is_enabled(&self) -> bool {
        self.source.is_some()
    }

    pub fn source(&self) -> Option<&SourceImage> {
        self.source.as_ref()
    }

    pub fn high_water(&self) -> u64 {
        self.high_water
    }

    pub fn target_size(&self) -> usize {
        self.config.target_size
    }

    /// Percent of the target buffer currently filled, 0 to 100.
    pub fn health(&self, cached: usize) -> f64 {
        if self.config.target_size == 0 {
            return 100.0;
        }
        (cached as f64 / self.config.target_size as f64).min(1.0) * 100.0
    }

    pub fn needs_refill(&self, snapshot: &BufferSnapshot) -> bool {
        snapshot.cached < self.config.target_size
            || snapshot.distance_from_end() < self.config.trigger_distance
            || snapshot.queue_len == 0
    }

    /// Produces the next batch of cache-priority jobs, or nothing if the
    /// buffer is disabled or healthy. `is_taken` reports positions that are
    /// already cached, queued or in flight.
    ///
    /// A batch never exceeds the queue's free room, so background fill
    /// cannot trigger overflow cleanup.
    pub fn tick(&mut self, snapshot: &BufferSnapshot, is_taken: impl Fn(u64) -> bool) -> Vec<JobSpec> {
        if !self.is_enabled() || !self.needs_refill(snapshot) {
            return Vec::new();
        }
        let limit = self
            .config
            .batch_size
            .min(snapshot.queue_capacity.saturating_sub(snapshot.queue_len));
        if limit == 0 {
            return Vec::new();
        }

        let mut position = self.high_water.max(snapshot.scroll_position);
        let mut batch = Vec::with_capacity(limit);
        while batch.len() < limit {
            if !is_taken(position) {
                batch.push(JobSpec::new(position, Priority::Cache));
            }
            position = match position.checked_add(1) {
                Some(next) => next,
                None => break,
            };
        }
        self.high_water = position;

        debug!(
            batch = batch.len(),
            high_water = self.high_water,
            cached = snapshot.cached,
            distance_from_end = snapshot.distance_from_end(),
            queue_len = snapshot.queue_len,
            "Buffer refill"
        );
        batch
    }

    pub fn reset(&mut self) {
        self.high_water = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BufferConfig {
        BufferConfig {
            tick_interval: std::time::Duration::from_secs(2),
            target_size: 100,
            trigger_distance: 50,
            batch_size: 10,
        }
    }

    fn enabled() -> BufferMaintainer {
        let mut buffer = BufferMaintainer::new(config());
        buffer.enable(SourceImage::new("file://source.jpg"));
        buffer
    }

    #[test]
    fn test_disabled_does_nothing() {
        let mut buffer = BufferMaintainer::new(config());
        let snapshot = BufferSnapshot {
            scroll_position: 0,
            cached: 0,
            max_cached: None,
            queue_len: 0,
            queue_capacity: 200,
        };
        assert!(buffer.tick(&snapshot, |_| false).is_empty());
        assert_eq!(buffer.high_water(), 0);
    }

    #[test]
    fn test_refills_below_target_without_collisions() {
        let mut buffer = enabled();
        // 40 cached images at positions 0..40 with the user at 29.
        let snapshot = BufferSnapshot {
            scroll_position: 29,
            cached: 40,
            max_cached: Some(39),
            queue_len: 3,
            queue_capacity: 200,
        };
        assert_eq!(snapshot.distance_from_end(), 10);

        let first = buffer.tick(&snapshot, |p| p < 40);
        let positions: Vec<_> = first.iter().map(|s| s.position).collect();
        assert_eq!(positions, (40..50).collect::<Vec<_>>());
        assert!(first.iter().all(|s| s.priority == Priority::Cache));
        assert_eq!(buffer.high_water(), 50);

        let second = buffer.tick(&snapshot, |p| p < 40);
        assert_eq!(second.first().map(|s| s.position), Some(50));
        assert_eq!(buffer.high_water(), 60);
    }

    #[test]
    fn test_skips_taken_positions() {
        let mut buffer = enabled();
        let snapshot = BufferSnapshot {
            scroll_position: 0,
            cached: 0,
            max_cached: None,
            queue_len: 0,
            queue_capacity: 200,
        };
        let batch = buffer.tick(&snapshot, |p| p % 2 == 0);
        assert_eq!(batch.len(), 10);
        assert!(batch.iter().all(|s| s.position % 2 == 1));
        assert_eq!(buffer.high_water(), 20);
    }

    #[test]
    fn test_healthy_buffer_is_left_alone() {
        let mut buffer = enabled();
        let snapshot = BufferSnapshot {
            scroll_position: 10,
            cached: 120,
            max_cached: Some(200),
            queue_len: 5,
            queue_capacity: 200,
        };
        assert!(!buffer.needs_refill(&snapshot));
        assert!(buffer.tick(&snapshot, |_| false).is_empty());
    }

    #[test]
    fn test_empty_queue_triggers_refill() {
        let buffer = enabled();
        let snapshot = BufferSnapshot {
            scroll_position: 10,
            cached: 120,
            max_cached: Some(200),
            queue_len: 0,
            queue_capacity: 200,
        };
        assert!(buffer.needs_refill(&snapshot));
    }

    #[test]
    fn test_starts_from_scroll_when_ahead_of_high_water() {
        let mut buffer = enabled();
        let snapshot = BufferSnapshot {
            scroll_position: 500,
            cached: 0,
            max_cached: None,
            queue_len: 0,
            queue_capacity: 200,
        };
        let batch = buffer.tick(&snapshot, |_| false);
        assert_eq!(batch[0].position, 500);
        assert_eq!(buffer.high_water(), 510);

        buffer.reset();
        assert_eq!(buffer.high_water(), 0);
    }

    #[test]
    fn test_batch_limited_to_queue_room() {
        let mut buffer = enabled();
        let mut snapshot = BufferSnapshot {
            scroll_position: 0,
            cached: 0,
            max_cached: None,
            queue_len: 0,
            queue_capacity: 1,
        };
        let batch = buffer.tick(&snapshot, |_| false);
        assert_eq!(batch.len(), 1);
        assert_eq!(buffer.high_water(), 1);

        snapshot.queue_len = 1;
        assert!(buffer.tick(&snapshot, |_| false).is_empty());
        assert_eq!(buffer.high_water(), 1);

        snapshot.queue_len = 196;
        snapshot.queue_capacity = 200;
        assert_eq!(buffer.tick(&snapshot, |_| false).len(), 4);
    }

    #[test]
    fn test_health_percent() {
        let buffer = enabled();
        assert_eq!(buffer.health(0), 0.0);
        assert_eq!(buffer.health(40), 40.0);
        assert_eq!(buffer.health(250), 100.0);
    }
}
