use crate::config::PredictorConfig;
use crate::{JobSpec, Priority};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollDirection {
    Forward,
    Backward,
}

/// Jobs derived from one scroll update.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Prediction {
    /// In the scroll direction, nearest first.
    pub ahead: Vec<JobSpec>,
    /// Against the scroll direction, nearest first.
    pub behind: Vec<JobSpec>,
}

impl Prediction {
    pub fn is_empty(&self) -> bool {
        self.ahead.is_empty() && self.behind.is_empty()
    }

    pub fn into_jobs(self) -> impl Iterator<Item = JobSpec> {
        self.ahead.into_iter().chain(self.behind)
    }
}

/// Turns scroll telemetry into preload work with a velocity-adaptive window.
#[derive(Debug)]
pub struct ScrollPredictor {
    config: PredictorConfig,
    last_index: u64,
    velocity: f64,
    direction: ScrollDirection,
}

impl ScrollPredictor {
    pub fn new(config: PredictorConfig) -> Self {
        Self {
            config,
            last_index: 0,
            velocity: 0.0,
            direction: ScrollDirection::Forward,
        }
    }

    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    pub fn velocity(&self) -> f64 {
        self.velocity
    }

    pub fn direction(&self) -> ScrollDirection {
        self.direction
    }

    /// Look-ahead grows with speed, up to `max_window`.
    pub fn window_size(&self, velocity: f64) -> usize {
        let speed = if velocity.is_finite() { velocity.abs() } else { 0.0 };
        let extra = (speed * self.config.velocity_factor).ceil() as usize;
        self.config
            .base_window
            .saturating_add(extra)
            .min(self.config.max_window)
    }

    /// Records the new position and returns jobs for every uncached position
    /// in the look-ahead and trailing windows. An unchanged index keeps the
    /// previous direction.
    pub fn update(
        &mut self,
        index: u64,
        velocity: f64,
        is_cached: impl Fn(u64) -> bool,
    ) -> Prediction {
        if index > self.last_index {
            self.direction = ScrollDirection::Forward;
        } else if index < self.last_index {
            self.direction = ScrollDirection::Backward;
        }
        self.last_index = index;
        self.velocity = velocity;

        let window = self.window_size(velocity) as u64;
        let near = self.config.near_window as u64;
        let trailing = self.config.trailing_window as u64;

        let ahead = self
            .walk(index, self.direction, 0..=window)
            .filter(|p| !is_cached(*p))
            .map(|p| {
                let priority = if p.abs_diff(index) <= near {
                    Priority::Critical
                } else {
                    Priority::Preload
                };
                JobSpec::new(p, priority)
            })
            .collect();

        let behind_direction = match self.direction {
            ScrollDirection::Forward => ScrollDirection::Backward,
            ScrollDirection::Backward => ScrollDirection::Forward,
        };
        let behind = self
            .walk(index, behind_direction, 1..=trailing)
            .filter(|p| !is_cached(*p))
            .map(|p| JobSpec::new(p, Priority::Cache))
            .collect();

        Prediction { ahead, behind }
    }

    fn walk(
        &self,
        index: u64,
        direction: ScrollDirection,
        offsets: std::ops::RangeInclusive<u64>,
    ) -> impl Iterator<Item = u64> {
        offsets.filter_map(move |offset| match direction {
            ScrollDirection::Forward => index.checked_add(offset),
            ScrollDirection::Backward => index.checked_sub(offset),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn predictor() -> ScrollPredictor {
        ScrollPredictor::new(PredictorConfig {
            base_window: 5,
            velocity_factor: 2.0,
            max_window: 20,
            near_window: 3,
            trailing_window: 2,
        })
    }

    fn positions(specs: &[JobSpec]) -> Vec<u64> {
        specs.iter().map(|s| s.position).collect()
    }

    #[test]
    fn test_window_grows_with_velocity_and_caps() {
        let predictor = predictor();
        assert_eq!(predictor.window_size(0.0), 5);
        assert_eq!(predictor.window_size(2.0), 9);
        assert_eq!(predictor.window_size(-2.0), 9);
        assert_eq!(predictor.window_size(100.0), 20);
        assert_eq!(predictor.window_size(f64::NAN), 5);
    }

    #[test]
    fn test_forward_scroll() {
        let mut predictor = predictor();
        let prediction = predictor.update(10, 0.0, |_| false);

        assert_eq!(predictor.direction(), ScrollDirection::Forward);
        assert_eq!(positions(&prediction.ahead), vec![10, 11, 12, 13, 14, 15]);
        assert!(prediction.ahead[..4]
            .iter()
            .all(|s| s.priority == Priority::Critical));
        assert!(prediction.ahead[4..]
            .iter()
            .all(|s| s.priority == Priority::Preload));
        assert_eq!(positions(&prediction.behind), vec![9, 8]);
        assert!(prediction.behind.iter().all(|s| s.priority == Priority::Cache));
    }

    #[test]
    fn test_backward_scroll() {
        let mut predictor = predictor();
        predictor.update(20, 0.0, |_| false);
        let prediction = predictor.update(18, 0.0, |_| false);

        assert_eq!(predictor.direction(), ScrollDirection::Backward);
        assert_eq!(positions(&prediction.ahead), vec![18, 17, 16, 15, 14, 13]);
        assert_eq!(positions(&prediction.behind), vec![19, 20]);
    }

    #[test]
    fn test_backward_window_stops_at_zero() {
        let mut predictor = predictor();
        predictor.update(5, 0.0, |_| false);
        let prediction = predictor.update(2, 0.0, |_| false);
        assert_eq!(positions(&prediction.ahead), vec![2, 1, 0]);
    }

    #[test]
    fn test_skips_cached_positions() {
        let mut predictor = predictor();
        let prediction = predictor.update(1, 0.0, |p| p % 2 == 0);
        assert_eq!(positions(&prediction.ahead), vec![1, 3, 5]);
        assert!(positions(&prediction.behind).is_empty());
    }

    #[test]
    fn test_same_index_keeps_direction() {
        let mut predictor = predictor();
        predictor.update(10, 0.0, |_| false);
        predictor.update(8, 0.0, |_| false);
        predictor.update(8, 0.0, |_| false);
        assert_eq!(predictor.direction(), ScrollDirection::Backward);
    }

    #[test]
    fn test_velocity_widens_look_ahead() {
        let mut predictor = predictor();
        let prediction = predictor.update(1, 3.0, |_| false);
        // 5 + ceil(3.0 * 2.0) = 11 positions past the current one.
        assert_eq!(prediction.ahead.len(), 12);
        assert_eq!(predictor.velocity(), 3.0);
    }
}
