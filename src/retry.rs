use crate::breaker::CircuitState;
use crate::config::RetryConfig;
use crate::generation::FallbackReason;
use std::time::Duration;

/// What to do with a job whose generation call just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue at the front of its tier after the delay.
    Retry(Duration),
    Fallback(FallbackReason),
}

impl RetryConfig {
    /// Exponential backoff for the given attempt (1-based), capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// `retry_count` already includes the failure being decided on.
    pub fn decide(&self, retry_count: u32, breaker: CircuitState) -> RetryDecision {
        if breaker == CircuitState::Open {
            RetryDecision::Fallback(FallbackReason::CircuitOpen)
        } else if retry_count < self.max_retries {
            RetryDecision::Retry(self.backoff(retry_count))
        } else {
            RetryDecision::Fallback(FallbackReason::RetriesExhausted)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = config();
        assert_eq!(config.backoff(1), Duration::from_secs(1));
        assert_eq!(config.backoff(2), Duration::from_secs(2));
        assert_eq!(config.backoff(3), Duration::from_secs(4));
        assert_eq!(config.backoff(4), Duration::from_secs(8));
        assert_eq!(config.backoff(5), Duration::from_secs(10));
        assert_eq!(config.backoff(40), Duration::from_secs(10));
    }

    #[test]
    fn test_retries_below_ceiling() {
        let config = config();
        assert_eq!(
            config.decide(1, CircuitState::Closed),
            RetryDecision::Retry(Duration::from_secs(1))
        );
        assert_eq!(
            config.decide(2, CircuitState::HalfOpen),
            RetryDecision::Retry(Duration::from_secs(2))
        );
    }

    #[test]
    fn test_falls_back_when_exhausted() {
        assert_eq!(
            config().decide(3, CircuitState::Closed),
            RetryDecision::Fallback(FallbackReason::RetriesExhausted)
        );
    }

    #[test]
    fn test_open_breaker_never_retries() {
        assert_eq!(
            config().decide(1, CircuitState::Open),
            RetryDecision::Fallback(FallbackReason::CircuitOpen)
        );
    }
}
