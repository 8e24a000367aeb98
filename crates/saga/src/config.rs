//! Saga configuration loaded from environment variables.

use std::time::Duration;

use crate::definition::{CompensationStrategy, RetryPolicy};

/// Reads from environment variables:
/// - `SAGA_MAX_ATTEMPTS` (default: `3`)
/// - `SAGA_INITIAL_DELAY_MS` (default: `200`)
/// - `SAGA_BACKOFF_MULTIPLIER` (default: `2.0`)
/// - `SAGA_MAX_DELAY_MS` (default: `5000`)
/// - `SAGA_STEP_TIMEOUT_MS` (default: `30000`)
/// - `SAGA_COMPENSATION_STRATEGY` (`sequential`, `parallel` or `best_effort`;
///   default: `sequential`)
/// - `IDEMPOTENCY_TTL_DAYS` (default: `30`)
///
/// Missing or unparseable values fall back to the default.
#[derive(Debug, Clone, PartialEq)]
pub struct SagaConfig {
    pub retry: RetryPolicy,
    pub step_timeout: Duration,
    pub compensation_strategy: CompensationStrategy,
    pub idempotency_ttl_days: i64,
}

impl SagaConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            retry: RetryPolicy {
                max_attempts: env_parse("SAGA_MAX_ATTEMPTS")
                    .filter(|n: &u32| *n > 0)
                    .unwrap_or(defaults.retry.max_attempts),
                initial_delay: env_parse("SAGA_INITIAL_DELAY_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.retry.initial_delay),
                backoff_multiplier: env_parse("SAGA_BACKOFF_MULTIPLIER")
                    .filter(|m: &f64| m.is_finite() && *m >= 1.0)
                    .unwrap_or(defaults.retry.backoff_multiplier),
                max_delay: env_parse("SAGA_MAX_DELAY_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.retry.max_delay),
            },
            step_timeout: env_parse("SAGA_STEP_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.step_timeout),
            compensation_strategy: std::env::var("SAGA_COMPENSATION_STRATEGY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.compensation_strategy),
            idempotency_ttl_days: env_parse("IDEMPOTENCY_TTL_DAYS")
                .filter(|d: &i64| *d > 0)
                .unwrap_or(defaults.idempotency_ttl_days),
        }
    }

    /// Same settings with a different retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_compensation_strategy(mut self, strategy: CompensationStrategy) -> Self {
        self.compensation_strategy = strategy;
        self
    }
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            step_timeout: Duration::from_millis(30_000),
            compensation_strategy: CompensationStrategy::Sequential,
            idempotency_ttl_days: idempotency::DEFAULT_TTL_DAYS,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = SagaConfig::default();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_delay, Duration::from_millis(200));
        assert_eq!(config.retry.backoff_multiplier, 2.0);
        assert_eq!(config.retry.max_delay, Duration::from_millis(5_000));
        assert_eq!(config.step_timeout, Duration::from_secs(30));
        assert_eq!(config.compensation_strategy, CompensationStrategy::Sequential);
        assert_eq!(config.idempotency_ttl_days, 30);
    }

    #[test]
    fn test_builders() {
        let config = SagaConfig::default()
            .with_compensation_strategy(CompensationStrategy::BestEffort)
            .with_retry(RetryPolicy::no_retry());
        assert_eq!(config.compensation_strategy, CompensationStrategy::BestEffort);
        assert_eq!(config.retry.max_attempts, 1);
    }
}
