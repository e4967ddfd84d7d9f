use crate::domain::HandlerStrategy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry ladder for failed reconciliations: attempt `n` is followed by a
/// delay of `n × backoff_step`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one; `None` retries forever
    pub max_attempts: Option<u32>,

    /// Linear backoff step in milliseconds
    pub backoff_step_ms: u64,
}

impl RetryPolicy {
    pub fn bounded(max_attempts: u32, backoff_step: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            backoff_step_ms: backoff_step.as_millis() as u64,
        }
    }

    /// Retry forever without delay
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            backoff_step_ms: 0,
        }
    }

    pub fn backoff_step(&self) -> Duration {
        Duration::from_millis(self.backoff_step_ms)
    }

    /// Delay to wait after the given (1-based) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff_step().saturating_mul(attempt)
    }

    /// Whether another attempt may follow `attempts_made` failed ones
    pub fn allows_retry(&self, attempts_made: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempts_made < max,
            None => true,
        }
    }

    /// Attempts made once a notification carrying `retry` has failed, or
    /// `None` when it must be dropped. A counter at its ceiling is treated
    /// as exhausted so it never wraps back to a first attempt.
    pub fn next_attempt(&self, retry: u32) -> Option<u32> {
        let attempts = retry.checked_add(1).filter(|attempts| *attempts < u32::MAX)?;
        self.allows_retry(attempts).then_some(attempts)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatHandlerConfig {
    /// Which handler reconciles incoming notifications
    pub strategy: HandlerStrategy,

    /// Worker tasks of the process-all handler (default: 5)
    pub workers: usize,

    /// Default: 5 attempts, 50ms step
    pub synchronous_retry: RetryPolicy,

    /// Default: 5 attempts, 50ms step
    pub compacting_retry: RetryPolicy,

    /// Default: unbounded, no delay
    pub process_all_retry: RetryPolicy,
}

impl Default for HeartbeatHandlerConfig {
    fn default() -> Self {
        Self {
            strategy: HandlerStrategy::Synchronous,
            workers: 5,
            synchronous_retry: RetryPolicy::bounded(5, Duration::from_millis(50)),
            compacting_retry: RetryPolicy::bounded(5, Duration::from_millis(50)),
            process_all_retry: RetryPolicy::unbounded(),
        }
    }
}
