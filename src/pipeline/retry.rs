//! Retry policy and the injectable sleep used between attempts.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::PipelineConfig;

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Attempt cap and exponential backoff for retryable step failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per step before the record is failed.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.backoff_base_ms),
            max_delay: Duration::from_millis(cfg.backoff_max_ms),
        }
    }

    /// `true` once `attempt` failed attempts used up the budget.
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }

    /// Delay before retrying after the `attempt`-th failure (1-based):
    /// `base * 2^(attempt - 1)`, capped at `max_delay`.
    ///
    /// ```
    /// use std::time::Duration;
    /// use arxiv_to_speech::pipeline::RetryPolicy;
    ///
    /// let p = RetryPolicy {
    ///     max_attempts: 3,
    ///     base_delay: Duration::from_secs(2),
    ///     max_delay: Duration::from_secs(5),
    /// };
    /// assert_eq!(p.backoff(1), Duration::from_secs(2));
    /// assert_eq!(p.backoff(2), Duration::from_secs(4));
    /// assert_eq!(p.backoff(3), Duration::from_secs(5));
    /// ```
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Sleeper
// ---------------------------------------------------------------------------

/// How `run_to_completion` waits out a backoff.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, delay: Duration);
}

/// Real sleep on the tokio timer.
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use super::*;

    /// Returns at once and remembers every requested delay.
    #[derive(Default)]
    pub struct RecordingSleeper {
        pub delays: Mutex<Vec<Duration>>,
    }

    impl RecordingSleeper {
        pub fn delays(&self) -> Vec<Duration> {
            self.delays.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, delay: Duration) {
            self.delays.lock().unwrap().push(delay);
        }
    }
}
