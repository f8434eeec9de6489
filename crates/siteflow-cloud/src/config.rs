//! Engine tuning

use crate::retry::RetryConfig;
use std::time::Duration;

/// Convergence engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum operations running at the same time
    pub max_parallel: usize,

    /// Retry policy for transient provider errors
    pub retry: RetryConfig,

    /// Poll interval for readiness conditions
    pub validation_interval: Duration,

    /// Deadline of a single readiness wait
    pub validation_timeout: Duration,

    /// Deadline of a whole apply
    pub plan_timeout: Duration,

    /// How often a state write is retried after losing a CAS race
    pub state_conflict_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            retry: RetryConfig::default(),
            validation_interval: Duration::from_secs(10),
            validation_timeout: Duration::from_secs(45 * 60),
            plan_timeout: Duration::from_secs(60 * 60),
            state_conflict_retries: 3,
        }
    }
}

impl EngineConfig {
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_validation(mut self, interval: Duration, timeout: Duration) -> Self {
        self.validation_interval = interval;
        self.validation_timeout = timeout;
        self
    }

    pub fn with_plan_timeout(mut self, timeout: Duration) -> Self {
        self.plan_timeout = timeout;
        self
    }
}
