use std::time::Duration;

/// Tunables of the saga orchestrator.
#[derive(Debug, Clone)]
pub struct SagaConfig {
    /// Deadline applied to every individual store call
    pub step_timeout: Duration,
    /// How many times a refund is attempted before escalating
    pub compensation_attempts: u32,
    /// Delay before the first refund retry; doubles on each attempt
    pub compensation_backoff: Duration,
    /// Largest page `get_history` accepts
    pub max_page_size: u32,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(5),
            compensation_attempts: 3,
            compensation_backoff: Duration::from_millis(50),
            max_page_size: 100,
        }
    }
}

impl SagaConfig {
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn with_compensation_attempts(mut self, attempts: u32) -> Self {
        self.compensation_attempts = attempts.max(1);
        self
    }

    pub fn with_compensation_backoff(mut self, backoff: Duration) -> Self {
        self.compensation_backoff = backoff;
        self
    }

    pub fn with_max_page_size(mut self, size: u32) -> Self {
        self.max_page_size = size;
        self
    }
}
