use std::time::Duration;

/// When to poll next. `None` means give up: the poller reports a timeout,
/// not a failure.
pub trait PollStrategy: Send + Sync {
    /// Delay before poll number `attempt` (0-based), or `None` once the
    /// strategy is exhausted.
    fn next_delay(&self, attempt: u32) -> Option<Duration>;
}

/// Constant interval with an attempt ceiling.
#[derive(Debug, Clone)]
pub struct FixedInterval {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollStrategy for FixedInterval {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        (attempt < self.max_attempts).then_some(self.interval)
    }
}

/// Capped exponential backoff. Preferred for long GPU runs.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 60,
        }
    }
}

impl PollStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let scaled = self.initial.as_secs_f64() * self.factor.max(1.0).powi(attempt.min(64) as i32);
        let delay = Duration::try_from_secs_f64(scaled.max(0.0)).unwrap_or(self.max_delay);
        Some(delay.min(self.max_delay))
    }
}
