use std::time::Duration;

// ---------------------------------------------------------------------------
// RetryStrategy
// ---------------------------------------------------------------------------

/// Decides whether (and after how long) a failed transport call is retried.
/// The orchestrator owns no policy of its own; it only consults the
/// strategy it was built with.
pub trait RetryStrategy: Send + Sync {
    /// Delay before retry number `attempt` (1-based). `None` gives up and
    /// surfaces the error.
    fn next_delay(&self, attempt: u32) -> Option<Duration>;
}

/// Doubling backoff with a delay ceiling and an attempt budget.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt > self.max_attempts {
            return None;
        }
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay);
        Some(delay.min(self.max_delay))
    }
}

/// Fail immediately; useful for hosts that schedule their own retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryStrategy for NoRetry {
    fn next_delay(&self, _attempt: u32) -> Option<Duration> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_ceiling() {
        let strategy = ExponentialBackoff {
            base: Duration::from_millis(100),
            max_delay: Duration::from_millis(450),
            max_attempts: 10,
        };
        assert_eq!(strategy.next_delay(1), Some(Duration::from_millis(100)));
        assert_eq!(strategy.next_delay(2), Some(Duration::from_millis(200)));
        assert_eq!(strategy.next_delay(3), Some(Duration::from_millis(400)));
        assert_eq!(strategy.next_delay(4), Some(Duration::from_millis(450)));
    }

    #[test]
    fn backoff_gives_up_after_the_attempt_budget() {
        let strategy = ExponentialBackoff {
            max_attempts: 2,
            ..ExponentialBackoff::default()
        };
        assert!(strategy.next_delay(1).is_some());
        assert!(strategy.next_delay(2).is_some());
        assert!(strategy.next_delay(3).is_none());
    }

    #[test]
    fn no_retry_never_retries() {
        assert!(NoRetry.next_delay(1).is_none());
    }
}
