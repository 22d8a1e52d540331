use std::time::Duration;

/// Bounded exponential backoff.
///
/// Callers stop after `max_attempts`; nothing in the feed retries forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64, max_attempts: u32) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Whether another attempt may follow the zero-based `attempt` that just failed.
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt.saturating_add(1) < self.max_attempts
    }

    pub fn delay_for_attempt(&self, attempt: u32, retry_after_hint_ms: Option<u64>) -> Duration {
        let shift = attempt.min(20);
        let multiplier = 1_u64 << shift;
        let calculated = self.base_delay_ms.saturating_mul(multiplier);
        let hinted = retry_after_hint_ms.unwrap_or(0);
        let bounded = calculated.max(hinted).min(self.max_delay_ms);
        Duration::from_millis(bounded)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(250, 4_000, 3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_with_base_delay() {
        let policy = RetryPolicy::new(250, 8_000, 3);
        assert_eq!(
            policy.delay_for_attempt(0, None),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn scales_exponentially_for_attempts() {
        let policy = RetryPolicy::new(100, 10_000, 5);
        assert_eq!(
            policy.delay_for_attempt(3, None),
            Duration::from_millis(800)
        );
    }

    #[test]
    fn caps_delay_at_max() {
        let policy = RetryPolicy::new(1_000, 4_000, 8);
        assert_eq!(
            policy.delay_for_attempt(5, None),
            Duration::from_millis(4_000)
        );
    }

    #[test]
    fn honors_retry_after_hint_when_larger() {
        let policy = RetryPolicy::new(500, 20_000, 3);
        assert_eq!(
            policy.delay_for_attempt(1, Some(10_000)),
            Duration::from_millis(10_000)
        );
    }

    #[test]
    fn stops_after_max_attempts() {
        let policy = RetryPolicy::default();
        assert!(policy.allows_retry_after(0));
        assert!(policy.allows_retry_after(1));
        assert!(!policy.allows_retry_after(2));

        let single = policy.with_max_attempts(0);
        assert_eq!(single.max_attempts(), 1);
        assert!(!single.allows_retry_after(0));
    }
}
