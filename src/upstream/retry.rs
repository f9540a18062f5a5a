use std::time::Duration;

/// Bounded retry with exponential backoff and a per-attempt deadline.
///
/// The delay before retry `n` (zero-based) is `base_delay * 2^n`.  There is
/// no jitter and no cap beyond `max_attempts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    timeout: Duration,
    base_delay: Duration,
    retry_statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            3,
            Duration::from_secs(30),
            Duration::from_secs(1),
            vec![502, 503],
        )
    }
}

impl RetryPolicy {
    /// `max_attempts` is clamped to at least one.
    pub fn new(
        max_attempts: u32,
        timeout: Duration,
        base_delay: Duration,
        retry_statuses: Vec<u16>,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            timeout,
            base_delay,
            retry_statuses,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[cfg(test)]
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retry_statuses.contains(&status)
    }

    /// Delay to sleep after the failed attempt with zero-based index
    /// `attempt`.  Saturates instead of overflowing.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.checked_mul(factor).unwrap_or(Duration::MAX)
    }
}
