use std::time;

/// Backoff schedule the sink publisher follows while a batch keeps failing with
/// a transient error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<time::Duration>,
    /// Total delivery attempts before giving up on a batch, unlimited when None.
    max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: Option<time::Duration>,
        max_attempts: Option<u32>,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
            max_attempts,
        }
    }

    /// Time to wait after the given number of failed attempts (0 for the first retry).
    pub fn time_until_next_retry(&self, attempt: u32) -> time::Duration {
        let candidate_interval = self
            .backoff_coefficient
            .checked_pow(attempt)
            .and_then(|factor| self.initial_interval.checked_mul(factor));

        match (candidate_interval, self.maximum_interval) {
            (Some(candidate), Some(max_interval)) => std::cmp::min(candidate, max_interval),
            (None, Some(max_interval)) => max_interval,
            (Some(candidate), None) => candidate,
            (None, None) => time::Duration::MAX,
        }
    }

    /// Whether another attempt is allowed after `attempts` have failed.
    pub fn should_retry(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_millis(200),
            maximum_interval: Some(time::Duration::from_secs(30)),
            max_attempts: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0, 200 ; "first retry")]
    #[test_case(1, 400 ; "second retry")]
    #[test_case(3, 1600 ; "fourth retry")]
    #[test_case(7, 25600 ; "just under the cap")]
    #[test_case(8, 30000 ; "capped")]
    #[test_case(200, 30000 ; "overflowing attempt count stays capped")]
    fn default_backoff(attempt: u32, expected_ms: u64) {
        assert_eq!(
            RetryPolicy::default().time_until_next_retry(attempt),
            time::Duration::from_millis(expected_ms)
        );
    }

    #[test]
    fn attempts_are_bounded_when_configured() {
        let unlimited = RetryPolicy::default();
        assert!(unlimited.should_retry(10_000));

        let bounded = RetryPolicy::new(2, time::Duration::from_millis(10), None, Some(3));
        assert!(bounded.should_retry(2));
        assert!(!bounded.should_retry(3));
        assert_eq!(
            bounded.time_until_next_retry(2),
            time::Duration::from_millis(40)
        );
    }
}
