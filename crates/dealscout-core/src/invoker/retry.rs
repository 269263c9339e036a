//! Retry backoff

use std::time::Duration;

use rand::Rng;

/// How transient failures against one backend are retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_millis(1000),
            backoff_max: Duration::from_millis(30_000),
        }
    }
}

impl RetryPolicy {
    /// Total attempts allowed for one call
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before the retry that follows `attempt` (1-based)
    ///
    /// Exponential in the attempt number and capped at `backoff_max`; a
    /// server-suggested wait wins when larger. Up to 10% jitter is added.
    pub fn backoff(&self, attempt: u32, suggested: Duration) -> Duration {
        let base = self.backoff_base.as_millis() as u64;
        let cap = self.backoff_max.as_millis() as u64;
        let exponent = attempt.saturating_sub(1).min(32);
        let exponential = base.saturating_mul(1u64 << exponent).min(cap);

        let delay = exponential.max(suggested.as_millis() as u64);
        let jitter = rand::thread_rng().gen_range(0..=delay / 10);
        Duration::from_millis(delay + jitter)
    }
}

/// Extract a retry-after value in seconds from an error body
pub(crate) fn extract_retry_after(body: &str) -> Option<u64> {
    let json = serde_json::from_str::<serde_json::Value>(body).ok()?;
    json.get("retry_after")
        .and_then(|v| v.as_u64())
        .or_else(|| {
            json.get("error")
                .and_then(|e| e.get("retry_after"))
                .and_then(|v| v.as_u64())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_millis(1000),
        }
    }

    #[test]
    fn test_backoff_grows_exponentially() {
        let policy = policy();
        let first = policy.backoff(1, Duration::ZERO);
        let second = policy.backoff(2, Duration::ZERO);
        let third = policy.backoff(3, Duration::ZERO);

        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(110));
        assert!(second >= Duration::from_millis(200) && second <= Duration::from_millis(220));
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(440));
    }

    #[test]
    fn test_backoff_is_capped() {
        let delay = policy().backoff(20, Duration::ZERO);
        assert!(delay >= Duration::from_millis(1000) && delay <= Duration::from_millis(1100));
    }

    #[test]
    fn test_suggested_wait_wins_when_larger() {
        let delay = policy().backoff(1, Duration::from_secs(5));
        assert!(delay >= Duration::from_secs(5));
    }

    #[test]
    fn test_max_attempts() {
        assert_eq!(policy().max_attempts(), 4);
        let none = RetryPolicy {
            max_retries: 0,
            ..policy()
        };
        assert_eq!(none.max_attempts(), 1);
    }

    #[test]
    fn test_extract_retry_after() {
        assert_eq!(extract_retry_after(r#"{"retry_after": 30}"#), Some(30));
        assert_eq!(extract_retry_after(r#"{"error": {"retry_after": 60}}"#), Some(60));
        assert_eq!(extract_retry_after(r#"{"message": "rate limited"}"#), None);
        assert_eq!(extract_retry_after("not json"), None);
    }
}
