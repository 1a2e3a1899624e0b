use std::thread;
use std::time::Duration;
use tracing::warn;

use super::StoreError;

/// Bounded retries for transient storage failures
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 120,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_backoff_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_backoff_ms,
        }
    }

    /// A policy that tries exactly once
    pub fn single_attempt() -> Self {
        Self::new(1, 0)
    }

    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        Duration::from_millis(self.base_backoff_ms.saturating_mul(attempt as u64))
    }

    /// Run `op` until it succeeds, fails permanently, or the budget is spent.
    ///
    /// Blocks the calling thread between attempts.
    pub fn run<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut attempt = 1usize;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    warn!(
                        key = what,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "transient storage error, retrying"
                    );
                    thread::sleep(self.delay_for_attempt(attempt));
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreErrorCode;

    #[test]
    fn test_retries_transient_then_succeeds() {
        let policy = RetryPolicy::new(3, 0);
        let mut calls = 0;
        let result = policy.run("r1/main.js", || {
            calls += 1;
            if calls < 3 {
                Err(StoreError::new(StoreErrorCode::Network, "reset"))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result, Ok(3));
    }

    #[test]
    fn test_gives_up_after_budget() {
        let policy = RetryPolicy::new(2, 0);
        let mut calls = 0;
        let result: Result<(), _> = policy.run("k", || {
            calls += 1;
            Err(StoreError::new(StoreErrorCode::Network, "reset"))
        });
        assert!(result.is_err());
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_permanent_errors_not_retried() {
        let policy = RetryPolicy::new(5, 0);
        let mut calls = 0;
        let result: Result<(), _> = policy.run("k", || {
            calls += 1;
            Err(StoreError::new(StoreErrorCode::NotFound, "gone"))
        });
        assert_eq!(result.unwrap_err().code, StoreErrorCode::NotFound);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_backoff_grows_linearly() {
        let policy = RetryPolicy::new(4, 100);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
        assert_eq!(RetryPolicy::new(0, 10).max_attempts, 1);
    }
}
