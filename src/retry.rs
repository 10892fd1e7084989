//! The single place where retry policy for remote calls is defined.

use crate::core::{MigrateError, Result};
use log::{error, warn};
use std::future::Future;
use std::time::Duration;

/// Configuration for retrying transient remote failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: usize,
    /// Base duration in milliseconds for backoff calculation.
    pub base_backoff_ms: u64,
    /// Maximum duration in milliseconds for backoff.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_backoff_ms: 2_000,
            max_backoff_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_backoff_ms: u64) -> Self {
        Self {
            max_attempts,
            base_backoff_ms,
            ..Self::default()
        }
    }

    /// A policy that never waits, for tests and dry runs.
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            base_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Effective attempt limit; never below one.
    pub fn attempts(&self) -> usize {
        self.max_attempts.max(1)
    }

    /// Computes exponential retry backoff in milliseconds for the wait that
    /// follows failed attempt number `attempt` (1-based).
    pub fn backoff_ms(&self, attempt: usize) -> u64 {
        let base = self.base_backoff_ms;
        let cap = self.max_backoff_ms.max(base);

        let mut backoff = base;
        for _ in 1..attempt {
            backoff = backoff.saturating_mul(2).min(cap);
        }
        backoff
    }
}

/// Runs `operation` until it succeeds, fails permanently, or the policy's
/// attempt budget is spent.
///
/// Errors for which `is_transient` returns `false` are returned after the
/// first attempt. On exhaustion the last transient error is returned as is.
pub async fn execute_with_retry<T, F, Fut, P>(
    policy: &RetryPolicy,
    is_transient: P,
    label: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&MigrateError) -> bool,
{
    let max_attempts = policy.attempts();
    let mut attempt = 1usize;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !is_transient(&err) {
                    return Err(err);
                }
                if attempt >= max_attempts {
                    error!(
                        "{} failed after {} attempts: {}",
                        label, max_attempts, err
                    );
                    return Err(err);
                }

                let backoff_ms = policy.backoff_ms(attempt);
                warn!(
                    "{} attempt {} of {} failed: {} (backoff={}ms)",
                    label, attempt, max_attempts, err, backoff_ms
                );
                if backoff_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
                attempt += 1;
            }
        }
    }
}
