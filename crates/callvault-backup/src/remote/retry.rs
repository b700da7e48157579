//! Bounded retry for remote operations
//!
//! Exponential backoff with jitter, capped by an attempt count and a total
//! time budget. Permanent errors end the loop at once; cancellation aborts
//! the attempt in flight.

use std::{future::Future, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::RemoteError;

/// Bounded retry with exponential backoff and jitter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts per (set, target), including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_backoff_ms: u64,
    /// Upper bound for a single delay
    pub max_backoff_ms: u64,
    /// Total wall-clock budget across all attempts
    pub total_budget_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 2_000,
            max_backoff_ms: 60_000,
            total_budget_secs: 1_800,
        }
    }
}

/// How a retried operation ended
#[derive(Debug)]
pub enum RetryOutcome<T> {
    /// Succeeded after `attempts`
    Succeeded {
        /// Value of the successful attempt
        value: T,
        /// Attempts made, including the successful one
        attempts: u32,
    },
    /// Gave up on a permanent error, the attempt cap or the time budget
    GaveUp {
        /// Error of the last attempt
        error: RemoteError,
        /// Attempts made
        attempts: u32,
    },
    /// Cancellation token fired
    Cancelled {
        /// Attempts started before cancellation
        attempts: u32,
    },
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self
            .initial_backoff_ms
            .saturating_mul(1u64 << attempt.saturating_sub(1).min(16))
            .min(self.max_backoff_ms);
        let jitter = rand::random::<u64>() % (base / 4).max(1);
        Duration::from_millis(base + jitter)
    }

    /// Run `op` until it succeeds, fails permanently, or the attempt count
    /// or time budget runs out. Cancellation aborts the in-flight attempt.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        op_name: &str,
        mut op: F,
    ) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let deadline = Instant::now() + Duration::from_secs(self.total_budget_secs);
        let max_attempts = self.max_attempts.max(1);
        let mut attempts = 0;

        loop {
            attempts += 1;
            let result = tokio::select! {
                _ = cancel.cancelled() => return RetryOutcome::Cancelled { attempts },
                res = tokio::time::timeout_at(deadline, op()) => res,
            };

            let error = match result {
                Ok(Ok(value)) => return RetryOutcome::Succeeded { value, attempts },
                Ok(Err(e)) => e,
                Err(_) => RemoteError::Transient(format!(
                    "{op_name}: time budget of {}s exhausted",
                    self.total_budget_secs
                )),
            };

            if !error.is_transient() || attempts >= max_attempts {
                return RetryOutcome::GaveUp { error, attempts };
            }

            let delay = self.delay_for(attempts);
            if Instant::now() + delay >= deadline {
                return RetryOutcome::GaveUp { error, attempts };
            }
            tracing::warn!(
                "{op_name}: transient error (attempt {}/{}), retrying in {:?}: {error}",
                attempts,
                max_attempts,
                delay,
            );

            tokio::select! {
                _ = cancel.cancelled() => return RetryOutcome::Cancelled { attempts },
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
