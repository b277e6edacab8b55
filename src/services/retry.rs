// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Bounded retry with backoff, shared by every service.

use crate::error::{AppError, ErrorKind, Result};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `attempt * base`
    Linear,
    /// `base * 2^(attempt - 1)`
    Exponential,
}

/// Retry policy: attempt budget, delay schedule and delay cap.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn linear(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay: base_delay * max_attempts.max(1),
            backoff: Backoff::Linear,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            backoff: Backoff::Exponential,
        }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self::linear(1, Duration::ZERO)
    }

    /// Delay after the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.backoff {
            Backoff::Linear => self.base_delay.saturating_mul(attempt),
            Backoff::Exponential => self
                .base_delay
                .saturating_mul(2u32.saturating_pow(attempt - 1)),
        };
        delay.min(self.max_delay)
    }

    /// Run `op`, retrying errors for which [`AppError::is_retryable`] holds.
    pub async fn run<T, F, Fut>(&self, op_name: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_if(op_name, AppError::is_retryable, op).await
    }

    /// Run `op`, retrying only transient connectivity errors.
    pub async fn run_transient<T, F, Fut>(&self, op_name: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_if(op_name, |e| e.kind() == ErrorKind::Network, op)
            .await
    }

    /// Run `op`, retrying errors accepted by `should_retry`.
    pub async fn run_if<T, F, Fut, P>(&self, op_name: &str, should_retry: P, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&AppError) -> bool,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts && should_retry(&e) => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        op = op_name,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after transient error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn linear_delays_grow_by_base() {
        let p = RetryPolicy::linear(3, Duration::from_millis(100));
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(300));
    }

    #[test]
    fn exponential_delays_are_capped() {
        let p = RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_millis(250));
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(250));
        assert_eq!(p.delay_for(30), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn retries_transient_errors_up_to_budget() {
        let calls = AtomicU32::new(0);
        let p = RetryPolicy::linear(3, Duration::from_millis(1));
        let result: Result<()> = p
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AppError::Unavailable("down".to_string()))
            })
            .await;
        assert!(matches!(result, Err(AppError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn never_retries_validation_errors() {
        let calls = AtomicU32::new(0);
        let p = RetryPolicy::linear(3, Duration::from_millis(1));
        let result: Result<()> = p
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AppError::Validation("bad".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failure() {
        let calls = AtomicU32::new(0);
        let p = RetryPolicy::exponential(3, Duration::from_millis(1), Duration::from_millis(5));
        let value = p
            .run_transient("test", || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(AppError::Timeout("slow".to_string()))
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn transient_only_skips_unknown_errors() {
        let calls = AtomicU32::new(0);
        let p = RetryPolicy::linear(3, Duration::from_millis(1));
        let _: Result<()> = p
            .run_transient("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AppError::Unknown("?".to_string()))
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
