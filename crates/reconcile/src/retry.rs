//! Shared retry policy for calls to the accounting API
//!
//! Token exchange/refresh and entity reads all go through [`RetryPolicy::run`],
//! so backoff behaviour is configured in one place.

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio_retry::RetryIf;

/// Errors that know whether another attempt could succeed
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Retry with multiplicative backoff
///
/// `max_attempts` counts the first call, so a policy with `max_attempts = 3`
/// sleeps at most twice: `base_delay`, then `base_delay * multiplier`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, multiplier: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            multiplier: multiplier.max(1),
        }
    }

    /// A policy that makes exactly one attempt
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, 1)
    }

    /// Sleep durations between attempts
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let base = self.base_delay;
        let multiplier = self.multiplier;
        (0..self.max_attempts.saturating_sub(1))
            .map(move |n| base.saturating_mul(multiplier.saturating_pow(n)))
    }

    /// Run `action` until it succeeds, fails with a non-retryable error,
    /// or the attempt budget is spent
    pub async fn run<T, E, A, Fut>(&self, operation: &'static str, mut action: A) -> Result<T, E>
    where
        A: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let attempts = AtomicU32::new(0);
        let max_attempts = self.max_attempts;

        RetryIf::spawn(
            self.delays(),
            || {
                attempts.fetch_add(1, Ordering::Relaxed);
                action()
            },
            |err: &E| {
                let attempt = attempts.load(Ordering::Relaxed);
                let retry = err.is_retryable();
                if retry && attempt < max_attempts {
                    tracing::warn!(
                        operation = operation,
                        attempt = attempt,
                        max_attempts = max_attempts,
                        error = %err,
                        "Retryable error, backing off"
                    );
                }
                retry
            },
        )
        .await
    }
}
