// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Bounded retry and polling combinators
//!
//! Both helpers have a hard attempt ceiling. Nothing in the driver waits on
//! the backend without one.

use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use tracing::{debug, warn};

use crate::domain::backend::BackendError;
use crate::domain::config::RetryConfig;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_interval: Duration, max_interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_interval,
            max_interval,
        }
    }

    /// Policy for transient REST failures.
    pub fn requests(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, config.initial_interval, config.max_interval)
    }

    /// Fixed-interval policy for job polling.
    pub fn job_polling(config: &RetryConfig) -> Self {
        Self::new(config.job_poll_attempts, config.job_poll_interval, config.job_poll_interval)
    }

    fn schedule(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_randomization_factor(0.2)
            .with_multiplier(2.0)
            .with_max_elapsed_time(None)
            .build()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::requests(&RetryConfig::default())
    }
}

/// Run `op`, retrying transient [`BackendError`]s until the attempt ceiling.
///
/// Non-transient errors are returned immediately. When the ceiling is hit
/// the last transient error is returned unchanged.
pub async fn retry_transient<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let mut attempt: u32 = 0;
    let max_attempts = policy.max_attempts;

    backoff::future::retry_notify(
        policy.schedule(),
        || {
            attempt += 1;
            let current = attempt;
            let fut = op();
            async move {
                match fut.await {
                    Ok(value) => Ok(value),
                    Err(err) if err.is_transient() && current < max_attempts => Err(backoff::Error::transient(err)),
                    Err(err) => {
                        if err.is_transient() {
                            warn!(attempts = current, "Giving up after transient failures: {}", err);
                        }
                        Err(backoff::Error::permanent(err))
                    }
                }
            }
        },
        |err: BackendError, wait: Duration| {
            debug!(operation, ?wait, "Transient backend failure, retrying: {}", err);
        },
    )
    .await
}

/// Poll `check` until it yields a value or the attempt ceiling is reached.
///
/// `Ok(None)` means "not yet". Errors from `check` abort the poll.
pub async fn poll_until<T, F, Fut>(policy: &RetryPolicy, what: &str, mut check: F) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, BackendError>>,
{
    let mut schedule = policy.schedule();
    for attempt in 1..=policy.max_attempts {
        if let Some(value) = check().await? {
            return Ok(value);
        }
        if attempt == policy.max_attempts {
            break;
        }
        let wait = schedule.next_backoff().unwrap_or(policy.max_interval);
        debug!(attempt, ?wait, "{} still pending", what);
        tokio::time::sleep(wait).await;
    }
    Err(BackendError::Timeout(format!(
        "{} did not complete after {} attempts",
        what, policy.max_attempts
    )))
}
