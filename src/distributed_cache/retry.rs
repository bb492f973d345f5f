//! Retry loop for optimistic concurrency
//!
//! An attempt that fails with `Error::ConditionNotMet` lost a race with
//! another writer and is run again from scratch after a backoff. Every other
//! outcome, success or error, ends the loop immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Attempts made by metadata updates before giving up
pub const DEFAULT_MAX_ATTEMPTS: u32 = 20;

/// Pause between conflicting attempts
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(10);

/// How conflicting attempts are retried
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Base delay after a conflict
    pub backoff: Duration,
    /// When set, the delay doubles per attempt up to this cap
    pub max_backoff: Option<Duration>,
    /// Draw the actual delay uniformly from `[0, delay]`
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
            max_backoff: None,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
            ..Default::default()
        }
    }

    /// Double the delay after each conflict, never exceeding `cap`.
    pub fn with_exponential_backoff(mut self, cap: Duration) -> Self {
        self.max_backoff = Some(cap);
        self
    }

    /// Randomize each delay to spread out competing writers.
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let base = match self.max_backoff {
            Some(cap) => {
                let shift = attempt.saturating_sub(1).min(31);
                self.backoff
                    .checked_mul(1u32 << shift)
                    .map_or(cap, |d| d.min(cap))
            }
            None => self.backoff,
        };

        if self.jitter && !base.is_zero() {
            let micros = base.as_micros().min(u64::MAX as u128) as u64;
            Duration::from_micros(rand::thread_rng().gen_range(0..=micros))
        } else {
            base
        }
    }
}

/// Run `attempt` until it succeeds, fails with anything other than a
/// conflict, or `policy.max_attempts` attempts have conflicted.
///
/// The closure receives the 1-based attempt number and must redo all of its
/// work, including reads, on every call.
pub async fn retry_on_conflict<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    path: &str,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);

    for n in 1..=max_attempts {
        match attempt(n).await {
            Ok(value) => {
                if n > 1 {
                    debug!(operation, path, "Succeeded after {} attempts", n);
                }
                return Ok(value);
            }
            Err(e) if e.is_condition_not_met() => {
                debug!(
                    operation,
                    path, "Conflicting update (attempt {}/{})", n, max_attempts
                );
                if n < max_attempts {
                    tokio::time::sleep(policy.delay_after(n)).await;
                }
            }
            Err(e) => return Err(e),
        }
    }

    warn!(
        operation,
        path, "Giving up after {} conflicting attempts", max_attempts
    );
    Err(Error::RetriesExhausted {
        operation: operation.to_string(),
        path: path.to_string(),
        attempts: max_attempts,
    })
}
