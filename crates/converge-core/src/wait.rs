//! Bounded wait-until-predicate polling.
//!
//! Provides the primitive every convergence operation is built on: evaluate
//! a check, compare it with a target, sleep a fixed interval, repeat until
//! the deadline computed at entry has passed.

use crate::error::{ConvergeError, Result};
use converge_common::defaults::{DEFAULT_POLL_INTERVAL_SECS, DEFAULT_POLL_MAX_MINUTES};
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Polling parameters for one wait.
///
/// `interval` may be zero, which turns the wait into a busy-poll that
/// issues one check per scheduler turn. That is fine for cheap local
/// checks; against a remote API it burns request quota and should be
/// avoided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Delay between checks
    pub interval: Duration,
    /// Maximum total time to wait before timeout
    pub max_duration: Duration,
    /// Evaluate exactly once and report the result instead of waiting
    pub immediate: bool,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self::from_minutes(DEFAULT_POLL_INTERVAL_SECS, DEFAULT_POLL_MAX_MINUTES)
    }
}

impl PollConfig {
    pub fn new(interval: Duration, max_duration: Duration) -> Self {
        Self {
            interval,
            max_duration,
            immediate: false,
        }
    }

    pub fn from_minutes(interval_secs: u64, max_minutes: u64) -> Self {
        Self::new(
            Duration::from_secs(interval_secs),
            Duration::from_secs(max_minutes * 60),
        )
    }

    /// Single evaluation, no sleep, no timeout error.
    pub fn immediate() -> Self {
        Self {
            interval: Duration::ZERO,
            max_duration: Duration::ZERO,
            immediate: true,
        }
    }

    pub(crate) fn deadline(&self, start: Instant) -> Instant {
        start + self.max_duration
    }
}

/// Wait until `evaluate` yields `target`.
///
/// The check always runs before the first sleep, so an already-satisfied
/// condition returns with no delay.
///
/// # Returns
/// * `Ok(true)` - the check matched `target`
/// * `Ok(false)` - immediate mode only: the single check did not match
/// * `Err(ConvergeError::Timeout)` - deadline passed without a match
/// * `Err(_)` - the check itself failed; its errors are never swallowed
pub async fn poll<T, F, Fut>(config: &PollConfig, what: &str, target: &T, mut evaluate: F) -> Result<bool>
where
    T: PartialEq + Debug,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let deadline = config.deadline(start);
    let mut attempts = 0u32;

    loop {
        attempts += 1;

        let observed = evaluate().await?;
        if observed == *target {
            debug!(what = %what, attempts, "Converged");
            return Ok(true);
        }

        if config.immediate {
            return Ok(false);
        }

        if Instant::now() >= deadline {
            return Err(ConvergeError::Timeout {
                what: what.to_string(),
                target: format!("{:?}", target),
                pending: vec![what.to_string()],
                waited: start.elapsed(),
            });
        }

        debug!(
            what = %what,
            attempt = attempts,
            observed = ?observed,
            delay_ms = config.interval.as_millis(),
            "Not converged, retrying"
        );
        tokio::time::sleep(config.interval).await;
    }
}

/// [`poll`] specialised to boolean checks with target `true`.
pub async fn poll_until<F, Fut>(config: &PollConfig, what: &str, evaluate: F) -> Result<bool>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    poll(config, what, &true, evaluate).await
}
