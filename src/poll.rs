//! Bounded, cancellable polling
//!
//! The container engine's create/remove/list operations are only eventually
//! consistent, so every wait in this crate (node readiness, removal completion)
//! goes through [`poll_until`].

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{DeployError, Result};

/// Interval and upper bound of a polling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollOptions {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Evaluate `check` every `interval` until it reports `true`.
///
/// Returns [`DeployError::Cancelled`] when `cancel` fires or `timeout` elapses,
/// and propagates the first error `check` returns.
pub async fn poll_until<F, Fut>(
    what: &str,
    opts: PollOptions,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + opts.timeout;
    let stopped = || DeployError::Cancelled(format!("stopped waiting for {}", what));
    let timed_out = || {
        DeployError::Cancelled(format!(
            "timed out after {:?} waiting for {}",
            opts.timeout, what
        ))
    };
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(stopped());
        }

        attempt += 1;
        // a slow check must not outlive the token or the deadline
        let satisfied = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(stopped()),
            _ = tokio::time::sleep_until(deadline) => return Err(timed_out()),
            outcome = check() => outcome?,
        };
        if satisfied {
            trace!(what, attempt, "condition satisfied");
            return Ok(());
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(timed_out());
        }

        let sleep_for = opts.interval.min(deadline - now);
        tokio::select! {
            _ = cancel.cancelled() => return Err(stopped()),
            _ = tokio::time::sleep(sleep_for) => {}
        }
    }
}
