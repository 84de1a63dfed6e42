//! The retry driver: backoff source, stop-predicate, and timer composed as
//! independent, injectable strategies.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::context::RunContext;
use crate::error::StepError;

/// What a [`Backoff`] wants to happen after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffDecision {
    /// Wait this long, then try again.
    Wait(Duration),
    /// Give up; no further attempts.
    Stop,
}

/// Computes the wait before the next attempt, given the (0-indexed) attempt
/// that just finished.
pub trait Backoff: Send + Sync {
    fn next(&self, attempt: u32) -> BackoffDecision;
}

/// No wait at all between attempts, still bounded by `max_attempts`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackoff;

impl Backoff for NoBackoff {
    fn next(&self, _attempt: u32) -> BackoffDecision {
        BackoffDecision::Wait(Duration::ZERO)
    }
}

/// A constant delay between attempts.
#[derive(Debug, Clone, Copy)]
pub struct FixedBackoff(pub Duration);

impl Backoff for FixedBackoff {
    fn next(&self, _attempt: u32) -> BackoffDecision {
        BackoffDecision::Wait(self.0)
    }
}

/// Exponential backoff with a multiplier and a cap.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
}

impl Backoff for ExponentialBackoff {
    fn next(&self, attempt: u32) -> BackoffDecision {
        let delay_ms = self.initial_delay.as_millis() as u64 * (self.multiplier as u64).pow(attempt);
        let capped = delay_ms.min(self.max_delay.as_millis() as u64);
        BackoffDecision::Wait(Duration::from_millis(capped))
    }
}

/// Error returned when backoff parameters are invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfigError(pub &'static str);

impl fmt::Display for BackoffConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BackoffConfigError {}

impl ExponentialBackoff {
    pub fn new(
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: u32,
    ) -> Result<Self, BackoffConfigError> {
        if multiplier == 0 {
            return Err(BackoffConfigError("multiplier must be greater than 0"));
        }
        if multiplier > 10 {
            return Err(BackoffConfigError(
                "multiplier must be 10 or less to avoid overflow",
            ));
        }
        if max_delay < initial_delay {
            return Err(BackoffConfigError("max_delay must be >= initial_delay"));
        }
        Ok(Self {
            initial_delay,
            max_delay,
            multiplier,
        })
    }
}

/// One attempt's outcome, handed to `should_retry`/`notify`.
pub struct RetryEvent<'a> {
    pub attempt: u32,
    pub elapsed: Duration,
    pub error: &'a StepError,
}

/// Sleeps for a duration, or until the ambient context is canceled,
/// whichever comes first. Injectable so tests can drive zero-wait retries.
#[async_trait]
pub trait Timer: Send + Sync {
    async fn sleep(&self, ctx: &RunContext, duration: Duration);
}

/// Production timer, backed by `tokio::time`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTimer;

#[async_trait]
impl Timer for TokioTimer {
    async fn sleep(&self, ctx: &RunContext, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = ctx.canceled() => {}
        }
    }
}

/// A timer that never actually waits, for deterministic retry tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroWaitTimer;

#[async_trait]
impl Timer for ZeroWaitTimer {
    async fn sleep(&self, _ctx: &RunContext, _duration: Duration) {}
}

/// A retry policy: how many total attempts are allowed, how long each may
/// take, and how to back off and decide to stop between them.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first. `0` means unbounded
    /// (only backoff/should-retry/deadline stop it).
    pub max_attempts: u32,
    /// Relative deadline applied to each individual attempt.
    pub per_try_timeout: Option<Duration>,
    pub backoff: Arc<dyn Backoff>,
    /// Extra veto over whether to retry, given the event and the backoff's
    /// proposed wait.
    pub should_retry: Option<Arc<dyn Fn(&RetryEvent<'_>, Duration) -> bool + Send + Sync>>,
    pub notify: Option<Arc<dyn Fn(&StepError, Duration) + Send + Sync>>,
    pub timer: Arc<dyn Timer>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("per_try_timeout", &self.per_try_timeout)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    /// No retry: a single attempt, no per-try timeout beyond the step's own.
    fn default() -> Self {
        Self {
            max_attempts: 1,
            per_try_timeout: None,
            backoff: Arc::new(NoBackoff),
            should_retry: None,
            notify: None,
            timer: Arc::new(TokioTimer),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_retries + 1,
            backoff: Arc::new(FixedBackoff(delay)),
            ..Self::default()
        }
    }

    pub fn exponential(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts: max_retries + 1,
            backoff: Arc::new(ExponentialBackoff {
                initial_delay,
                max_delay: Duration::from_secs(60),
                multiplier: 2,
            }),
            ..Self::default()
        }
    }

    pub fn with_per_try_timeout(mut self, timeout: Duration) -> Self {
        self.per_try_timeout = Some(timeout);
        self
    }

    pub fn with_timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = timer;
        self
    }
}

/// Runs `work` under `policy`, honoring `step_deadline` (an absolute time
/// beyond which no new attempt starts) and the ambient context's own
/// cancellation.
///
/// Returns the last attempt's `Ok`/`Err` unchanged; the caller decides how
/// to translate a lingering error into a final status.
pub async fn run_with_retry<F, Fut>(
    ctx: &RunContext,
    policy: &RetryPolicy,
    step_name: &str,
    mut work: F,
) -> Result<(), StepError>
where
    F: FnMut(RunContext) -> Fut,
    Fut: std::future::Future<Output = Result<(), StepError>>,
{
    let start = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        let attempt_ctx = match policy.per_try_timeout {
            Some(t) => ctx.child_with_timeout(t),
            None => ctx.child(),
        };

        let outcome = work(attempt_ctx).await;
        let elapsed = start.elapsed();

        let err = match outcome {
            Ok(()) => {
                debug!(step = step_name, attempt, "attempt succeeded");
                return Ok(());
            }
            Err(e) => e,
        };

        if err.status_intent().is_some() {
            // A status-intent marker always wins outright; retrying would
            // contradict the step's explicit request.
            return Err(err);
        }

        let event = RetryEvent {
            attempt,
            elapsed,
            error: &err,
        };

        let backoff = policy.backoff.next(attempt);
        let proposed_wait = match backoff {
            BackoffDecision::Wait(d) => d,
            BackoffDecision::Stop => {
                debug!(step = step_name, attempt, "backoff source says stop");
                return Err(err);
            }
        };

        if let Some(deadline) = ctx.deadline() {
            if Instant::now() > deadline {
                debug!(step = step_name, attempt, "step deadline already passed");
                return Err(err);
            }
        }

        if let Some(should_retry) = &policy.should_retry {
            if !should_retry(&event, proposed_wait) {
                debug!(step = step_name, attempt, "should_retry vetoed further attempts");
                return Err(err);
            }
        }

        if policy.max_attempts > 0 && attempt + 1 >= policy.max_attempts {
            debug!(step = step_name, attempt, "max attempts reached");
            return Err(err);
        }

        if let Some(notify) = &policy.notify {
            notify(&err, proposed_wait);
        }
        warn!(step = step_name, attempt, wait = ?proposed_wait, "step failed, retrying");

        policy.timer.sleep(ctx, proposed_wait).await;
        if ctx.is_canceled() {
            return Err(err);
        }

        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_after_retries_within_budget() {
        let attempts = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::fixed(5, Duration::ZERO).with_timer(Arc::new(ZeroWaitTimer));
        let ctx = RunContext::new();

        let counter = attempts.clone();
        let result = run_with_retry(&ctx, &policy, "flaky", move |_ctx| {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(StepError::failed("boom"))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_attempts_and_returns_last_error() {
        let attempts = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::fixed(3, Duration::ZERO).with_timer(Arc::new(ZeroWaitTimer));
        let ctx = RunContext::new();

        let counter = attempts.clone();
        let result = run_with_retry(&ctx, &policy, "always-fails", move |_ctx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StepError::failed("boom"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn status_intent_short_circuits_retry() {
        let attempts = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::fixed(5, Duration::ZERO).with_timer(Arc::new(ZeroWaitTimer));
        let ctx = RunContext::new();

        let counter = attempts.clone();
        let result = run_with_retry(&ctx, &policy, "skips", move |_ctx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StepError::mark_skipped("not applicable"))
            }
        })
        .await;

        assert!(matches!(result, Err(StepError::MarkSkipped(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
