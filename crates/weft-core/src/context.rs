//! The ambient run context threaded through a workflow run.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Cancellation and deadline plumbing passed to every step attempt.
///
/// Modeled after a Go-style cancellation context rather than a data bag:
/// canceling a [`RunContext`] cancels every step derived from it, and a
/// deadline here bounds how long a derived child may run. Steps don't share
/// state through it: they only observe "should I stop" and "how much time
/// do I have left".
#[derive(Clone)]
pub struct RunContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    started_at: Instant,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RunContext {
    /// A fresh, uncanceled context with no deadline.
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
            started_at: Instant::now(),
        }
    }

    /// A fresh context that is automatically canceled once `deadline`
    /// passes cooperatively (callers must still check [`RunContext::is_canceled`]
    /// or race [`RunContext::canceled`]; nothing preempts running code).
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            ..Self::new()
        }
    }

    /// Derives a child context whose cancellation follows this one's, with a
    /// deadline no later than `timeout` from now and no later than the
    /// parent's own deadline, whichever comes first.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) => Some(candidate.min(parent)),
            None => Some(candidate),
        };
        Self {
            cancel: self.cancel.child_token(),
            deadline,
            started_at: self.started_at,
        }
    }

    /// Derives a child context that inherits this one's deadline unchanged,
    /// for wrapping steps that don't impose their own timeout.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
            started_at: self.started_at,
        }
    }

    /// Cancels this context and every context derived from it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// True if this context (or an ancestor) has been canceled, or its
    /// deadline has already passed.
    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled() || self.is_deadline_expired()
    }

    fn is_deadline_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// This context's deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// How long until the deadline elapses, or `None` if there is no
    /// deadline. A past deadline yields `Duration::ZERO`.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Time elapsed since the root of this context chain was created.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Resolves once this context is canceled or its deadline passes.
    /// Never resolves for a context with no deadline unless canceled.
    pub async fn canceled(&self) {
        match self.remaining() {
            Some(remaining) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep(remaining) => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_propagates_to_children() {
        let parent = RunContext::new();
        let child = parent.child();
        assert!(!child.is_canceled());
        parent.cancel();
        assert!(child.is_canceled());
    }

    #[test]
    fn child_deadline_is_bounded_by_parent() {
        let parent = RunContext::with_deadline(Instant::now() + Duration::from_millis(10));
        let child = parent.child_with_timeout(Duration::from_secs(60));
        assert!(child.deadline().unwrap() <= parent.deadline().unwrap());
    }

    #[test]
    fn expired_deadline_counts_as_canceled() {
        let ctx = RunContext::with_deadline(Instant::now() - Duration::from_millis(1));
        assert!(ctx.is_canceled());
    }

    #[tokio::test]
    async fn canceled_future_resolves_on_explicit_cancel() {
        let ctx = RunContext::new();
        let waiter = ctx.clone();
        let handle = tokio::spawn(async move {
            waiter.canceled().await;
        });
        ctx.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn canceled_future_resolves_on_deadline() {
        let ctx = RunContext::with_deadline(Instant::now() + Duration::from_millis(5));
        ctx.canceled().await;
        assert!(ctx.is_canceled());
    }
}
