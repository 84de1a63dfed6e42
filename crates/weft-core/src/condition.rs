//! Gating predicates over upstream results.

use std::sync::Arc;

use crate::error::WorkflowError;
use crate::status::StepStatus;

/// The terminal state (or lack thereof) of one upstream, as seen by a
/// downstream step's condition.
#[derive(Clone)]
pub struct UpstreamResult {
    pub status: StepStatus,
    pub error: Option<Arc<WorkflowError>>,
}

impl UpstreamResult {
    pub fn new(status: StepStatus, error: Option<Arc<WorkflowError>>) -> Self {
        Self { status, error }
    }
}

/// Maps `(context canceled?, upstream results)` to an intended next status.
///
/// `StepStatus::Running` means "proceed to dispatch"; any other (terminal)
/// status is applied directly without running the step.
pub trait Condition: Send + Sync {
    fn evaluate(&self, ctx_canceled: bool, upstreams: &[UpstreamResult]) -> StepStatus;
}

/// Always proceeds, regardless of upstream outcomes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Always;

impl Condition for Always {
    fn evaluate(&self, _ctx_canceled: bool, _upstreams: &[UpstreamResult]) -> StepStatus {
        StepStatus::Running
    }
}

/// Proceeds only if every upstream succeeded. The engine's default.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllSucceeded;

impl Condition for AllSucceeded {
    fn evaluate(&self, ctx_canceled: bool, upstreams: &[UpstreamResult]) -> StepStatus {
        if ctx_canceled {
            return StepStatus::Canceled;
        }
        let all_ok = upstreams.iter().all(|u| u.status == StepStatus::Succeeded);
        if all_ok {
            StepStatus::Running
        } else {
            StepStatus::Skipped
        }
    }
}

/// Proceeds if at least one upstream succeeded.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnySucceeded;

impl Condition for AnySucceeded {
    fn evaluate(&self, ctx_canceled: bool, upstreams: &[UpstreamResult]) -> StepStatus {
        if ctx_canceled {
            return StepStatus::Canceled;
        }
        let any_ok = upstreams.iter().any(|u| u.status == StepStatus::Succeeded);
        if any_ok {
            StepStatus::Running
        } else {
            StepStatus::Skipped
        }
    }
}

/// Proceeds if every upstream either succeeded or was skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllSucceededOrSkipped;

impl Condition for AllSucceededOrSkipped {
    fn evaluate(&self, ctx_canceled: bool, upstreams: &[UpstreamResult]) -> StepStatus {
        if ctx_canceled {
            return StepStatus::Canceled;
        }
        let all_ok = upstreams
            .iter()
            .all(|u| matches!(u.status, StepStatus::Succeeded | StepStatus::Skipped));
        if all_ok {
            StepStatus::Running
        } else {
            StepStatus::Skipped
        }
    }
}

/// Proceeds if at least one upstream failed, the inverse-style "cleanup on
/// failure" predicate.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyFailed;

impl Condition for AnyFailed {
    fn evaluate(&self, ctx_canceled: bool, upstreams: &[UpstreamResult]) -> StepStatus {
        if ctx_canceled {
            return StepStatus::Canceled;
        }
        let any_failed = upstreams.iter().any(|u| u.status == StepStatus::Failed);
        if any_failed {
            StepStatus::Running
        } else {
            StepStatus::Skipped
        }
    }
}

/// Only ever routes to `Skipped`, unless the context is canceled, in which
/// case it runs: the "teardown that must happen even on cancellation"
/// predicate.
#[derive(Debug, Clone, Copy, Default)]
pub struct BeCanceled;

impl Condition for BeCanceled {
    fn evaluate(&self, ctx_canceled: bool, _upstreams: &[UpstreamResult]) -> StepStatus {
        if ctx_canceled {
            StepStatus::Running
        } else {
            StepStatus::Skipped
        }
    }
}

/// The engine's default condition when a step declares none.
pub fn default_condition() -> Arc<dyn Condition> {
    Arc::new(AllSucceeded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(status: StepStatus) -> UpstreamResult {
        UpstreamResult::new(status, None)
    }

    #[test]
    fn all_succeeded_requires_unanimous_success() {
        let cond = AllSucceeded;
        let ok = [result(StepStatus::Succeeded), result(StepStatus::Succeeded)];
        assert_eq!(cond.evaluate(false, &ok), StepStatus::Running);

        let mixed = [result(StepStatus::Succeeded), result(StepStatus::Failed)];
        assert_eq!(cond.evaluate(false, &mixed), StepStatus::Skipped);
    }

    #[test]
    fn canceled_context_overrides_to_canceled_for_success_family() {
        let cond = AllSucceeded;
        let ok = [result(StepStatus::Succeeded)];
        assert_eq!(cond.evaluate(true, &ok), StepStatus::Canceled);
    }

    #[test]
    fn any_failed_runs_cleanup_on_failure() {
        let cond = AnyFailed;
        let mixed = [result(StepStatus::Succeeded), result(StepStatus::Failed)];
        assert_eq!(cond.evaluate(false, &mixed), StepStatus::Running);

        let all_ok = [result(StepStatus::Succeeded)];
        assert_eq!(cond.evaluate(false, &all_ok), StepStatus::Skipped);
    }

    #[test]
    fn be_canceled_only_runs_when_context_canceled() {
        let cond = BeCanceled;
        assert_eq!(cond.evaluate(false, &[]), StepStatus::Skipped);
        assert_eq!(cond.evaluate(true, &[]), StepStatus::Running);
    }

    #[test]
    fn always_ignores_upstreams_and_cancellation() {
        let cond = Always;
        assert_eq!(cond.evaluate(true, &[result(StepStatus::Failed)]), StepStatus::Running);
        assert_eq!(cond.evaluate(false, &[]), StepStatus::Running);
    }
}
