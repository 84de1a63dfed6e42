//! Step-level and workflow-level error types.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::status::StepStatus;

/// A boxed, thread-safe error: what a step's own work returns and what the
/// engine's error variants wrap.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The error type a [`Step::run`](crate::step::Step::run) returns.
///
/// The plain [`StepError::Failed`] variant lets the engine derive status from
/// success/failure in the usual way; the `Mark*` variants carry a *status
/// intent* that overrides the derived status while still keeping the wrapped
/// error around for reporting.
#[derive(Debug)]
pub enum StepError {
    /// An ordinary failure: the engine marks the step `Failed` (subject to
    /// retry) unless the ambient context was canceled.
    Failed(BoxError),
    /// Force the step's final status to `Succeeded`, regardless of the
    /// wrapped error. Useful for "already done"-style idempotency checks.
    MarkSucceeded(BoxError),
    /// Force the step's final status to `Canceled`.
    MarkCanceled(BoxError),
    /// Force the step's final status to `Skipped`.
    MarkSkipped(BoxError),
}

impl StepError {
    pub fn failed(err: impl Into<BoxError>) -> Self {
        StepError::Failed(err.into())
    }

    pub fn mark_succeeded(err: impl Into<BoxError>) -> Self {
        StepError::MarkSucceeded(err.into())
    }

    pub fn mark_canceled(err: impl Into<BoxError>) -> Self {
        StepError::MarkCanceled(err.into())
    }

    pub fn mark_skipped(err: impl Into<BoxError>) -> Self {
        StepError::MarkSkipped(err.into())
    }

    /// The status this error's marker (if any) forces. `None` means "derive
    /// the status from success/failure as usual".
    pub fn status_intent(&self) -> Option<StepStatus> {
        match self {
            StepError::Failed(_) => None,
            StepError::MarkSucceeded(_) => Some(StepStatus::Succeeded),
            StepError::MarkCanceled(_) => Some(StepStatus::Canceled),
            StepError::MarkSkipped(_) => Some(StepStatus::Skipped),
        }
    }

    pub fn into_inner(self) -> BoxError {
        match self {
            StepError::Failed(e)
            | StepError::MarkSucceeded(e)
            | StepError::MarkCanceled(e)
            | StepError::MarkSkipped(e) => e,
        }
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepError::Failed(e) => write!(f, "{e}"),
            StepError::MarkSucceeded(e) => write!(f, "marked succeeded: {e}"),
            StepError::MarkCanceled(e) => write!(f, "marked canceled: {e}"),
            StepError::MarkSkipped(e) => write!(f, "marked skipped: {e}"),
        }
    }
}

impl std::error::Error for StepError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StepError::Failed(e)
            | StepError::MarkSucceeded(e)
            | StepError::MarkCanceled(e)
            | StepError::MarkSkipped(e) => Some(e.as_ref()),
        }
    }
}

impl From<String> for StepError {
    fn from(s: String) -> Self {
        StepError::Failed(s.into())
    }
}

impl From<&str> for StepError {
    fn from(s: &str) -> Self {
        StepError::Failed(s.to_string().into())
    }
}

/// One step left unmarked by cycle detection, along with the upstreams of
/// its that are also unmarked.
#[derive(Debug, Clone)]
pub struct CycleMember {
    pub step: String,
    pub unresolved_upstreams: Vec<String>,
}

/// Pretty-printed report of every step caught in a dependency cycle.
#[derive(Debug, Clone)]
pub struct CycleReport(pub Vec<CycleMember>);

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .0
            .iter()
            .map(|m| format!("{} (waiting on: {})", m.step, m.unresolved_upstreams.join(", ")))
            .collect();
        write!(f, "[{}]", rendered.join("; "))
    }
}

/// Final `(status, error)` for every root step, reported when a workflow run
/// doesn't end in total success.
#[derive(Debug, Clone, Default)]
pub struct AggregateError {
    pub entries: Vec<(String, StepStatus, Option<Arc<WorkflowError>>)>,
}

impl AggregateError {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if every entry succeeded (or was skipped and skips don't count
    /// as failures).
    pub fn all_succeeded(&self, skip_as_error: bool) -> bool {
        self.entries
            .iter()
            .all(|(_, status, _)| status.is_success(skip_as_error))
    }

    /// True if every entry succeeded or was skipped, regardless of the
    /// workflow's own `skip_as_error` setting.
    pub fn all_succeeded_or_skipped(&self) -> bool {
        self.entries
            .iter()
            .all(|(_, status, _)| matches!(status, StepStatus::Succeeded | StepStatus::Skipped))
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "workflow finished with {} step(s) reported:", self.entries.len())?;
        for (name, status, err) in &self.entries {
            match err {
                Some(e) => writeln!(f, "  - {name} [{status}]: {}", indent(&e.to_string()))?,
                None => writeln!(f, "  - {name} [{status}]")?,
            }
        }
        Ok(())
    }
}

fn indent(s: &str) -> String {
    s.replace('\n', "\n    ")
}

/// Errors surfaced by the engine itself: final per-step errors, preflight
/// failures, and aggregate reporting.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkflowError {
    /// A step's own work failed (after retries were exhausted).
    #[error("step '{name}' failed: {source}")]
    Step { name: String, #[source] source: BoxError },

    /// The ambient context was canceled while the step was in flight, the
    /// step's own or per-try deadline elapsed, or the step asked to be
    /// marked canceled. The core has no separate timeout status: an elapsed
    /// deadline is just another way a step ends up canceled.
    #[error("step '{name}' canceled")]
    Canceled { name: String },

    /// The step's attempt panicked and panic recovery is enabled.
    #[error("step '{name}' panicked: {message}")]
    Panic { name: String, message: String },

    /// A before-hook aborted the attempt.
    #[error("before-hook for step '{name}' failed: {source}")]
    BeforeStep { name: String, #[source] source: BoxError },

    /// Preflight found a dependency cycle; no step ran.
    #[error("dependency cycle detected: {0}")]
    CycleDependency(CycleReport),

    /// `run`/`do` was invoked while the workflow was already running.
    #[error("workflow is already running")]
    AlreadyRunning,

    /// Two multi-wrap steps both claim the same leaf without one being an
    /// ancestor of the other.
    #[error("step tree conflict: leaf '{leaf}' is claimed by both '{first}' and '{second}'")]
    TreeConflict {
        leaf: String,
        first: String,
        second: String,
    },

    /// A declared upstream isn't part of the workflow.
    #[error("upstream '{upstream}' declared on step '{step}' is not part of the workflow")]
    UnknownUpstream { step: String, upstream: String },

    /// Final report of a run that didn't end in total success.
    #[error("{0}")]
    Aggregate(AggregateError),
}

impl WorkflowError {
    pub fn step_failed(name: impl Into<String>, source: impl Into<BoxError>) -> Self {
        WorkflowError::Step {
            name: name.into(),
            source: source.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_error_status_intent() {
        assert_eq!(StepError::failed("x").status_intent(), None);
        assert_eq!(
            StepError::mark_succeeded("x").status_intent(),
            Some(StepStatus::Succeeded)
        );
        assert_eq!(
            StepError::mark_canceled("x").status_intent(),
            Some(StepStatus::Canceled)
        );
        assert_eq!(
            StepError::mark_skipped("x").status_intent(),
            Some(StepStatus::Skipped)
        );
    }

    #[test]
    fn aggregate_all_succeeded_respects_skip_as_error() {
        let agg = AggregateError {
            entries: vec![
                ("a".to_string(), StepStatus::Succeeded, None),
                ("b".to_string(), StepStatus::Skipped, None),
            ],
        };
        assert!(agg.all_succeeded(false));
        assert!(!agg.all_succeeded(true));
        assert!(agg.all_succeeded_or_skipped());
    }

    #[test]
    fn cycle_report_renders_offending_upstreams() {
        let report = CycleReport(vec![CycleMember {
            step: "a".to_string(),
            unresolved_upstreams: vec!["b".to_string()],
        }]);
        assert_eq!(report.to_string(), "[a (waiting on: b)]");
    }

    #[test]
    fn aggregate_error_display_indents_nested_errors() {
        let err = WorkflowError::step_failed("a", "boom");
        let agg = AggregateError {
            entries: vec![("a".to_string(), StepStatus::Failed, Some(Arc::new(err)))],
        };
        let rendered = agg.to_string();
        assert!(rendered.contains("a [failed]"));
        assert!(rendered.contains("boom"));
    }
}
