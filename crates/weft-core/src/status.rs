//! Step lifecycle states.

use std::fmt;

/// The lifecycle state of a step within a single workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepStatus {
    /// Never entered. The sentinel value every step starts (and is reset to
    /// between runs) in.
    #[default]
    Pending,
    /// Currently dispatched to a worker. Transient, never observed once a
    /// run has finished.
    Running,
    /// Finished with a non-success outcome.
    Failed,
    /// Finished successfully.
    Succeeded,
    /// Finished because the ambient context was canceled, or a step asked to
    /// be marked canceled.
    Canceled,
    /// Finished without running, because its condition routed it away.
    Skipped,
}

impl StepStatus {
    /// Terminal statuses are the ones a step can be observed in once a run
    /// (or an individual step) has finished: everything except `Pending` and
    /// `Running`.
    pub fn is_terminal(self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }

    /// Whether this status counts as a success for the purposes of aggregate
    /// reporting, given whether skipped steps should be treated as failures.
    pub fn is_success(self, skip_as_error: bool) -> bool {
        match self {
            StepStatus::Succeeded => true,
            StepStatus::Skipped => !skip_as_error,
            _ => false,
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Failed => "failed",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Canceled => "canceled",
            StepStatus::Skipped => "skipped",
        };
        f.write_str(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_classification() {
        assert!(!StepStatus::Pending.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
        for terminal in [
            StepStatus::Failed,
            StepStatus::Succeeded,
            StepStatus::Canceled,
            StepStatus::Skipped,
        ] {
            assert!(terminal.is_terminal());
        }
    }

    #[test]
    fn skipped_success_depends_on_flag() {
        assert!(StepStatus::Skipped.is_success(false));
        assert!(!StepStatus::Skipped.is_success(true));
        assert!(StepStatus::Succeeded.is_success(true));
        assert!(!StepStatus::Failed.is_success(false));
    }
}
