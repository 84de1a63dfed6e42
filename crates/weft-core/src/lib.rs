//! Core traits and types for the weft workflow engine: a DAG of `Step`s,
//! gated by conditions over upstream outcomes, run phase-by-phase under a
//! concurrency cap.
//!
//! # Core Types
//!
//! - [`Step`] - the unit of work the engine orchestrates
//! - [`Workflow`] - the DAG, its accumulated configuration, and the scheduler
//! - [`RunContext`] - cancellation and deadline plumbing threaded through a run
//! - [`WorkflowError`] - errors surfaced by the engine itself
//! - [`StepError`] - the error type a step's own work returns
//!
//! # Declaring steps
//!
//! [`step`]/[`steps`] build one or more [`config::StepDecl`]s; [`pipe`]/
//! [`batch_pipe`] are sugar for common sequential-dependency shapes.

mod condition;
mod config;
mod context;
mod error;
mod introspection;
mod retry;
mod status;
mod step;
mod tree;
mod workflow;

pub use condition::{
    default_condition, AllSucceeded, AllSucceededOrSkipped, AnyFailed, AnySucceeded, Always,
    BeCanceled, Condition, UpstreamResult,
};
pub use config::{
    batch_pipe, pipe, step, steps, AfterHook, BeforeHook, StepConfig, StepDecl, StepDeclBuilder,
    StepFragment, StepOptions, StepRefSet,
};
pub use context::RunContext;
pub use error::{AggregateError, BoxError, CycleMember, CycleReport, StepError, WorkflowError};
pub use introspection::{as_nodes, display_name, is, is_step, traverse, TraverseDecision};
pub use retry::{
    Backoff, BackoffConfigError, BackoffDecision, ExponentialBackoff, FixedBackoff, NoBackoff,
    RetryEvent, RetryPolicy, Timer, TokioTimer, ZeroWaitTimer,
};
pub use status::StepStatus;
pub use step::{Step, StepId, StepKey, StepRef};
pub use tree::StepTree;
pub use workflow::{Phase, Workflow, WorkflowBuilder};
