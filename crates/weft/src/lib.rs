//! A DAG-based workflow engine for Rust.
//!
//! This crate is a thin convenience layer over `weft-core`: it re-exports
//! every public type and adds a [`prelude`] for the common import set. The
//! engine itself ([`Workflow`], [`Step`], the step-declaration builders)
//! lives in `weft-core`; depend on that crate directly if you're
//! implementing a library of steps and don't want the extra name.
//!
//! # Example
//!
//! ```rust,ignore
//! use weft::prelude::*;
//! use async_trait::async_trait;
//!
//! struct Greet;
//!
//! #[async_trait]
//! impl Step for Greet {
//!     async fn run(&self, _ctx: &RunContext) -> Result<(), StepError> {
//!         println!("hello");
//!         Ok(())
//!     }
//!
//!     fn name(&self) -> String {
//!         "greet".to_string()
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let greet: StepRef = std::sync::Arc::new(Greet);
//!     let workflow = Workflow::new();
//!     workflow.add(step(greet).build()).await.expect("valid declaration");
//!     workflow.run(&RunContext::new()).await.expect("workflow failed");
//! }
//! ```

pub use weft_core::*;

/// Common imports for building and running workflows.
pub mod prelude {
    pub use crate::{
        batch_pipe, pipe, step, steps, RunContext, Step, StepDecl, StepError, StepRef,
        StepStatus, Workflow, WorkflowBuilder, WorkflowError,
    };
}
