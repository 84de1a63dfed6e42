//! The step contract and its identity.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::RunContext;
use crate::error::StepError;

/// A unit of work orchestrated by a [`Workflow`](crate::workflow::Workflow).
///
/// Steps are opaque to the engine beyond [`Step::run`]; everything else is an
/// optional capability the engine probes for. Implementors should expose only
/// the capabilities their step actually needs rather than forcing a uniform
/// base.
#[async_trait]
pub trait Step: Send + Sync {
    /// Performs the step's work for a single attempt.
    ///
    /// Returning `Ok(())` or an unwrapped [`StepError::Failed`] lets the
    /// engine derive the final status from the outcome; returning a
    /// `MarkSucceeded`/`MarkCanceled`/`MarkSkipped` variant overrides it.
    async fn run(&self, ctx: &RunContext) -> Result<(), StepError>;

    /// Returns a display name for the step. Defaults to a generic tag; most
    /// steps will want to override this with something meaningful.
    fn name(&self) -> String {
        "step".to_string()
    }

    /// Reveals a single wrapped inner step, for steps that simply chain
    /// through another step (logging wrappers, timeouts, retriable
    /// decorators, ...).
    fn unwrap_one(&self) -> Option<Arc<dyn Step>> {
        None
    }

    /// Reveals several wrapped inner steps, for steps that branch into many
    /// (sub-workflows, parallel groups, `If`/`Switch` bodies, ...).
    fn unwrap_many(&self) -> Option<Vec<Arc<dyn Step>>> {
        None
    }

    /// Called exactly once, the first time this step is attached to a
    /// workflow, allowing it to register upstream links, hooks, or other
    /// declarations it owns. Returning an empty vec is the default
    /// ("no extra wiring needed").
    fn on_attach(&self) -> Vec<crate::config::StepDecl> {
        Vec::new()
    }

    /// Exposes the concrete type for [`crate::introspection::is`]/`as_nodes`.
    /// Every step is `'static` by virtue of being usable as `Arc<dyn Step>`.
    fn as_any(&self) -> &dyn std::any::Any
    where
        Self: 'static,
    {
        self
    }
}

/// A reference-counted handle to a step, the currency every public API
/// accepts and returns.
pub type StepRef = Arc<dyn Step>;

/// Identity of a step: the address of the underlying trait object.
///
/// Steps are compared by identity, not by value: two distinct [`StepRef`]s
/// pointing at the same underlying object are the same step; two different
/// objects that merely look alike are not.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StepId(usize);

impl StepId {
    pub fn of(step: &StepRef) -> Self {
        // Casting the fat pointer to `*const ()` drops the vtable half and
        // keeps only the data address, which is what identity means here.
        StepId(Arc::as_ptr(step) as *const () as usize)
    }
}

impl fmt::Debug for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StepId({:#x})", self.0)
    }
}

/// A hashable, identity-comparable key wrapping a [`StepRef`].
///
/// Internal maps (the step tree, per-step state, upstream sets) key on this
/// rather than on `StepRef` directly, since `Arc<dyn Step>` has no `Hash`/`Eq`
/// of its own.
#[derive(Clone)]
pub struct StepKey(pub StepRef);

impl StepKey {
    pub fn new(step: StepRef) -> Self {
        Self(step)
    }

    pub fn id(&self) -> StepId {
        StepId::of(&self.0)
    }

    pub fn step(&self) -> &StepRef {
        &self.0
    }
}

impl PartialEq for StepKey {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for StepKey {}

impl std::hash::Hash for StepKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id().hash(state)
    }
}

impl fmt::Debug for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StepKey({}, {:?})", self.0.name(), self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl Step for Noop {
        async fn run(&self, _ctx: &RunContext) -> Result<(), StepError> {
            Ok(())
        }

        fn name(&self) -> String {
            "Noop".to_string()
        }
    }

    #[test]
    fn identity_is_stable_across_clones() {
        let a: StepRef = Arc::new(Noop);
        let b = a.clone();
        assert_eq!(StepId::of(&a), StepId::of(&b));
    }

    #[test]
    fn identity_differs_across_instances() {
        let a: StepRef = Arc::new(Noop);
        let b: StepRef = Arc::new(Noop);
        assert_ne!(StepId::of(&a), StepId::of(&b));
    }

    #[test]
    fn step_key_equality_follows_identity() {
        let a: StepRef = Arc::new(Noop);
        let k1 = StepKey::new(a.clone());
        let k2 = StepKey::new(a);
        assert_eq!(k1, k2);
    }
}
