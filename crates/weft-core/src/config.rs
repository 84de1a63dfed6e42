//! Step configuration fragments and the declaration builders that produce
//! them: `step`/`steps`, `.depends_on`/`.before_step`/`.after_step`/
//! `.input`/`.timeout`/`.retry`/`.when`, `pipe`, `batch_pipe`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::condition::{default_condition, Condition};
use crate::context::RunContext;
use crate::error::StepError;
use crate::retry::RetryPolicy;
use crate::step::{StepId, StepRef};

type HookFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Runs before an attempt; may rewrite the context, or abort the step by
/// returning an error. Using [`StepError`] (rather than the richer engine
/// error) lets a before-hook carry a status-intent marker (e.g. skip via a
/// precondition check) the same way the step's own work can.
pub type BeforeHook =
    Arc<dyn Fn(RunContext, StepRef) -> HookFuture<Result<RunContext, StepError>> + Send + Sync>;

/// Runs after an attempt (including after a panic or hook abort); may
/// rewrite the error, preserving any status-intent marker on it.
pub type AfterHook = Arc<
    dyn Fn(RunContext, StepRef, Option<StepError>) -> HookFuture<Option<StepError>> + Send + Sync,
>;

type OptionModifier = Arc<dyn Fn(StepOptions) -> StepOptions + Send + Sync>;

/// The timeout/retry/condition triple every step carries, composed from
/// whatever option modifiers were declared for it, each wrapping the last.
#[derive(Clone)]
pub struct StepOptions {
    pub timeout: Option<Duration>,
    pub retry: RetryPolicy,
    pub condition: Arc<dyn Condition>,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            retry: RetryPolicy::none(),
            condition: default_condition(),
        }
    }
}

/// A deduplicated, identity-keyed set of step references.
#[derive(Clone, Default)]
pub struct StepRefSet(HashMap<StepId, StepRef>);

impl StepRefSet {
    pub fn insert(&mut self, step: StepRef) {
        self.0.insert(StepId::of(&step), step);
    }

    pub fn extend(&mut self, other: &StepRefSet) {
        for (id, step) in &other.0 {
            self.0.insert(*id, step.clone());
        }
    }

    pub fn contains(&self, id: StepId) -> bool {
        self.0.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StepRef> {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A fragment of configuration contributed by one declaration: upstreams,
/// hooks, and option modifiers, destined to be merged into a step's
/// accumulated [`StepConfig`].
#[derive(Clone, Default)]
pub struct StepFragment {
    pub upstreams: StepRefSet,
    pub before: Vec<BeforeHook>,
    pub after: Vec<AfterHook>,
    pub option_modifiers: Vec<OptionModifier>,
}

/// One step paired with the fragment a declaration contributes to it.
pub struct StepDecl {
    pub step: StepRef,
    pub fragment: StepFragment,
}

/// The accumulated, merged configuration for a single step.
#[derive(Clone)]
pub struct StepConfig {
    pub upstreams: StepRefSet,
    pub before: Vec<BeforeHook>,
    pub after: Vec<AfterHook>,
    pub options: StepOptions,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            upstreams: StepRefSet::default(),
            before: Vec::new(),
            after: Vec::new(),
            options: StepOptions::default(),
        }
    }
}

impl StepConfig {
    /// Merges a fragment in. Upstreams union, hooks append in declaration
    /// order, and option modifiers fold over the accumulated options;
    /// later declarations override earlier ones where they conflict.
    pub fn merge(&mut self, fragment: &StepFragment) {
        self.upstreams.extend(&fragment.upstreams);
        self.before.extend(fragment.before.iter().cloned());
        self.after.extend(fragment.after.iter().cloned());
        for modifier in &fragment.option_modifiers {
            self.options = modifier(self.options.clone());
        }
    }

    /// Folds a demoted root's accumulated config into this (now-subsuming)
    /// root's config. Upstreams and hooks union/append; this root's own
    /// options win, since the newly-added outer wrapper is what the caller
    /// configured explicitly.
    pub fn absorb(&mut self, other: &StepConfig) {
        self.upstreams.extend(&other.upstreams);
        self.before.extend(other.before.iter().cloned());
        self.after.extend(other.after.iter().cloned());
    }
}

/// Fluent builder returned by [`step`]/[`steps`]; `.build()` yields one
/// [`StepDecl`] per named step, each carrying an identical fragment.
pub struct StepDeclBuilder {
    targets: Vec<StepRef>,
    fragment: StepFragment,
}

impl StepDeclBuilder {
    fn new(targets: Vec<StepRef>) -> Self {
        Self {
            targets,
            fragment: StepFragment::default(),
        }
    }

    pub fn depends_on(mut self, upstreams: impl IntoIterator<Item = StepRef>) -> Self {
        for u in upstreams {
            self.fragment.upstreams.insert(u);
        }
        self
    }

    pub fn before_step(mut self, hook: BeforeHook) -> Self {
        self.fragment.before.push(hook);
        self
    }

    pub fn after_step(mut self, hook: AfterHook) -> Self {
        self.fragment.after.push(hook);
        self
    }

    /// Trivial forwarding sugar: runs `f` before the attempt and aborts the
    /// step if it returns an error, without touching the context.
    pub fn input<F>(self, f: F) -> Self
    where
        F: Fn() -> Result<(), StepError> + Send + Sync + 'static,
    {
        self.before_step(Arc::new(move |ctx: RunContext, _step: StepRef| {
            let outcome = f();
            Box::pin(async move { outcome.map(|_| ctx) }) as HookFuture<_>
        }))
    }

    pub fn timeout(mut self, duration: Duration) -> Self {
        self.fragment
            .option_modifiers
            .push(Arc::new(move |mut o: StepOptions| {
                o.timeout = Some(duration);
                o
            }));
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.fragment
            .option_modifiers
            .push(Arc::new(move |mut o: StepOptions| {
                o.retry = policy.clone();
                o
            }));
        self
    }

    pub fn retry_with(mut self, f: impl Fn(RetryPolicy) -> RetryPolicy + Send + Sync + 'static) -> Self {
        self.fragment
            .option_modifiers
            .push(Arc::new(move |mut o: StepOptions| {
                o.retry = f(o.retry.clone());
                o
            }));
        self
    }

    pub fn when(mut self, condition: Arc<dyn Condition>) -> Self {
        self.fragment
            .option_modifiers
            .push(Arc::new(move |mut o: StepOptions| {
                o.condition = condition.clone();
                o
            }));
        self
    }

    pub fn build(self) -> Vec<StepDecl> {
        self.targets
            .into_iter()
            .map(|step| StepDecl {
                step,
                fragment: self.fragment.clone(),
            })
            .collect()
    }
}

/// Declares a single step, returning a builder for its configuration.
pub fn step(target: StepRef) -> StepDeclBuilder {
    StepDeclBuilder::new(vec![target])
}

/// Declares several steps at once; fluent configuration applies identically
/// to each.
pub fn steps(targets: impl IntoIterator<Item = StepRef>) -> StepDeclBuilder {
    StepDeclBuilder::new(targets.into_iter().collect())
}

/// Sequential chain: each step depends on the one before it.
pub fn pipe(chain: impl IntoIterator<Item = StepRef>) -> Vec<StepDecl> {
    let chain: Vec<StepRef> = chain.into_iter().collect();
    chain
        .windows(2)
        .flat_map(|pair| step(pair[1].clone()).depends_on([pair[0].clone()]).build())
        .collect()
}

/// Groupwise sequential chain: every step in group *n+1* depends on every
/// step in group *n*.
pub fn batch_pipe(groups: impl IntoIterator<Item = Vec<StepRef>>) -> Vec<StepDecl> {
    let groups: Vec<Vec<StepRef>> = groups.into_iter().collect();
    let mut decls = Vec::new();
    for pair in groups.windows(2) {
        let (upstream_group, downstream_group) = (&pair[0], &pair[1]);
        for target in downstream_group {
            decls.extend(
                step(target.clone())
                    .depends_on(upstream_group.iter().cloned())
                    .build(),
            );
        }
    }
    decls
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StepError;
    use crate::step::Step;
    use async_trait::async_trait;

    struct Noop(&'static str);

    #[async_trait]
    impl Step for Noop {
        async fn run(&self, _ctx: &RunContext) -> Result<(), StepError> {
            Ok(())
        }
        fn name(&self) -> String {
            self.0.to_string()
        }
    }

    #[test]
    fn merging_disjoint_fragments_matches_single_merged_call() {
        let a: StepRef = Arc::new(Noop("a"));
        let b: StepRef = Arc::new(Noop("b"));
        let c: StepRef = Arc::new(Noop("c"));

        let mut incremental = StepConfig::default();
        incremental.merge(&step(a.clone()).depends_on([b.clone()]).build()[0].fragment);
        incremental.merge(&step(a.clone()).depends_on([c.clone()]).build()[0].fragment);

        let mut single = StepConfig::default();
        single.merge(&step(a).depends_on([b, c]).build()[0].fragment);

        assert_eq!(incremental.upstreams.len(), single.upstreams.len());
        assert_eq!(incremental.upstreams.len(), 2);
    }

    #[test]
    fn pipe_chains_each_step_to_its_predecessor() {
        let a: StepRef = Arc::new(Noop("a"));
        let b: StepRef = Arc::new(Noop("b"));
        let c: StepRef = Arc::new(Noop("c"));

        let decls = pipe([a.clone(), b.clone(), c.clone()]);
        assert_eq!(decls.len(), 2);
        assert!(decls[0].fragment.upstreams.contains(StepId::of(&a)));
        assert!(decls[1].fragment.upstreams.contains(StepId::of(&b)));
    }

    #[test]
    fn batch_pipe_links_every_pair_across_groups() {
        let a: StepRef = Arc::new(Noop("a"));
        let b: StepRef = Arc::new(Noop("b"));
        let c: StepRef = Arc::new(Noop("c"));
        let d: StepRef = Arc::new(Noop("d"));

        let decls = batch_pipe([vec![a.clone(), b.clone()], vec![c.clone(), d.clone()]]);
        assert_eq!(decls.len(), 2);
        for decl in &decls {
            assert!(decl.fragment.upstreams.contains(StepId::of(&a)));
            assert!(decl.fragment.upstreams.contains(StepId::of(&b)));
        }
    }

    #[test]
    fn later_option_modifier_overrides_earlier_one() {
        let a: StepRef = Arc::new(Noop("a"));
        let decls = step(a)
            .timeout(Duration::from_secs(1))
            .timeout(Duration::from_secs(5))
            .build();

        let mut config = StepConfig::default();
        config.merge(&decls[0].fragment);
        assert_eq!(config.options.timeout, Some(Duration::from_secs(5)));
    }
}
