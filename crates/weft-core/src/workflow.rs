//! The scheduler: phases, readiness, concurrency cap, and per-step
//! dispatch.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::{debug, info, warn};

use crate::condition::UpstreamResult;
use crate::config::{StepConfig, StepDecl, StepOptions};
use crate::context::RunContext;
use crate::error::{AggregateError, CycleMember, CycleReport, StepError, WorkflowError};
use crate::introspection;
use crate::status::StepStatus;
use crate::step::{StepId, StepRef};
use crate::tree::StepTree;

/// Which of the three strict-ordered phases a step belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Init,
    Main,
    Defer,
}

impl Phase {
    const ORDER: [Phase; 3] = [Phase::Init, Phase::Main, Phase::Defer];
}

#[derive(Clone, Default)]
struct StepState {
    status: StepStatus,
    error: Option<Arc<WorkflowError>>,
}

struct Inner {
    tree: StepTree,
    configs: HashMap<StepId, StepConfig>,
    states: HashMap<StepId, StepState>,
    phase_of: HashMap<StepId, Phase>,
    attached: HashSet<StepId>,
    default_options: StepOptions,
    /// First-seen order of every id that has ever been a root, so the
    /// aggregate can be reported deterministically instead of in whatever
    /// order the tree's internal map happens to iterate.
    root_order: Vec<StepId>,
    seen_roots: HashSet<StepId>,
}

impl Inner {
    fn new(default_options: StepOptions) -> Self {
        Self {
            tree: StepTree::new(),
            configs: HashMap::new(),
            states: HashMap::new(),
            phase_of: HashMap::new(),
            attached: HashSet::new(),
            default_options,
            root_order: Vec::new(),
            seen_roots: HashSet::new(),
        }
    }

    /// Steps still at the root of the tree, in the order each first became
    /// a root (skipping ones later subsumed by a bigger wrap).
    fn ordered_roots(&self) -> Vec<StepRef> {
        self.root_order
            .iter()
            .filter(|id| self.tree.root_of(**id) == Some(**id))
            .filter_map(|id| self.tree.step_ref(*id).cloned())
            .collect()
    }

    fn config_entry(&mut self, id: StepId) -> &mut StepConfig {
        let default_options = self.default_options.clone();
        self.configs.entry(id).or_insert_with(|| StepConfig {
            options: default_options,
            ..StepConfig::default()
        })
    }

    fn add_one(&mut self, decl: StepDecl, phase: Phase) -> Result<(), WorkflowError> {
        let id = StepId::of(&decl.step);
        let is_new = !self.tree.contains(id);

        let demoted = self.tree.add(&decl.step)?;
        let root_id = self.tree.root_of(id).unwrap_or(id);

        for demoted_id in demoted {
            if demoted_id != root_id {
                if let Some(old_cfg) = self.configs.remove(&demoted_id) {
                    self.config_entry(root_id).absorb(&old_cfg);
                }
            }
        }

        self.phase_of.entry(id).or_insert(phase);
        self.states.entry(id).or_default();
        self.config_entry(root_id).merge(&decl.fragment);

        if self.seen_roots.insert(root_id) {
            self.root_order.push(root_id);
        }

        if is_new && self.attached.insert(id) {
            for nested in decl.step.on_attach() {
                self.add_one(nested, phase)?;
            }
        }
        Ok(())
    }
}

/// Builder for [`Workflow`], carrying the in-process knobs the engine exposes:
/// concurrency cap, panic policy, skip-as-error policy, and a default
/// step-option template.
pub struct WorkflowBuilder {
    max_concurrency: usize,
    dont_panic: bool,
    skip_as_error: bool,
    default_options: StepOptions,
}

impl Default for WorkflowBuilder {
    fn default() -> Self {
        Self {
            max_concurrency: 0,
            dont_panic: true,
            skip_as_error: false,
            default_options: StepOptions::default(),
        }
    }
}

impl WorkflowBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// `0` means unbounded (the default).
    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }

    pub fn dont_panic(mut self, v: bool) -> Self {
        self.dont_panic = v;
        self
    }

    pub fn skip_as_error(mut self, v: bool) -> Self {
        self.skip_as_error = v;
        self
    }

    pub fn default_options(mut self, options: StepOptions) -> Self {
        self.default_options = options;
        self
    }

    pub fn build(self) -> Workflow {
        Workflow {
            shared: Arc::new(WorkflowShared {
                inner: Mutex::new(Inner::new(self.default_options)),
                running: AtomicBool::new(false),
                max_concurrency: self.max_concurrency,
                dont_panic: self.dont_panic,
                skip_as_error: self.skip_as_error,
            }),
        }
    }
}

struct WorkflowShared {
    inner: Mutex<Inner>,
    running: AtomicBool,
    max_concurrency: usize,
    dont_panic: bool,
    skip_as_error: bool,
}

/// A DAG of steps, their accumulated configuration, and the machinery to run
/// them to completion. Cheaply cloneable: clones share the same underlying
/// state (an `Arc`), matching the single-workflow-instance-per-run model.
#[derive(Clone)]
pub struct Workflow {
    shared: Arc<WorkflowShared>,
}

impl Default for Workflow {
    fn default() -> Self {
        Self::new()
    }
}

impl Workflow {
    pub fn new() -> Self {
        WorkflowBuilder::new().build()
    }

    pub fn builder() -> WorkflowBuilder {
        WorkflowBuilder::new()
    }

    /// Adds declarations to the default (`Main`) phase.
    pub async fn add(&self, decls: impl IntoIterator<Item = StepDecl>) -> Result<(), WorkflowError> {
        self.add_in_phase(decls, Phase::Main).await
    }

    /// Adds declarations to the `Init` phase, which runs before `Main`.
    pub async fn init(&self, decls: impl IntoIterator<Item = StepDecl>) -> Result<(), WorkflowError> {
        self.add_in_phase(decls, Phase::Init).await
    }

    /// Adds declarations to the `Defer` phase, which runs after `Main`.
    pub async fn defer(&self, decls: impl IntoIterator<Item = StepDecl>) -> Result<(), WorkflowError> {
        self.add_in_phase(decls, Phase::Defer).await
    }

    async fn add_in_phase(
        &self,
        decls: impl IntoIterator<Item = StepDecl>,
        phase: Phase,
    ) -> Result<(), WorkflowError> {
        let mut inner = self.shared.inner.lock().await;
        for decl in decls {
            inner.add_one(decl, phase)?;
        }
        Ok(())
    }

    /// All root steps currently orchestrated.
    pub async fn steps(&self) -> Vec<StepRef> {
        self.shared.inner.lock().await.ordered_roots()
    }

    /// Upstream results for `step`'s root, as seen at the time of the call.
    pub async fn upstream_of(&self, step: &StepRef) -> Vec<(StepRef, UpstreamResult)> {
        let inner = self.shared.inner.lock().await;
        let id = StepId::of(step);
        let root = inner.tree.root_of(id).unwrap_or(id);
        let Some(config) = inner.configs.get(&root) else {
            return Vec::new();
        };
        config
            .upstreams
            .iter()
            .map(|u| {
                let u_root = inner.tree.root_of(StepId::of(u)).unwrap_or_else(|| StepId::of(u));
                let state = inner.states.get(&u_root).cloned().unwrap_or_default();
                (u.clone(), UpstreamResult::new(state.status, state.error))
            })
            .collect()
    }

    /// The current `(status, error)` for `step`, if it's known to the tree.
    pub async fn state_of(&self, step: &StepRef) -> Option<(StepStatus, Option<Arc<WorkflowError>>)> {
        let inner = self.shared.inner.lock().await;
        let id = StepId::of(step);
        inner.states.get(&id).map(|s| (s.status, s.error.clone()))
    }

    /// Runs every phase to completion. Returns `Ok(())` if every root
    /// succeeded (or was skipped, when `skip_as_error` is `false`); an
    /// `Err(WorkflowError::Aggregate(..))` otherwise, or a preflight/
    /// re-entry error.
    pub async fn run(&self, ctx: &RunContext) -> Result<(), WorkflowError> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(WorkflowError::AlreadyRunning);
        }
        let result = self.run_inner(ctx).await;
        self.shared.running.store(false, Ordering::SeqCst);
        result
    }

    async fn run_inner(&self, ctx: &RunContext) -> Result<(), WorkflowError> {
        self.reset_statuses().await;
        self.preflight().await?;

        for phase in Phase::ORDER {
            self.run_phase(ctx, phase).await;
        }

        self.finalize().await
    }

    async fn reset_statuses(&self) {
        let mut inner = self.shared.inner.lock().await;
        for state in inner.states.values_mut() {
            state.status = StepStatus::Pending;
            state.error = None;
        }
    }

    async fn preflight(&self) -> Result<(), WorkflowError> {
        let inner = self.shared.inner.lock().await;

        for (root_id, config) in &inner.configs {
            for upstream in config.upstreams.iter() {
                if !inner.tree.contains(StepId::of(upstream)) {
                    let step_name = inner
                        .tree
                        .step_ref(*root_id)
                        .map(introspection::display_name)
                        .unwrap_or_else(|| "<unknown>".to_string());
                    return Err(WorkflowError::UnknownUpstream {
                        step: step_name,
                        upstream: upstream.name(),
                    });
                }
            }
        }

        let roots: Vec<StepId> = inner.tree.roots().iter().map(StepId::of).collect();
        let mut marked: HashSet<StepId> = HashSet::new();
        loop {
            let mut progressed = false;
            for &id in &roots {
                if marked.contains(&id) {
                    continue;
                }
                let upstream_roots = self.upstream_roots(&inner, id);
                if upstream_roots.iter().all(|u| marked.contains(u)) {
                    marked.insert(id);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }

        let unmarked: Vec<StepId> = roots.into_iter().filter(|id| !marked.contains(id)).collect();
        if !unmarked.is_empty() {
            let members = unmarked
                .iter()
                .map(|&id| {
                    let name = inner
                        .tree
                        .step_ref(id)
                        .map(introspection::display_name)
                        .unwrap_or_else(|| "<unknown>".to_string());
                    let unresolved = self
                        .upstream_roots(&inner, id)
                        .into_iter()
                        .filter(|u| !marked.contains(u))
                        .map(|u| {
                            inner
                                .tree
                                .step_ref(u)
                                .map(introspection::display_name)
                                .unwrap_or_else(|| "<unknown>".to_string())
                        })
                        .collect();
                    CycleMember {
                        step: name,
                        unresolved_upstreams: unresolved,
                    }
                })
                .collect();
            return Err(WorkflowError::CycleDependency(CycleReport(members)));
        }

        Ok(())
    }

    fn upstream_roots(&self, inner: &Inner, root_id: StepId) -> Vec<StepId> {
        match inner.configs.get(&root_id) {
            Some(config) => config
                .upstreams
                .iter()
                .map(|u| inner.tree.root_of(StepId::of(u)).unwrap_or_else(|| StepId::of(u)))
                .collect(),
            None => Vec::new(),
        }
    }

    async fn run_phase(&self, ctx: &RunContext, phase: Phase) {
        let frontier: Vec<StepId> = {
            let inner = self.shared.inner.lock().await;
            inner
                .tree
                .roots()
                .iter()
                .map(StepId::of)
                .filter(|id| inner.phase_of.get(id).copied() == Some(phase))
                .collect()
        };
        if frontier.is_empty() {
            return;
        }

        let semaphore = if self.shared.max_concurrency > 0 {
            Some(Arc::new(Semaphore::new(self.shared.max_concurrency)))
        } else {
            None
        };
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let mut in_flight = 0usize;

        loop {
            let ready = self.compute_ready(ctx, &frontier).await;
            for (id, decision) in ready {
                match decision {
                    StepStatus::Running => {
                        self.set_status(id, StepStatus::Running, None).await;
                        in_flight += 1;
                        self.dispatch(ctx.clone(), id, semaphore.clone(), tx.clone());
                    }
                    terminal => {
                        self.set_status(id, terminal, None).await;
                    }
                }
            }

            if self.frontier_all_terminal(&frontier).await {
                break;
            }
            if in_flight == 0 {
                // Nothing ready and nothing running but the frontier isn't
                // done: preflight's cycle check should have ruled this out.
                break;
            }
            rx.recv().await;
            in_flight -= 1;
        }
    }

    async fn frontier_all_terminal(&self, frontier: &[StepId]) -> bool {
        let inner = self.shared.inner.lock().await;
        frontier.iter().all(|id| {
            inner
                .states
                .get(id)
                .map(|s| s.status.is_terminal())
                .unwrap_or(false)
        })
    }

    async fn compute_ready(&self, ctx: &RunContext, frontier: &[StepId]) -> Vec<(StepId, StepStatus)> {
        let inner = self.shared.inner.lock().await;
        let ctx_canceled = ctx.is_canceled();
        let mut out = Vec::new();

        for &id in frontier {
            let Some(state) = inner.states.get(&id) else {
                continue;
            };
            if state.status != StepStatus::Pending {
                continue;
            }
            let config = inner.configs.get(&id).cloned().unwrap_or_default();

            let mut upstream_results = Vec::with_capacity(config.upstreams.len());
            let mut all_terminal = true;
            for upstream in config.upstreams.iter() {
                let u_root = inner
                    .tree
                    .root_of(StepId::of(upstream))
                    .unwrap_or_else(|| StepId::of(upstream));
                let Some(u_state) = inner.states.get(&u_root) else {
                    all_terminal = false;
                    break;
                };
                if !u_state.status.is_terminal() {
                    all_terminal = false;
                    break;
                }
                upstream_results.push(UpstreamResult::new(u_state.status, u_state.error.clone()));
            }
            if !all_terminal {
                continue;
            }

            let decision = config.options.condition.evaluate(ctx_canceled, &upstream_results);
            out.push((id, decision));
        }
        out
    }

    async fn set_status(&self, id: StepId, status: StepStatus, error: Option<Arc<WorkflowError>>) {
        let mut inner = self.shared.inner.lock().await;
        if let Some(state) = inner.states.get_mut(&id) {
            debug!(?status, "step status transition");
            state.status = status;
            state.error = error;
        }
    }

    fn dispatch(
        &self,
        ctx: RunContext,
        id: StepId,
        semaphore: Option<Arc<Semaphore>>,
        done: mpsc::UnboundedSender<()>,
    ) {
        let workflow = self.clone();
        tokio::spawn(async move {
            let _permit = match &semaphore {
                Some(sem) => sem.clone().acquire_owned().await.ok(),
                None => None,
            };
            workflow.execute_step(ctx, id).await;
            let _ = done.send(());
        });
    }

    async fn execute_step(&self, ctx: RunContext, id: StepId) {
        let (step, config) = {
            let inner = self.shared.inner.lock().await;
            (inner.tree.step_ref(id).cloned(), inner.configs.get(&id).cloned())
        };
        let (Some(step), Some(config)) = (step, config) else {
            return;
        };

        let name = introspection::display_name(&step);
        debug!(step = %name, "step dispatched");

        let (status, error) = self.run_one_attempt_sequence(&ctx, &step, &config, &name).await;

        info!(step = %name, %status, "step terminated");
        self.set_status(id, status, error.map(Arc::new)).await;
    }

    async fn run_one_attempt_sequence(
        &self,
        ctx: &RunContext,
        step: &StepRef,
        config: &StepConfig,
        name: &str,
    ) -> (StepStatus, Option<WorkflowError>) {
        let attempt_ctx = match config.options.timeout {
            Some(t) => ctx.child_with_timeout(t),
            None => ctx.child(),
        };

        let mut hook_ctx = attempt_ctx.clone();
        let mut current: Option<StepError> = None;
        let mut origin = ErrorOrigin::Attempt;

        for hook in &config.before {
            match hook(hook_ctx.clone(), step.clone()).await {
                Ok(updated) => hook_ctx = updated,
                Err(e) => {
                    current = Some(e);
                    origin = ErrorOrigin::BeforeStep;
                    break;
                }
            }
        }

        if current.is_none() {
            let panicked = Arc::new(AtomicBool::new(false));
            current = self
                .run_retry(&hook_ctx, &config.options.retry, step, name, panicked.clone())
                .await
                .err();
            if panicked.load(Ordering::SeqCst) {
                origin = ErrorOrigin::Panic;
            }
        }

        for hook in &config.after {
            current = hook(hook_ctx.clone(), step.clone(), current).await;
        }

        self.status_from_error(ctx, &attempt_ctx, name, current, origin)
    }

    async fn run_retry(
        &self,
        ctx: &RunContext,
        policy: &crate::retry::RetryPolicy,
        step: &StepRef,
        name: &str,
        panicked: Arc<AtomicBool>,
    ) -> Result<(), StepError> {
        let dont_panic = self.shared.dont_panic;
        crate::retry::run_with_retry(ctx, policy, name, move |attempt_ctx| {
            let step = step.clone();
            let panicked = panicked.clone();
            async move {
                if dont_panic {
                    let attempt_ctx_for_task = attempt_ctx.clone();
                    let step_for_task = step.clone();
                    match tokio::spawn(async move { step_for_task.run(&attempt_ctx_for_task).await }).await {
                        Ok(result) => result,
                        Err(join_err) => {
                            panicked.store(true, Ordering::SeqCst);
                            Err(StepError::failed(panic_message(join_err)))
                        }
                    }
                } else {
                    step.run(&attempt_ctx).await
                }
            }
        })
        .await
    }

    fn status_from_error(
        &self,
        run_ctx: &RunContext,
        attempt_ctx: &RunContext,
        name: &str,
        error: Option<StepError>,
        origin: ErrorOrigin,
    ) -> (StepStatus, Option<WorkflowError>) {
        let Some(err) = error else {
            return (StepStatus::Succeeded, None);
        };

        if let Some(intent) = err.status_intent() {
            let wrapped = if intent == StepStatus::Succeeded {
                None
            } else {
                Some(WorkflowError::step_failed(name, err.into_inner()))
            };
            return (intent, wrapped);
        }

        if run_ctx.is_canceled() || attempt_ctx.is_canceled() {
            return (StepStatus::Canceled, Some(WorkflowError::Canceled { name: name.to_string() }));
        }

        let wrapped = match origin {
            ErrorOrigin::Panic => WorkflowError::Panic {
                name: name.to_string(),
                message: err.into_inner().to_string(),
            },
            ErrorOrigin::BeforeStep => WorkflowError::BeforeStep {
                name: name.to_string(),
                source: err.into_inner(),
            },
            ErrorOrigin::Attempt => WorkflowError::step_failed(name, err.into_inner()),
        };
        (StepStatus::Failed, Some(wrapped))
    }

    async fn finalize(&self) -> Result<(), WorkflowError> {
        let inner = self.shared.inner.lock().await;
        let mut entries = Vec::new();
        let mut all_ok = true;

        for root in inner.ordered_roots() {
            let id = StepId::of(&root);
            let state = inner.states.get(&id).cloned().unwrap_or_default();
            if !state.status.is_success(self.shared.skip_as_error) {
                all_ok = false;
            }
            entries.push((introspection::display_name(&root), state.status, state.error));
        }

        if all_ok {
            Ok(())
        } else {
            warn!(failures = entries.len(), "workflow finished without full success");
            Err(WorkflowError::Aggregate(AggregateError { entries }))
        }
    }
}

/// Where an attempt's terminal error came from, so `status_from_error` can
/// pick the matching `WorkflowError` variant instead of collapsing every
/// failure into the generic step-failed one.
enum ErrorOrigin {
    Attempt,
    BeforeStep,
    Panic,
}

fn panic_message(err: tokio::task::JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => {
            if let Some(s) = payload.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "step panicked".to_string()
            }
        }
        Err(_) => "step task was cancelled".to_string(),
    }
}
