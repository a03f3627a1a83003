//! Autofix coordinator - the bounded fix loop
//!
//! Each iteration walks `Extracting → Routing → Applying → ReVerifying` and
//! then stops (`Converged`, `Exhausted`, `Failed`) or continues. The loop
//! is bounded only by `max_iterations`; there is no progress heuristic, so
//! an iteration that makes things worse simply spends budget.
//!
//! Agents run asynchronously. The coordinator itself is synchronous and
//! drives agent work and hook re-runs through the [`AsyncBridge`], so it is
//! safe to call from plain threads and from inside a tokio runtime alike.
//! All agent work in one iteration shares one wall-clock deadline; when it
//! passes, in-flight agents are cancelled and the loop re-verifies whatever
//! was written before the deadline.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vigil_agents::{
    plan, plan_excluding, AgentBatch, AgentContext, AgentRegistry, DispatchPlan, FixAgent,
    Unassigned,
};
use vigil_core::{
    BudgetMode, ErrorClass, FixResult, HookResult, HookSpec, HookStatus, Issue, IterationState,
    Stage, VigilConfig, VigilError,
};
use vigil_hooks::HookExecutor;

use crate::aggregator::{aggregate, Aggregation, ExtractionFailure};
use crate::bridge::AsyncBridge;
use crate::progress::ProgressSink;
use crate::state_machine::Phase;

/// Time past the iteration deadline allowed for agents to hand back results
pub const APPLY_GRACE: Duration = Duration::from_secs(2);

/// Where the coordinator is within an iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CoordinatorState {
    Idle,
    Extracting,
    Routing,
    Applying,
    ReVerifying,
    Continue,
    Converged,
    Exhausted,
    Failed,
}

/// Terminal result of an autofix loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum LoopOutcome {
    Converged,
    Exhausted,
    Failed { class: ErrorClass, message: String },
}

impl LoopOutcome {
    fn from_failure(failure: ExtractionFailure) -> Self {
        Self::Failed {
            class: failure.class,
            message: failure.message,
        }
    }

    fn from_error(err: &VigilError) -> Self {
        Self::from_failure(ExtractionFailure::from_error(err))
    }

    fn final_state(&self) -> CoordinatorState {
        match self {
            Self::Converged => CoordinatorState::Converged,
            Self::Exhausted => CoordinatorState::Exhausted,
            Self::Failed { .. } => CoordinatorState::Failed,
        }
    }
}

/// Loop policy
#[derive(Debug, Clone)]
pub struct AutofixSettings {
    pub max_iterations: usize,
    pub iteration_timeout: Duration,
    pub batch: bool,
    pub collaborative: bool,
}

impl Default for AutofixSettings {
    fn default() -> Self {
        Self::from_config(&VigilConfig::default(), BudgetMode::Standard)
    }
}

impl AutofixSettings {
    pub fn from_config(config: &VigilConfig, mode: BudgetMode) -> Self {
        Self {
            max_iterations: mode.max_iterations(&config.autofix),
            iteration_timeout: config.autofix.iteration_timeout(),
            batch: config.autofix.batch,
            collaborative: config.autofix.collaborative,
        }
    }
}

/// An agent call that returned an error or panicked
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentFailure {
    pub agent: String,
    pub message: String,
    pub panicked: bool,
}

/// An issue no agent took, with the closest candidate
#[derive(Debug, Clone, Serialize)]
pub struct UnassignedIssue {
    pub issue: Issue,
    pub best_agent: Option<String>,
    pub best_confidence: f64,
}

impl From<&Unassigned> for UnassignedIssue {
    fn from(unassigned: &Unassigned) -> Self {
        Self {
            issue: unassigned.issue.clone(),
            best_agent: unassigned.best_agent.clone(),
            best_confidence: unassigned.best_confidence,
        }
    }
}

/// Summary of one iteration
#[derive(Debug, Clone, Default, Serialize)]
pub struct IterationRecord {
    pub index: usize,
    pub issues_at_start: usize,
    pub issues_at_end: usize,
    pub assigned: usize,
    pub unassigned: usize,
    /// Issues given to a second agent after the first returned them
    pub handed_off: usize,
    pub fixes_applied: Vec<String>,
    pub files_modified: BTreeSet<PathBuf>,
    pub agent_failures: Vec<AgentFailure>,
    /// The deadline passed before every agent finished
    pub partially_applied: bool,
    pub duration: Duration,
}

/// Everything the loop produced
#[derive(Debug, Clone, Serialize)]
pub struct AutofixReport {
    pub outcome: LoopOutcome,
    pub final_state: CoordinatorState,
    pub state: IterationState,
    pub iterations: Vec<IterationRecord>,
    /// Issues left unassigned in the last routed iteration
    pub unassigned: Vec<UnassignedIssue>,
    /// Latest result per hook
    pub results: Vec<HookResult>,
    pub remaining_issues: Vec<Issue>,
}

impl AutofixReport {
    pub fn iterations_run(&self) -> usize {
        self.state.iteration_index
    }
}

/// What came back from one agent call
enum BatchResult {
    Fixed(FixResult),
    Failed { message: String, panicked: bool },
    Cancelled,
}

struct BatchOutcome {
    agent: String,
    result: BatchResult,
}

/// Agent work collected during one iteration's apply step
#[derive(Debug, Default)]
struct ApplyOutcome {
    results: Vec<FixResult>,
    failures: Vec<AgentFailure>,
    handed_off: usize,
    partially_applied: bool,
}

impl ApplyOutcome {
    fn record(&mut self, registry: &AgentRegistry, batch: BatchOutcome) {
        match batch.result {
            BatchResult::Fixed(result) => {
                registry.record_success(&batch.agent);
                debug!(
                    "{}: {} fixes, {} files, {} remaining",
                    batch.agent,
                    result.fixes_applied.len(),
                    result.files_modified.len(),
                    result.remaining_issues.len()
                );
                self.results.push(result);
            }
            BatchResult::Failed { message, panicked } => {
                registry.record_failure(&batch.agent);
                warn!("Agent {} failed: {}", batch.agent, message);
                self.failures.push(AgentFailure {
                    agent: batch.agent,
                    message,
                    panicked,
                });
            }
            BatchResult::Cancelled => debug!("Agent {} cancelled", batch.agent),
        }
    }
}

/// Runs the autofix loop over a set of failing hook results
pub struct AutofixCoordinator {
    executor: HookExecutor,
    registry: Arc<AgentRegistry>,
    /// Every hook that may need re-running, with its stage
    hooks: Vec<(HookSpec, Stage)>,
    settings: AutofixSettings,
    progress: ProgressSink,
    bridge: AsyncBridge,
    cancel: CancellationToken,
}

impl AutofixCoordinator {
    pub fn new(
        executor: HookExecutor,
        registry: Arc<AgentRegistry>,
        hooks: Vec<(HookSpec, Stage)>,
        settings: AutofixSettings,
    ) -> Self {
        Self {
            executor,
            registry,
            hooks,
            settings,
            progress: ProgressSink::default(),
            bridge: AsyncBridge::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_bridge(mut self, bridge: AsyncBridge) -> Self {
        self.bridge = bridge;
        self
    }

    pub fn settings(&self) -> &AutofixSettings {
        &self.settings
    }

    /// Run the loop until it converges, spends its budget or fails.
    ///
    /// `initial` holds the latest result of every hook that ran.
    pub fn run(&self, initial: Vec<HookResult>) -> AutofixReport {
        let max = self.settings.max_iterations;
        let mut latest = initial;
        let mut iteration = IterationState::new(max);
        let mut records: Vec<IterationRecord> = Vec::new();
        let mut unassigned: Vec<UnassignedIssue> = Vec::new();
        let mut state = CoordinatorState::Idle;

        info!("Starting autofix loop (max {} iterations)", max);

        let outcome = loop {
            self.enter(&mut state, CoordinatorState::Extracting);
            let extracted = aggregate(&latest);
            if let Some(failure) = extracted.extraction_failure() {
                break LoopOutcome::from_failure(failure);
            }
            if extracted.issues.is_empty() {
                break LoopOutcome::Converged;
            }
            if iteration.budget_spent() {
                break LoopOutcome::Exhausted;
            }
            if self.cancel.is_cancelled() {
                break LoopOutcome::from_error(&VigilError::Cancelled);
            }
            if !self.registry.any_available() {
                break LoopOutcome::from_error(&VigilError::AgentUnavailable(
                    "every registered agent is disabled".to_string(),
                ));
            }

            iteration.begin(extracted.issue_count());
            let index = iteration.iteration_index;
            info!("=== Iteration {} of {} ===", index, max);
            self.progress.iteration_started(index, extracted.issue_count());
            let started = Instant::now();
            let mut record = IterationRecord {
                index,
                issues_at_start: extracted.issue_count(),
                ..Default::default()
            };

            // Routing
            self.enter(&mut state, CoordinatorState::Routing);
            let dispatch = plan(&self.registry, &extracted.issues, self.settings.batch);
            record.assigned = dispatch.assigned_count();
            record.unassigned = dispatch.unassigned.len();
            unassigned = dispatch.unassigned.iter().map(UnassignedIssue::from).collect();
            if !dispatch.unassigned.is_empty() {
                info!(
                    "{} issues left unassigned (below {:.2} confidence)",
                    dispatch.unassigned.len(),
                    self.registry.threshold()
                );
            }

            // Applying
            self.enter(&mut state, CoordinatorState::Applying);
            match self.apply(dispatch) {
                Ok(applied) => {
                    record.partially_applied = applied.partially_applied;
                    record.handed_off = applied.handed_off;
                    record.agent_failures = applied.failures;
                    for result in applied.results {
                        record.fixes_applied.extend(result.fixes_applied);
                        record.files_modified.extend(result.files_modified);
                    }
                }
                Err(VigilError::Cancelled) => {
                    break LoopOutcome::from_error(&VigilError::Cancelled);
                }
                Err(VigilError::AgentTimeout { timeout_secs }) => {
                    warn!(
                        "Agents did not hand back results within {}s; re-verifying anyway",
                        timeout_secs
                    );
                    record.partially_applied = true;
                }
                Err(e) => break LoopOutcome::from_error(&e),
            }

            // ReVerifying
            self.enter(&mut state, CoordinatorState::ReVerifying);
            let affected = self.affected_hooks(&extracted, &latest);
            match self.reverify(affected) {
                Ok(results) => merge_results(&mut latest, results),
                Err(e) => break LoopOutcome::from_error(&e),
            }

            let remaining = aggregate(&latest);
            iteration.finish(remaining.issue_count());
            record.issues_at_end = remaining.issue_count();
            record.duration = started.elapsed();
            info!(
                "Iteration {}: {} -> {} issues ({} fixes applied{})",
                index,
                record.issues_at_start,
                record.issues_at_end,
                record.fixes_applied.len(),
                if record.partially_applied { ", partial" } else { "" }
            );
            self.progress.iteration_finished(index, remaining.issue_count());
            records.push(record);

            if let Some(failure) = remaining.extraction_failure() {
                break LoopOutcome::from_failure(failure);
            }
            if iteration.is_converged() {
                break LoopOutcome::Converged;
            }
            if !iteration.should_continue() {
                break LoopOutcome::Exhausted;
            }
            self.enter(&mut state, CoordinatorState::Continue);
        };

        self.enter(&mut state, outcome.final_state());
        let remaining_issues = aggregate(&latest).issues;
        match &outcome {
            LoopOutcome::Converged => info!(
                "Autofix converged after {} iterations",
                iteration.iteration_index
            ),
            LoopOutcome::Exhausted => warn!(
                "Autofix exhausted after {} iterations, {} issues remain",
                iteration.iteration_index,
                remaining_issues.len()
            ),
            LoopOutcome::Failed { class, message } => {
                warn!("Autofix failed ({}): {}", class, message)
            }
        }

        AutofixReport {
            outcome,
            final_state: state,
            state: iteration,
            iterations: records,
            unassigned,
            results: latest,
            remaining_issues,
        }
    }

    fn enter(&self, state: &mut CoordinatorState, next: CoordinatorState) {
        debug!("Coordinator: {:?} -> {:?}", state, next);
        *state = next;
    }

    /// Run the dispatch plan under the iteration deadline
    fn apply(&self, dispatch: DispatchPlan) -> vigil_core::Result<ApplyOutcome> {
        if dispatch.is_empty() {
            return Ok(ApplyOutcome::default());
        }
        let ctx = AgentContext::new(
            self.executor.project_root(),
            self.executor.runner(),
            self.cancel.child_token(),
        );
        let registry = Arc::clone(&self.registry);
        let settings = self.settings.clone();
        let bound = settings.iteration_timeout + APPLY_GRACE;
        self.bridge
            .run_bounded(apply_plan(registry, dispatch, ctx, settings), bound, &self.cancel)
    }

    /// Hooks that were not passing when the iteration started
    fn affected_hooks(
        &self,
        extracted: &Aggregation,
        latest: &[HookResult],
    ) -> Vec<(HookSpec, Stage)> {
        let blocking: Vec<&str> = latest
            .iter()
            .filter(|r| r.status.is_blocking())
            .map(|r| r.name.as_str())
            .collect();
        debug!(
            "Re-verifying {} hooks for {} issues",
            blocking.len(),
            extracted.issue_count()
        );

        blocking
            .into_iter()
            .filter_map(|name| {
                let found = self.hooks.iter().find(|(spec, _)| spec.name == name);
                if found.is_none() {
                    warn!("No spec for hook {}; keeping its last result", name);
                }
                found.cloned()
            })
            .collect()
    }

    fn reverify(&self, affected: Vec<(HookSpec, Stage)>) -> vigil_core::Result<Vec<HookResult>> {
        let executor = self.executor.clone();
        let cancel = self.cancel.clone();
        let results = self.bridge.run(
            async move {
                let mut results = Vec::new();
                for stage in [Stage::FastHooks, Stage::ComprehensiveHooks] {
                    let hooks: Vec<HookSpec> = affected
                        .iter()
                        .filter(|(_, s)| *s == stage)
                        .map(|(spec, _)| spec.clone())
                        .collect();
                    if !hooks.is_empty() {
                        results.extend(executor.run_hooks(&hooks, stage, &cancel).await);
                    }
                }
                results
            },
            &self.cancel,
        )?;

        for result in &results {
            self.progress.hook_finished(Phase::AutofixLoop, result);
        }
        if results.iter().any(|r| r.status == HookStatus::Skipped) && self.cancel.is_cancelled() {
            return Err(VigilError::Cancelled);
        }
        Ok(results)
    }
}

/// Replace each hook's result with its re-run
fn merge_results(latest: &mut Vec<HookResult>, rerun: Vec<HookResult>) {
    for result in rerun {
        match latest.iter_mut().find(|r| r.name == result.name) {
            Some(slot) => *slot = result,
            None => latest.push(result),
        }
    }
}

/// Run every agent's batches, then one collaborative hand-off round
async fn apply_plan(
    registry: Arc<AgentRegistry>,
    dispatch: DispatchPlan,
    ctx: AgentContext,
    settings: AutofixSettings,
) -> ApplyOutcome {
    let deadline = tokio::time::Instant::now() + settings.iteration_timeout;
    let mut outcome = ApplyOutcome::default();

    run_wave(&registry, dispatch.by_agent(), &ctx, deadline, &mut outcome).await;

    if settings.collaborative && !outcome.partially_applied {
        // One hand-off per issue: each returned issue goes to a different agent
        let mut returned_by: HashMap<String, String> = HashMap::new();
        let mut handoff: Vec<Issue> = Vec::new();
        for result in &outcome.results {
            for issue in &result.remaining_issues {
                if !returned_by.contains_key(&issue.id) {
                    returned_by.insert(issue.id.clone(), result.agent.clone());
                    handoff.push(issue.clone());
                }
            }
        }

        if !handoff.is_empty() {
            let second = plan_excluding(&registry, &handoff, settings.batch, |issue| {
                returned_by.get(&issue.id).cloned()
            });
            if !second.is_empty() {
                debug!("Handing off {} issues to a second agent", second.assigned_count());
                outcome.handed_off = second.assigned_count();
                run_wave(&registry, second.by_agent(), &ctx, deadline, &mut outcome).await;
            }
        }
    }
    outcome
}

/// Run agents concurrently, each over its own batches in order
async fn run_wave(
    registry: &AgentRegistry,
    groups: Vec<(Arc<dyn FixAgent>, Vec<AgentBatch>)>,
    ctx: &AgentContext,
    deadline: tokio::time::Instant,
    outcome: &mut ApplyOutcome,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<BatchOutcome>();
    let mut tasks = JoinSet::new();

    // Agents may block their thread, so each runs off the runtime's own
    // thread and the deadline below keeps ticking
    let handle = tokio::runtime::Handle::current();
    for (agent, batches) in groups {
        let tx = tx.clone();
        let ctx = ctx.clone();
        let handle = handle.clone();
        tasks.spawn_blocking(move || handle.block_on(run_batches(agent, batches, ctx, tx)));
    }
    drop(tx);

    let timer = tokio::time::sleep_until(deadline);
    tokio::pin!(timer);
    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(batch) => outcome.record(registry, batch),
                None => break,
            },
            _ = &mut timer => {
                warn!("Iteration deadline reached; keeping fixes applied so far");
                outcome.partially_applied = true;
                ctx.cancel.cancel();
                while let Ok(batch) = rx.try_recv() {
                    outcome.record(registry, batch);
                }
                // A blocked agent cannot be aborted; leave it behind
                tasks.detach_all();
                return;
            }
        }
    }
    while tasks.join_next().await.is_some() {}
}

/// One agent's batches in order, each outcome sent as it completes
async fn run_batches(
    agent: Arc<dyn FixAgent>,
    batches: Vec<AgentBatch>,
    ctx: AgentContext,
    tx: mpsc::UnboundedSender<BatchOutcome>,
) {
    for batch in batches {
        if ctx.cancel.is_cancelled() {
            break;
        }
        let attempt = AssertUnwindSafe(agent.fix(&batch.issues, &ctx))
            .catch_unwind()
            .await;
        let result = match attempt {
            Ok(Ok(result)) => BatchResult::Fixed(result),
            Ok(Err(VigilError::Cancelled)) => BatchResult::Cancelled,
            Ok(Err(e)) => BatchResult::Failed {
                message: e.to_string(),
                panicked: false,
            },
            Err(payload) => BatchResult::Failed {
                message: panic_message(payload.as_ref()),
                panicked: true,
            },
        };
        let sent = tx.send(BatchOutcome {
            agent: agent.name().to_string(),
            result,
        });
        if sent.is_err() {
            break;
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {}", message)
    } else {
        "panicked".to_string()
    }
}
