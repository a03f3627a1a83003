//! Phase orchestrator
//!
//! Drives [`transition`] from `ConfigPrep` to a terminal state. The state
//! machine decides; this module only executes the actions it returns and
//! feeds the outcomes back as events.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vigil_agents::{registry_from_config, AgentRegistry};
use vigil_core::{
    BudgetMode, ErrorClass, HookResult, HookSpec, Issue, Stage, VigilConfig, VigilError,
};
use vigil_hooks::{CommandRunner, HookExecutor, ParserRegistry};

use crate::aggregator::aggregate;
use crate::bridge::AsyncBridge;
use crate::coordinator::{AutofixCoordinator, AutofixSettings};
use crate::downstream::{CommandStep, DownstreamStep, StepContext};
use crate::progress::ProgressSink;
use crate::report::{AutofixSummary, PipelineReport};
use crate::state_machine::{transition, Action, Event, Phase, Policy, StageSummary, State};

/// Which hook stages a run covers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PhaseSelection {
    #[default]
    All,
    FastOnly,
    ComprehensiveOnly,
}

/// Per-run choices layered over the config file
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub phases: PhaseSelection,
    pub autofix: bool,
    pub mode: BudgetMode,
    pub skip_downstream: bool,
}

impl PipelineOptions {
    /// Options implied by the config alone
    pub fn from_config(config: &VigilConfig) -> Self {
        Self {
            autofix: config.autofix.enabled,
            ..Default::default()
        }
    }

    pub fn policy(&self) -> Policy {
        Policy {
            run_fast: self.phases != PhaseSelection::ComprehensiveOnly,
            run_comprehensive: self.phases != PhaseSelection::FastOnly,
            autofix: self.autofix,
            downstream: !self.skip_downstream,
        }
    }
}

/// Latest result of every hook, per stage
#[derive(Debug, Default)]
struct Results {
    fast: Vec<HookResult>,
    comprehensive: Vec<HookResult>,
}

impl Results {
    fn all(&self) -> Vec<HookResult> {
        self.fast.iter().chain(&self.comprehensive).cloned().collect()
    }

    fn summary(&self) -> StageSummary {
        StageSummary::from_aggregation(&aggregate(self.fast.iter().chain(&self.comprehensive)))
    }

    fn unresolved(&self) -> Vec<Issue> {
        aggregate(self.fast.iter().chain(&self.comprehensive)).issues
    }

    fn store(&mut self, stage: Stage, results: Vec<HookResult>) {
        match stage {
            Stage::FastHooks => self.fast = results,
            Stage::ComprehensiveHooks => self.comprehensive = results,
        }
    }
}

/// One full quality run over a project
pub struct Pipeline {
    config: VigilConfig,
    project_root: PathBuf,
    executor: HookExecutor,
    registry: Arc<AgentRegistry>,
    downstream: Vec<Arc<dyn DownstreamStep>>,
    options: PipelineOptions,
    progress: ProgressSink,
    bridge: AsyncBridge,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(
        config: VigilConfig,
        project_root: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let project_root = project_root.into();
        let executor = HookExecutor::new(
            Arc::clone(&runner),
            Arc::new(ParserRegistry::with_builtin()),
            project_root.clone(),
        )
        .with_max_parallel(config.execution.max_parallel_hooks);
        let downstream: Vec<Arc<dyn DownstreamStep>> = config
            .downstream
            .steps
            .iter()
            .filter(|spec| spec.enabled)
            .map(|spec| {
                let step = CommandStep::new(spec.clone(), Arc::clone(&runner));
                Arc::new(step) as Arc<dyn DownstreamStep>
            })
            .collect();

        Self {
            registry: Arc::new(registry_from_config(&config)),
            options: PipelineOptions::from_config(&config),
            progress: ProgressSink::new(config.progress.buffer),
            config,
            project_root,
            executor,
            downstream,
            bridge: AsyncBridge::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_registry(mut self, registry: AgentRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    /// Replace the configured downstream steps
    pub fn with_downstream(mut self, steps: Vec<Arc<dyn DownstreamStep>>) -> Self {
        self.downstream = steps;
        self
    }

    pub fn with_bridge(mut self, bridge: AsyncBridge) -> Self {
        self.bridge = bridge;
        self
    }

    pub fn progress(&self) -> &ProgressSink {
        &self.progress
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Run every selected phase and return the closed report.
    ///
    /// Never panics on hook, parser or agent failures; those end up in the
    /// report's halt diagnostic.
    pub fn run(&self) -> PipelineReport {
        let policy = self.options.policy();
        let mut report = PipelineReport::new(&self.project_root);
        let mut results = Results::default();

        info!(
            "Starting run {} in {}",
            report.run_id,
            self.project_root.display()
        );

        let start = match self.config.validate() {
            Ok(()) => Event::Start,
            Err(e) => Event::Error {
                class: e.class(),
                message: e.to_string(),
            },
        };
        let (mut state, mut actions) = transition(State::ConfigPrep, start, &policy);

        while !state.is_terminal() {
            let mut event = None;
            for action in actions {
                let is_work = !matches!(action, Action::LogActivity { .. });
                if is_work && self.cancel.is_cancelled() {
                    warn!("Cancelled before {:?}", action);
                    event = Some(Event::Cancelled);
                    continue;
                }
                if let Some(next) = self.execute(action, &policy, &mut results, &mut report) {
                    event = Some(next);
                }
            }
            let event = event.unwrap_or_else(|| Event::Error {
                class: ErrorClass::Internal,
                message: format!("state {:?} produced no work", state),
            });
            (state, actions) = transition(state, event, &policy);
        }
        for action in actions {
            if let Action::LogActivity { message } = action {
                info!("{}", message);
            }
        }

        self.close(state, &results, &mut report);
        report
    }

    fn execute(
        &self,
        action: Action,
        policy: &Policy,
        results: &mut Results,
        report: &mut PipelineReport,
    ) -> Option<Event> {
        let event = match action {
            Action::LogActivity { message } => {
                info!("{}", message);
                return None;
            }
            Action::RunFastHooks { attempt } => {
                match self.run_stage(Phase::FastHooks, attempt, Stage::FastHooks, results, report) {
                    Ok(()) => {
                        let fast = aggregate(&results.fast);
                        Event::FastHooksFinished(StageSummary::from_aggregation(&fast))
                    }
                    Err(e) => error_event(e),
                }
            }
            Action::RunComprehensiveHooks => {
                match self.run_stage(
                    Phase::ComprehensiveHooks,
                    1,
                    Stage::ComprehensiveHooks,
                    results,
                    report,
                ) {
                    Ok(()) => Event::ComprehensiveHooksFinished(results.summary()),
                    Err(e) => error_event(e),
                }
            }
            Action::RunAutofix => self.run_autofix(policy, results, report),
            Action::RunConfirmation => {
                let stages = selected_stages(policy);
                for stage in stages {
                    if let Err(e) =
                        self.run_stage(Phase::ReVerification, 1, stage, results, report)
                    {
                        return Some(error_event(e));
                    }
                }
                Event::ConfirmationFinished(results.summary())
            }
            Action::RunDownstream => self.run_downstream(report),
        };
        Some(event)
    }

    fn hooks_for(&self, stage: Stage) -> &[HookSpec] {
        match stage {
            Stage::FastHooks => &self.config.hooks.fast,
            Stage::ComprehensiveHooks => &self.config.hooks.comprehensive,
        }
    }

    fn run_stage(
        &self,
        phase: Phase,
        attempt: u8,
        stage: Stage,
        results: &mut Results,
        report: &mut PipelineReport,
    ) -> vigil_core::Result<()> {
        self.progress.phase_started(phase);
        let started = Instant::now();

        let hooks = self.hooks_for(stage).to_vec();
        let executor = self.executor.clone();
        let cancel = self.cancel.clone();
        let stage_results = self.bridge.run(
            async move { executor.run_hooks(&hooks, stage, &cancel).await },
            &self.cancel,
        )?;
        if self.cancel.is_cancelled() {
            return Err(VigilError::Cancelled);
        }

        for result in &stage_results {
            self.progress.hook_finished(phase, result);
        }
        report.record_phase(phase, attempt, started.elapsed(), &stage_results);
        self.progress
            .phase_finished(phase, aggregate(&stage_results).issue_count());
        results.store(stage, stage_results);
        Ok(())
    }

    fn run_autofix(
        &self,
        policy: &Policy,
        results: &mut Results,
        report: &mut PipelineReport,
    ) -> Event {
        self.progress.phase_started(Phase::AutofixLoop);
        let hooks: Vec<(HookSpec, Stage)> = selected_stages(policy)
            .into_iter()
            .flat_map(|stage| {
                self.hooks_for(stage)
                    .iter()
                    .cloned()
                    .map(move |spec| (spec, stage))
            })
            .collect();

        let coordinator = AutofixCoordinator::new(
            self.executor.clone(),
            Arc::clone(&self.registry),
            hooks,
            AutofixSettings::from_config(&self.config, self.options.mode),
        )
        .with_progress(self.progress.clone())
        .with_cancel(self.cancel.clone())
        .with_bridge(self.bridge.clone());

        let outcome = coordinator.run(results.all());
        let (fast, comprehensive): (Vec<HookResult>, Vec<HookResult>) = outcome
            .results
            .iter()
            .cloned()
            .partition(|r| r.stage == Stage::FastHooks);
        results.fast = fast;
        results.comprehensive = comprehensive;
        report.autofix = Some(AutofixSummary::from(&outcome));
        self.progress
            .phase_finished(Phase::AutofixLoop, outcome.remaining_issues.len());

        Event::AutofixFinished(outcome.outcome)
    }

    fn run_downstream(&self, report: &mut PipelineReport) -> Event {
        self.progress.phase_started(Phase::Downstream);
        let ctx = StepContext {
            project_root: self.project_root.clone(),
            cancel: self.cancel.clone(),
        };

        for step in &self.downstream {
            let name = step.name().to_string();
            info!("Downstream step: {}", name);
            let started = Instant::now();
            let task_step = Arc::clone(step);
            let task_ctx = ctx.clone();
            let ran = self
                .bridge
                .run(async move { task_step.run(&task_ctx).await }, &self.cancel)
                .and_then(|outcome| outcome);

            match ran {
                Ok(outcome) => {
                    report.record_step(
                        &name,
                        outcome.success,
                        started.elapsed(),
                        Some(outcome.message.clone()),
                    );
                    if !outcome.success {
                        return Event::DownstreamFailed {
                            step: name,
                            message: outcome.message,
                        };
                    }
                }
                Err(e) => {
                    report.record_step(&name, false, started.elapsed(), Some(e.to_string()));
                    return error_event(e);
                }
            }
        }

        self.progress.phase_finished(Phase::Downstream, 0);
        Event::DownstreamPassed
    }

    /// Close the report for a terminal state and publish it
    fn close(&self, state: State, results: &Results, report: &mut PipelineReport) {
        match state {
            State::Halted { phase, reason } => {
                let unresolved = results.unresolved();
                error!(
                    "Run halted in {} ({} unresolved issues): {}",
                    phase,
                    unresolved.len(),
                    reason
                );
                let iteration = report.autofix.as_ref().map(|a| a.iterations_run);
                self.progress
                    .halted(phase, &reason, iteration, unresolved.len());
                report.halt(phase, reason, unresolved);
            }
            _ => {
                info!("Run complete");
                self.progress.completed();
                report.complete();
            }
        }

        if self.config.report.enabled {
            let path = self.project_root.join(&self.config.report.path);
            if report.persist(&path) {
                info!("Report written to {}", path.display());
            }
        }
    }
}

fn selected_stages(policy: &Policy) -> Vec<Stage> {
    let mut stages = Vec::new();
    if policy.run_fast {
        stages.push(Stage::FastHooks);
    }
    if policy.run_comprehensive {
        stages.push(Stage::ComprehensiveHooks);
    }
    stages
}

fn error_event(err: VigilError) -> Event {
    match err {
        VigilError::Cancelled => Event::Cancelled,
        e => Event::Error {
            class: e.class(),
            message: e.to_string(),
        },
    }
}
