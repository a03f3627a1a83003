//! End-to-end runs of the hook, routing and autofix pipeline.
//!
//! Every run uses `MockRunner` for tool output and in-test agents, so no
//! real linters are needed.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use vigil_agents::{plan, AgentContext, AgentRegistry, FixAgent};
use vigil_core::{
    AgentDescriptor, FixResult, HookSpec, HookStatus, Issue, IssueType, Severity, Stage,
    VigilConfig,
};
use vigil_hooks::{CommandOutput, HookExecutor, MockResponse, MockRunner, ParserRegistry};
use vigil_orchestrator::{
    AutofixCoordinator, AutofixSettings, HaltReason, LoopOutcome, Phase, Pipeline,
    PipelineOptions, ProgressKind, EXIT_CANCELLED, EXIT_HOOKS_FAILED, EXIT_SUCCESS,
};

/// Agent that claims a fixed set of issue types at a fixed confidence
struct ScriptedAgent {
    descriptor: AgentDescriptor,
    /// Confidence for every issue, regardless of type
    flat: Option<f64>,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedAgent {
    fn for_types(name: &str, confidence: f64, types: &[IssueType]) -> Arc<Self> {
        let descriptor = types
            .iter()
            .fold(AgentDescriptor::new(name, confidence), |d, t| {
                d.with_capability(*t)
            });
        Arc::new(Self {
            descriptor,
            flat: None,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }

    fn for_everything(name: &str, confidence: f64) -> Arc<Self> {
        Arc::new(Self {
            descriptor: AgentDescriptor::new(name, confidence),
            flat: Some(confidence),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }

    fn slow(name: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            descriptor: AgentDescriptor::new(name, 0.9).with_capability(IssueType::TypeError),
            flat: None,
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FixAgent for ScriptedAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    fn can_handle(&self, issue: &Issue) -> f64 {
        match self.flat {
            Some(confidence) => confidence,
            None if self.descriptor.handles(issue.issue_type) => self.descriptor.base_confidence,
            None => 0.0,
        }
    }

    async fn fix(&self, issues: &[Issue], _ctx: &AgentContext) -> vigil_core::Result<FixResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(FixResult::success(self.name(), 0.9).with_fix(format!("touched {} issues", issues.len())))
    }
}

/// mypy-style output with `count` errors
fn zuban_output(count: usize) -> String {
    if count == 0 {
        return "Success: no issues found in 12 source files".to_string();
    }
    let mut out = String::new();
    for i in 1..=count {
        out.push_str(&format!(
            "src/module_{}.py:{}: error: Argument 1 has incompatible type \"str\"; expected \"int\"  [arg-type]\n",
            i % 7,
            i
        ));
    }
    out.push_str(&format!(
        "Found {} errors in 7 files (checked 12 source files)",
        count
    ));
    out
}

fn zuban_response(count: usize) -> MockResponse {
    if count == 0 {
        MockResponse::ok(zuban_output(0))
    } else {
        MockResponse::fail(zuban_output(count))
    }
}

fn base_config() -> VigilConfig {
    let mut config = VigilConfig::default();
    config.hooks.fast = vec![HookSpec::new(
        "trailing-whitespace",
        &["trailing-whitespace-fixer"],
    )];
    config.hooks.comprehensive = vec![
        HookSpec::new("zuban", &["zuban", "check"]).parallel(),
        HookSpec::new("bandit", &["bandit", "-r", ".", "-f", "json", "-q"]).parallel(),
        HookSpec::new("vulture", &["vulture", "."]).parallel(),
    ];
    config.downstream.steps = vec![];
    config.report.enabled = false;
    config
}

fn base_runner() -> MockRunner {
    MockRunner::new()
        .with_response("trailing-whitespace-fixer", MockResponse::ok(""))
        .with_response("bandit -r . -f json -q", MockResponse::ok("{\"results\": []}"))
        .with_response("vulture .", MockResponse::ok(""))
}

fn autofix_options() -> PipelineOptions {
    PipelineOptions {
        autofix: true,
        skip_downstream: true,
        ..Default::default()
    }
}

// Declared counts

#[tokio::test]
async fn zuban_sixty_errors_yield_sixty_type_errors() {
    let runner = Arc::new(base_runner().with_response("zuban check", zuban_response(60)));
    let executor = HookExecutor::new(runner, Arc::new(ParserRegistry::with_builtin()), "/proj");

    let results = executor
        .run_hooks(
            &base_config().hooks.comprehensive,
            Stage::ComprehensiveHooks,
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(results.len(), 3);
    let zuban = &results[0];
    assert_eq!(zuban.status, HookStatus::Failed);
    assert_eq!(zuban.declared_issue_count, Some(60));
    assert_eq!(zuban.parsed_issues.len(), 60);
    assert!(zuban
        .parsed_issues
        .iter()
        .all(|issue| issue.issue_type == IssueType::TypeError));
    assert!(results[1..].iter().all(|r| r.status == HookStatus::Passed));
}

#[test]
fn pipeline_reports_all_sixty_unresolved() {
    let runner = Arc::new(base_runner().with_response("zuban check", zuban_response(60)));
    let report = Pipeline::new(base_config(), "/proj", runner).run();

    assert_eq!(report.exit_code, EXIT_HOOKS_FAILED);
    let halt = report.halt.as_ref().unwrap();
    assert_eq!(halt.phase, Phase::ComprehensiveHooks);
    assert_eq!(halt.reason, HaltReason::HooksFailed);
    assert_eq!(halt.unresolved_issues, 60);
    assert!(report
        .unresolved
        .iter()
        .all(|issue| issue.issue_type == IssueType::TypeError));
}

// Routing

#[test]
fn low_confidence_issue_stays_unassigned() {
    let security = ScriptedAgent::for_types("SecurityAgent", 0.9, &[IssueType::Security]);
    let formatting = ScriptedAgent::for_everything("FormattingAgent", 0.6);
    let registry = AgentRegistry::new()
        .with_agent(security)
        .with_agent(formatting);

    let finding = Issue::new(
        IssueType::Security,
        Severity::High,
        "Use of assert detected",
        "bandit",
        Stage::ComprehensiveHooks,
    )
    .unwrap()
    .at(Some("src/app.py".to_string()), Some(4));
    let style = Issue::new(
        IssueType::Formatting,
        Severity::Low,
        "trailing whitespace",
        "trailing-whitespace",
        Stage::FastHooks,
    )
    .unwrap()
    .at(Some("src/app.py".to_string()), None);

    let route = registry.route(&finding).unwrap();
    assert_eq!(route.agent_name(), "SecurityAgent");
    assert!((route.confidence - 0.9).abs() < f64::EPSILON);
    assert!(registry.route(&style).is_none());

    let dispatch = plan(&registry, &[finding, style], true);
    assert_eq!(dispatch.assigned_count(), 1);
    assert_eq!(dispatch.unassigned.len(), 1);
    let left = &dispatch.unassigned[0];
    assert_eq!(left.issue.issue_type, IssueType::Formatting);
    assert_eq!(left.best_agent.as_deref(), Some("FormattingAgent"));
    assert!((left.best_confidence - 0.6).abs() < f64::EPSILON);
}

// Iteration budget

#[test]
fn one_fix_per_iteration_converges_on_last_iteration() {
    let runner = Arc::new(base_runner().with_sequence(
        "zuban check",
        vec![
            zuban_response(3),
            zuban_response(2),
            zuban_response(1),
            zuban_response(0),
        ],
    ));
    let agent = ScriptedAgent::for_types("types", 0.9, &[IssueType::TypeError]);
    let mut config = base_config();
    config.autofix.max_iterations = 3;

    let pipeline = Pipeline::new(config, "/proj", runner.clone())
        .with_registry(AgentRegistry::new().with_agent(agent.clone()))
        .with_options(autofix_options());
    let mut events = pipeline.progress().subscribe();
    let report = pipeline.run();

    assert_eq!(report.exit_code, EXIT_SUCCESS, "{:?}", report.halt);
    let autofix = report.autofix.as_ref().unwrap();
    assert_eq!(autofix.outcome, LoopOutcome::Converged);
    assert_eq!(autofix.iterations_run, 3);
    let counts: Vec<(usize, usize)> = autofix
        .iterations
        .iter()
        .map(|i| (i.issues_at_start, i.issues_at_end))
        .collect();
    assert_eq!(counts, vec![(3, 2), (2, 1), (1, 0)]);
    assert_eq!(agent.calls(), 3);

    // Initial run, three re-verifications and the confirmation pass
    assert_eq!(runner.call_count("zuban check"), 5);
    assert!(report
        .phases
        .iter()
        .any(|p| p.phase == Phase::ReVerification));

    let mut started = 0;
    while let Ok(event) = events.try_recv() {
        if event.kind == ProgressKind::IterationStarted {
            started += 1;
        }
    }
    assert_eq!(started, 3);
}

#[test]
fn budget_spent_halts_as_exhausted() {
    let runner = Arc::new(base_runner().with_sequence(
        "zuban check",
        vec![zuban_response(3), zuban_response(3), zuban_response(4)],
    ));
    let mut config = base_config();
    config.autofix.max_iterations = 3;

    let report = Pipeline::new(config, "/proj", runner)
        .with_registry(AgentRegistry::new().with_agent(ScriptedAgent::for_types(
            "types",
            0.9,
            &[IssueType::TypeError],
        )))
        .with_options(autofix_options())
        .run();

    assert_eq!(report.exit_code, 2);
    let halt = report.halt.as_ref().unwrap();
    assert_eq!(halt.phase, Phase::AutofixLoop);
    assert_eq!(halt.reason, HaltReason::Exhausted);
    assert_eq!(halt.iteration, Some(3));
    assert_eq!(halt.unresolved_issues, 4);
}

// Agents invoked from inside a running runtime

#[tokio::test]
async fn slow_agent_inside_runtime_hits_deadline() {
    let runner = Arc::new(MockRunner::new().with_response("zuban check", zuban_response(0)));
    let executor = HookExecutor::new(runner, Arc::new(ParserRegistry::with_builtin()), "/proj");
    let agent = ScriptedAgent::slow("sluggish", Duration::from_secs(30));
    let coordinator = AutofixCoordinator::new(
        executor.clone(),
        Arc::new(AgentRegistry::new().with_agent(agent.clone())),
        vec![(HookSpec::new("zuban", &["zuban", "check"]), Stage::ComprehensiveHooks)],
        AutofixSettings {
            max_iterations: 3,
            iteration_timeout: Duration::from_millis(200),
            batch: true,
            collaborative: false,
        },
    );

    let failing = {
        let output = zuban_output(2);
        let parsers = executor.parsers();
        let declared = parsers.declared_count("zuban", &output).unwrap();
        let issues = parsers
            .parse("zuban", &output, declared, Stage::ComprehensiveHooks)
            .unwrap();
        vigil_core::HookResult::failed("zuban", Stage::ComprehensiveHooks, output, declared, issues)
    };

    let started = Instant::now();
    let report = coordinator.run(vec![failing]);

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(agent.calls(), 1);
    assert_eq!(report.outcome, LoopOutcome::Converged);
    assert!(report.iterations[0].partially_applied);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pipeline_runs_inside_multi_thread_runtime() {
    let runner = Arc::new(base_runner().with_sequence(
        "zuban check",
        vec![zuban_response(2), zuban_response(0)],
    ));
    let report = Pipeline::new(base_config(), "/proj", runner)
        .with_registry(AgentRegistry::new().with_agent(ScriptedAgent::for_types(
            "types",
            0.9,
            &[IssueType::TypeError],
        )))
        .with_options(autofix_options())
        .run();

    assert!(report.is_success(), "{:?}", report.halt);
    assert_eq!(report.autofix.as_ref().unwrap().iterations_run, 1);
}

#[test]
fn cancellation_stops_before_new_work() {
    let runner = Arc::new(base_runner().with_response("zuban check", zuban_response(2)));
    let cancel = CancellationToken::new();
    let pipeline = Pipeline::new(base_config(), "/proj", runner.clone())
        .with_options(autofix_options())
        .with_cancel(cancel.clone());
    cancel.cancel();

    let report = pipeline.run();
    assert_eq!(report.halt.as_ref().unwrap().reason, HaltReason::Cancelled);
    assert!(runner.calls().is_empty());
}

/// Cancel `token` from another thread once `after` has passed
fn cancel_after(token: &CancellationToken, after: Duration) {
    let token = token.clone();
    std::thread::spawn(move || {
        std::thread::sleep(after);
        token.cancel();
    });
}

#[test]
fn cancelling_a_running_hook_skips_later_stages() {
    let runner = Arc::new(
        base_runner()
            .with_response(
                "trailing-whitespace-fixer",
                MockResponse::Delayed(Duration::from_secs(30), CommandOutput::default()),
            )
            .with_response("zuban check", zuban_response(2)),
    );
    let cancel = CancellationToken::new();
    let pipeline = Pipeline::new(base_config(), "/proj", runner.clone())
        .with_options(autofix_options())
        .with_cancel(cancel.clone());

    let started = Instant::now();
    cancel_after(&cancel, Duration::from_millis(100));
    let report = pipeline.run();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.exit_code, EXIT_CANCELLED);
    assert_eq!(report.halt.as_ref().unwrap().reason, HaltReason::Cancelled);
    assert_eq!(runner.calls(), vec!["trailing-whitespace-fixer".to_string()]);
}

#[test]
fn cancelling_during_agent_work_stops_the_loop() {
    let runner = Arc::new(base_runner().with_response("zuban check", zuban_response(2)));
    let agent = ScriptedAgent::slow("sluggish", Duration::from_secs(30));
    let cancel = CancellationToken::new();
    let pipeline = Pipeline::new(base_config(), "/proj", runner.clone())
        .with_registry(AgentRegistry::new().with_agent(agent.clone()))
        .with_options(autofix_options())
        .with_cancel(cancel.clone());

    let started = Instant::now();
    cancel_after(&cancel, Duration::from_millis(200));
    let report = pipeline.run();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.exit_code, EXIT_CANCELLED);
    assert_eq!(report.halt.as_ref().unwrap().phase, Phase::AutofixLoop);
    assert_eq!(agent.calls(), 1);
    // No re-verification after the cancel
    assert_eq!(runner.call_count("zuban check"), 1);
}
