//! Hook execution engine
//!
//! Runs a stage's hooks and turns each exit into a [`HookResult`]. Runs of
//! consecutive parallel-safe hooks execute concurrently under a semaphore;
//! any other hook runs alone, after everything before it has finished.
//! Results always come back in spec order.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vigil_core::{HookResult, HookSpec, Stage, VigilError};

use crate::command::{CommandOutput, CommandRunner, RunError};
use crate::parsers::{ParseError, ParseStrategy, ParserRegistry};

/// Default number of hooks allowed to run at once
pub const DEFAULT_MAX_PARALLEL: usize = 3;

/// Runs hooks through a [`CommandRunner`] and parses their output
#[derive(Clone)]
pub struct HookExecutor {
    runner: Arc<dyn CommandRunner>,
    parsers: Arc<ParserRegistry>,
    project_root: PathBuf,
    max_parallel: usize,
}

impl HookExecutor {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        parsers: Arc<ParserRegistry>,
        project_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            parsers,
            project_root: project_root.into(),
            max_parallel: DEFAULT_MAX_PARALLEL,
        }
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn parsers(&self) -> &ParserRegistry {
        &self.parsers
    }

    pub fn runner(&self) -> Arc<dyn CommandRunner> {
        Arc::clone(&self.runner)
    }

    /// Run all hooks of a stage, returning one result per spec in spec order
    pub async fn run_hooks(
        &self,
        hooks: &[HookSpec],
        stage: Stage,
        cancel: &CancellationToken,
    ) -> Vec<HookResult> {
        info!("Running {} {} hooks", hooks.len(), stage);

        let mut results: Vec<Option<HookResult>> = vec![None; hooks.len()];
        let mut batch: Vec<usize> = Vec::new();

        for (idx, hook) in hooks.iter().enumerate() {
            if hook.parallel_safe {
                batch.push(idx);
                continue;
            }
            self.run_batch(hooks, &batch, stage, cancel, &mut results)
                .await;
            batch.clear();
            results[idx] = Some(self.run_hook(hook, stage, cancel).await);
        }
        self.run_batch(hooks, &batch, stage, cancel, &mut results)
            .await;

        results
            .into_iter()
            .zip(hooks)
            .map(|(result, hook)| {
                result.unwrap_or_else(|| {
                    HookResult::error(
                        &hook.name,
                        stage,
                        String::new(),
                        &VigilError::Other("hook produced no result".to_string()),
                    )
                })
            })
            .collect()
    }

    async fn run_batch(
        &self,
        hooks: &[HookSpec],
        batch: &[usize],
        stage: Stage,
        cancel: &CancellationToken,
        results: &mut [Option<HookResult>],
    ) {
        match batch {
            [] => {}
            [idx] => results[*idx] = Some(self.run_hook(&hooks[*idx], stage, cancel).await),
            _ => {
                debug!("Running {} parallel-safe hooks concurrently", batch.len());
                let semaphore = Arc::new(Semaphore::new(self.max_parallel));
                let mut set = JoinSet::new();

                for &idx in batch {
                    let executor = self.clone();
                    let hook = hooks[idx].clone();
                    let cancel = cancel.clone();
                    let semaphore = Arc::clone(&semaphore);
                    set.spawn(async move {
                        let result = match semaphore.acquire_owned().await {
                            Ok(_permit) => executor.run_hook(&hook, stage, &cancel).await,
                            Err(_) => HookResult::skipped(&hook.name, stage, "semaphore closed"),
                        };
                        (idx, result)
                    });
                }

                while let Some(joined) = set.join_next().await {
                    match joined {
                        Ok((idx, result)) => results[idx] = Some(result),
                        // Slot stays empty and is reported as an error result
                        Err(e) => warn!("Hook task failed: {}", e),
                    }
                }
            }
        }
    }

    /// Run a single hook
    pub async fn run_hook(
        &self,
        hook: &HookSpec,
        stage: Stage,
        cancel: &CancellationToken,
    ) -> HookResult {
        if !hook.enabled {
            return HookResult::skipped(&hook.name, stage, "disabled");
        }
        if cancel.is_cancelled() {
            return HookResult::skipped(&hook.name, stage, "cancelled");
        }

        debug!("Running hook {}: {}", hook.name, hook.command_line());
        let start = Instant::now();

        let result = match self
            .runner
            .run(&hook.command, &self.project_root, hook.timeout(), cancel)
            .await
        {
            Ok(output) => self.interpret(hook, stage, output),
            Err(RunError::Timeout(_)) => {
                warn!("Hook {} timed out after {}s", hook.name, hook.timeout_seconds);
                HookResult::timeout(&hook.name, stage, hook.timeout_seconds)
            }
            Err(RunError::Cancelled) => HookResult::skipped(&hook.name, stage, "cancelled"),
            Err(RunError::Spawn(message)) => {
                warn!("Hook {} could not run: {}", hook.name, message);
                HookResult::error(
                    &hook.name,
                    stage,
                    String::new(),
                    &VigilError::UnrecoverableToolFailure {
                        hook: hook.name.clone(),
                        message,
                    },
                )
            }
        };

        let result = result.with_duration(start.elapsed());
        debug!(
            "Hook {} finished: {} ({} issues, {:?})",
            result.name,
            result.status,
            result.issue_count(),
            result.duration
        );
        result
    }

    /// Classify a finished command
    fn interpret(&self, hook: &HookSpec, stage: Stage, output: CommandOutput) -> HookResult {
        let combined = output.combined();
        if output.success() {
            return HookResult::passed(&hook.name, stage, combined);
        }

        let key = hook.parser_key();
        let Some(parser) = self.parsers.get(key) else {
            let err = ParseError::UnknownTool(key.to_string()).into_vigil(&hook.name);
            return HookResult::error(&hook.name, stage, combined, &err);
        };

        let input = match parser.strategy() {
            ParseStrategy::Structured => output.stdout.as_str(),
            ParseStrategy::LineOriented => combined.as_str(),
        };
        let declared = parser.declared_count(input);

        match self.parsers.parse_as(
            key,
            &hook.name,
            input,
            declared,
            stage,
            Some(&self.project_root),
        ) {
            Ok(issues) => {
                enforce_count(HookResult::failed(&hook.name, stage, combined, declared, issues))
            }
            Err(e) => {
                warn!("Could not parse {} output: {}", hook.name, e);
                let mut result =
                    HookResult::error(&hook.name, stage, combined, &e.into_vigil(&hook.name));
                result.declared_issue_count = declared;
                result
            }
        }
    }
}

/// Turn a failed result whose issue count disagrees with the tool into an error
fn enforce_count(result: HookResult) -> HookResult {
    match result.check_count_invariant() {
        Ok(()) => result,
        Err(e) => {
            warn!("{}: {}", result.name, e);
            let mut errored = HookResult::error(&result.name, result.stage, result.raw_output, &e);
            errored.declared_issue_count = result.declared_issue_count;
            errored
        }
    }
}
