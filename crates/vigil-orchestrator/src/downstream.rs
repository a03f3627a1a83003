//! Downstream steps - work that only runs once every hook is clean
//!
//! Test suites, packaging and publishing live behind [`DownstreamStep`].
//! The orchestrator runs steps in order and stops at the first failure.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use vigil_core::{HookSpec, Result, VigilError};
use vigil_hooks::{CommandRunner, RunError};

/// What a step may use
#[derive(Debug, Clone)]
pub struct StepContext {
    pub project_root: PathBuf,
    pub cancel: CancellationToken,
}

/// Outcome of a step that ran to completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub success: bool,
    /// Short description for the report (tail of the output on failure)
    pub message: String,
}

/// A post-pipeline step
#[async_trait]
pub trait DownstreamStep: Send + Sync {
    fn name(&self) -> &str;

    /// `Err` means the step could not run at all
    async fn run(&self, ctx: &StepContext) -> Result<StepOutcome>;
}

/// Runs a configured command; exit 0 passes
pub struct CommandStep {
    spec: HookSpec,
    runner: Arc<dyn CommandRunner>,
}

const OUTPUT_TAIL_LINES: usize = 20;

impl CommandStep {
    pub fn new(spec: HookSpec, runner: Arc<dyn CommandRunner>) -> Self {
        Self { spec, runner }
    }
}

#[async_trait]
impl DownstreamStep for CommandStep {
    fn name(&self) -> &str {
        &self.spec.name
    }

    async fn run(&self, ctx: &StepContext) -> Result<StepOutcome> {
        debug!("Running downstream step {}: {}", self.spec.name, self.spec.command_line());
        let output = self
            .runner
            .run(&self.spec.command, &ctx.project_root, self.spec.timeout(), &ctx.cancel)
            .await
            .map_err(|e| match e {
                RunError::Cancelled => VigilError::Cancelled,
                RunError::Timeout(_) => VigilError::HookTimeout {
                    hook: self.spec.name.clone(),
                    timeout_secs: self.spec.timeout_seconds,
                },
                RunError::Spawn(message) => VigilError::UnrecoverableToolFailure {
                    hook: self.spec.name.clone(),
                    message,
                },
            })?;

        if output.success() {
            return Ok(StepOutcome {
                success: true,
                message: format!("`{}` passed", self.spec.command_line()),
            });
        }

        let combined = output.combined();
        let lines: Vec<&str> = combined.lines().collect();
        let tail = lines[lines.len().saturating_sub(OUTPUT_TAIL_LINES)..].join("\n");
        Ok(StepOutcome {
            success: false,
            message: match output.exit_code {
                Some(code) => format!("exit {}\n{}", code, tail),
                None => format!("killed by signal\n{}", tail),
            },
        })
    }
}
