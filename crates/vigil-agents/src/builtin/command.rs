//! Agent that fixes issues by running a configured command

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};
use vigil_core::{AgentDescriptor, CommandAgentConfig, FixResult, Issue, Result, VigilError};
use vigil_hooks::RunError;

use crate::agent::{sanitize_confidence, AgentContext, FixAgent};

/// Runs e.g. `ruff check --fix .` for the issue types and tools it declares
pub struct CommandAgent {
    descriptor: AgentDescriptor,
    command: Vec<String>,
    tools: Vec<String>,
    timeout: Duration,
}

impl CommandAgent {
    pub fn from_config(config: &CommandAgentConfig) -> Self {
        Self {
            descriptor: AgentDescriptor::new(&config.name, sanitize_confidence(config.confidence))
                .with_capabilities(config.handles.iter().copied()),
            command: config.command.clone(),
            tools: config.tools.clone(),
            timeout: Duration::from_secs(config.timeout_seconds),
        }
    }

    fn accepts_tool(&self, tool: &str) -> bool {
        self.tools.is_empty() || self.tools.iter().any(|t| t == tool)
    }
}

#[async_trait]
impl FixAgent for CommandAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    fn can_handle(&self, issue: &Issue) -> f64 {
        if self.descriptor.handles(issue.issue_type) && self.accepts_tool(&issue.source_tool) {
            self.descriptor.base_confidence
        } else {
            0.0
        }
    }

    async fn fix(&self, issues: &[Issue], ctx: &AgentContext) -> Result<FixResult> {
        let command_line = self.command.join(" ");
        debug!("{}: running `{}` for {} issues", self.name(), command_line, issues.len());

        let output = ctx
            .runner
            .run(&self.command, &ctx.project_root, self.timeout, &ctx.cancel)
            .await
            .map_err(|e| match e {
                RunError::Cancelled => VigilError::Cancelled,
                RunError::Timeout(_) => {
                    VigilError::Agent(format!("{} timed out after {:?}", self.name(), self.timeout))
                }
                RunError::Spawn(msg) => VigilError::Agent(format!("{}: {}", self.name(), msg)),
            })?;

        // Fixers exit non-zero when violations remain; re-verification decides.
        let Some(code) = output.exit_code else {
            warn!("{}: `{}` was killed by a signal", self.name(), command_line);
            return Ok(FixResult::failure(self.name(), issues.to_vec()));
        };

        Ok(FixResult::success(self.name(), self.descriptor.base_confidence)
            .with_fix(format!("ran `{}` (exit {})", command_line, code)))
    }
}
