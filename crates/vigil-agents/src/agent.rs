//! Fix agent contract

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use vigil_core::{AgentDescriptor, FixResult, Issue, Result};
use vigil_hooks::CommandRunner;

use crate::files::ProjectFiles;

/// What an agent may touch while fixing
#[derive(Clone)]
pub struct AgentContext {
    pub project_root: PathBuf,
    pub files: ProjectFiles,
    /// Fires on user interrupt or when the iteration deadline passes
    pub cancel: CancellationToken,
    pub runner: Arc<dyn CommandRunner>,
}

impl AgentContext {
    pub fn new(
        project_root: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
        cancel: CancellationToken,
    ) -> Self {
        let project_root = project_root.into();
        Self {
            files: ProjectFiles::new(project_root.clone()),
            project_root,
            cancel,
            runner,
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Same context with a different cancellation token
    pub fn with_cancel(&self, cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..self.clone()
        }
    }
}

/// A capability-scoped fixer.
///
/// Agents are registered once at startup. The router calls
/// [`can_handle`](FixAgent::can_handle) for every issue; the coordinator
/// then calls [`fix`](FixAgent::fix) with the issues assigned to it.
/// Agents write whole files and must tolerate a file changing between
/// their read and another agent's write in the same iteration.
#[async_trait]
pub trait FixAgent: Send + Sync {
    fn descriptor(&self) -> &AgentDescriptor;

    fn name(&self) -> &str {
        &self.descriptor().name
    }

    /// Confidence in `[0, 1]` that this agent can fix `issue`
    fn can_handle(&self, issue: &Issue) -> f64;

    /// Attempt to fix `issues`.
    ///
    /// Issues the agent declined or could not resolve go in
    /// `remaining_issues`. An `Err` counts against the agent's breaker.
    async fn fix(&self, issues: &[Issue], ctx: &AgentContext) -> Result<FixResult>;
}

/// Clamp an agent-reported confidence into `[0, 1]`; NaN becomes 0
pub fn sanitize_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}
