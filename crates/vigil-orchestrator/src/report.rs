//! Run report - machine-readable record of a pipeline run
//!
//! Written to `.vigil/last-run.json` when the run ends. Writing is
//! fail-open: a report that cannot be written never changes the outcome.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;
use vigil_core::fail_open::fail_open;
use vigil_core::{ErrorClass, HookResult, HookStatus, Issue, Result, Stage};

use crate::coordinator::{AutofixReport, IterationRecord, LoopOutcome, UnassignedIssue};
use crate::state_machine::{HaltReason, Phase, EXIT_SUCCESS};

/// Per-hook line in the report (raw output left out)
#[derive(Debug, Clone, Serialize)]
pub struct HookSummary {
    pub name: String,
    pub stage: Stage,
    pub status: HookStatus,
    pub declared_issues: Option<usize>,
    pub parsed_issues: usize,
    pub duration_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
}

impl From<&HookResult> for HookSummary {
    fn from(result: &HookResult) -> Self {
        Self {
            name: result.name.clone(),
            stage: result.stage,
            status: result.status,
            declared_issues: result.declared_issue_count,
            parsed_issues: result.issue_count(),
            duration_ms: result.duration.as_millis(),
            error: result.error.clone(),
            error_class: result.error_class,
        }
    }
}

/// One executed phase
#[derive(Debug, Clone, Serialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    /// Distinguishes the fast-hook retry
    pub attempt: u8,
    pub duration_ms: u128,
    pub hooks: Vec<HookSummary>,
}

/// Autofix section of the report
#[derive(Debug, Clone, Serialize)]
pub struct AutofixSummary {
    pub outcome: LoopOutcome,
    pub iterations_run: usize,
    pub max_iterations: usize,
    pub iterations: Vec<IterationRecord>,
    pub unassigned: Vec<UnassignedIssue>,
}

impl From<&AutofixReport> for AutofixSummary {
    fn from(report: &AutofixReport) -> Self {
        Self {
            outcome: report.outcome.clone(),
            iterations_run: report.iterations_run(),
            max_iterations: report.state.max_iterations,
            iterations: report.iterations.clone(),
            unassigned: report.unassigned.clone(),
        }
    }
}

/// Result of one downstream step
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub name: String,
    pub success: bool,
    pub duration_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Where and why a run stopped
#[derive(Debug, Clone, Serialize)]
pub struct HaltDiagnostic {
    pub phase: Phase,
    pub reason: HaltReason,
    /// Autofix iteration the halt happened in, if the loop ran
    pub iteration: Option<usize>,
    pub unresolved_issues: usize,
    pub error_class: Option<ErrorClass>,
}

/// Terminal status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Success,
    Halted,
}

/// Full record of one pipeline run
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub project_root: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub exit_code: i32,
    pub phases: Vec<PhaseRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autofix: Option<AutofixSummary>,
    pub downstream: Vec<StepRecord>,
    /// Issues still open when the run ended
    pub unresolved: Vec<Issue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halt: Option<HaltDiagnostic>,
}

impl PipelineReport {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            project_root: project_root.into(),
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Success,
            exit_code: EXIT_SUCCESS,
            phases: Vec::new(),
            autofix: None,
            downstream: Vec::new(),
            unresolved: Vec::new(),
            halt: None,
        }
    }

    pub fn record_phase(
        &mut self,
        phase: Phase,
        attempt: u8,
        duration: Duration,
        results: &[HookResult],
    ) {
        self.phases.push(PhaseRecord {
            phase,
            attempt,
            duration_ms: duration.as_millis(),
            hooks: results.iter().map(HookSummary::from).collect(),
        });
    }

    pub fn record_step(
        &mut self,
        name: &str,
        success: bool,
        duration: Duration,
        message: Option<String>,
    ) {
        self.downstream.push(StepRecord {
            name: name.to_string(),
            success,
            duration_ms: duration.as_millis(),
            message,
        });
    }

    /// Close the report as a success
    pub fn complete(&mut self) {
        self.status = RunStatus::Success;
        self.exit_code = EXIT_SUCCESS;
        self.unresolved.clear();
        self.finished_at = Some(Utc::now());
    }

    /// Close the report as a halt
    pub fn halt(&mut self, phase: Phase, reason: HaltReason, unresolved: Vec<Issue>) {
        self.status = RunStatus::Halted;
        self.exit_code = reason.exit_code();
        self.halt = Some(HaltDiagnostic {
            phase,
            iteration: self
                .autofix
                .as_ref()
                .map(|a| a.iterations_run)
                .filter(|&n| n > 0),
            unresolved_issues: unresolved.len(),
            error_class: reason.error_class(),
            reason,
        });
        self.unresolved = unresolved;
        self.finished_at = Some(Utc::now());
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the report, creating parent directories
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Write the report; failures are logged and ignored
    pub fn persist(&self, path: &Path) -> bool {
        fail_open("run_report::persist", || self.write_to(path)).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_halt_diagnostic() {
        let mut report = PipelineReport::new("/proj");
        report.halt(
            Phase::ComprehensiveHooks,
            HaltReason::Failed {
                class: ErrorClass::HookTimeout,
                message: "pytest timed out".to_string(),
            },
            vec![],
        );

        assert!(!report.is_success());
        assert_eq!(report.exit_code, 4);
        let halt = report.halt.as_ref().unwrap();
        assert_eq!(halt.error_class, Some(ErrorClass::HookTimeout));
        assert_eq!(halt.iteration, None);
        assert!(report.finished_at.is_some());
    }

    #[test]
    fn test_json_shape() {
        let mut report = PipelineReport::new("/proj");
        report.halt(Phase::AutofixLoop, HaltReason::Exhausted, vec![]);
        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();

        assert_eq!(json["status"], "halted");
        assert_eq!(json["exit_code"], 2);
        assert_eq!(json["halt"]["phase"], "autofix-loop");
        assert_eq!(json["halt"]["reason"]["reason"], "exhausted");
    }

    #[test]
    fn test_persist_creates_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".vigil").join("last-run.json");
        let mut report = PipelineReport::new(dir.path());
        report.record_phase(
            Phase::FastHooks,
            1,
            Duration::from_millis(12),
            &[HookResult::passed("ruff", Stage::FastHooks, String::new())],
        );
        report.complete();

        assert!(report.persist(&path));
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("\"ruff\""));
    }

    #[test]
    fn test_persist_fails_open() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "").unwrap();
        let report = PipelineReport::new(dir.path());
        assert!(!report.persist(&blocker.join("last-run.json")));
    }
}
