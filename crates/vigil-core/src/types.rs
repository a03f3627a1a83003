//! Core type definitions for the Vigil issue model

use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ErrorClass;
use crate::{Result, VigilError};

/// Category of a normalized defect
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    TypeError,
    Security,
    Complexity,
    Formatting,
    DeadCode,
    TestFailure,
    Documentation,
    Performance,
    Other,
}

impl IssueType {
    pub const ALL: [IssueType; 9] = [
        IssueType::TypeError,
        IssueType::Security,
        IssueType::Complexity,
        IssueType::Formatting,
        IssueType::DeadCode,
        IssueType::TestFailure,
        IssueType::Documentation,
        IssueType::Performance,
        IssueType::Other,
    ];
}

impl std::fmt::Display for IssueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TypeError => write!(f, "type_error"),
            Self::Security => write!(f, "security"),
            Self::Complexity => write!(f, "complexity"),
            Self::Formatting => write!(f, "formatting"),
            Self::DeadCode => write!(f, "dead_code"),
            Self::TestFailure => write!(f, "test_failure"),
            Self::Documentation => write!(f, "documentation"),
            Self::Performance => write!(f, "performance"),
            Self::Other => write!(f, "other"),
        }
    }
}

impl std::str::FromStr for IssueType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .collect::<String>()
            .to_lowercase();
        match normalized.as_str() {
            "typeerror" | "type" => Ok(Self::TypeError),
            "security" => Ok(Self::Security),
            "complexity" => Ok(Self::Complexity),
            "formatting" | "format" => Ok(Self::Formatting),
            "deadcode" => Ok(Self::DeadCode),
            "testfailure" | "test" => Ok(Self::TestFailure),
            "documentation" | "docs" => Ok(Self::Documentation),
            "performance" | "perf" => Ok(Self::Performance),
            "other" => Ok(Self::Other),
            _ => Err(format!("Invalid issue type: {}", s)),
        }
    }
}

/// Issue severity, ordered from most to least severe
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical = 0,
    High = 1,
    #[default]
    Medium = 2,
    Low = 3,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" | "error" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "medium" | "warning" => Ok(Self::Medium),
            "low" | "info" | "note" => Ok(Self::Low),
            _ => Err(format!("Invalid severity: {}", s)),
        }
    }
}

/// Pipeline stage a hook (and its issues) belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    FastHooks,
    ComprehensiveHooks,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FastHooks => write!(f, "fast"),
            Self::ComprehensiveHooks => write!(f, "comprehensive"),
        }
    }
}

/// Key used to merge issues across repeated runs and re-parses.
///
/// Uses the full message and the tool name: two distinct defects on the
/// same line from the same tool often share a message prefix.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DedupKey {
    pub file_path: Option<String>,
    pub line_number: Option<u32>,
    pub source_tool: String,
    pub message: String,
}

/// A single normalized defect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    /// Stable hash of tool, file, line and message
    pub id: String,
    #[serde(rename = "type")]
    pub issue_type: IssueType,
    pub severity: Severity,
    pub message: String,
    /// Relative path; absent for project-wide issues
    pub file_path: Option<String>,
    pub line_number: Option<u32>,
    pub source_tool: String,
    pub stage: Stage,
}

impl Issue {
    /// Create a project-wide issue.
    ///
    /// Fails when the message or source tool is blank, so malformed issues
    /// are rejected where they are produced.
    pub fn new(
        issue_type: IssueType,
        severity: Severity,
        message: impl Into<String>,
        source_tool: impl Into<String>,
        stage: Stage,
    ) -> Result<Self> {
        let message = message.into().trim().to_string();
        let source_tool = source_tool.into().trim().to_string();

        if source_tool.is_empty() {
            return Err(VigilError::Parsing {
                tool: "<unknown>".to_string(),
                message: "issue has no source tool".to_string(),
            });
        }
        if message.is_empty() {
            return Err(VigilError::Parsing {
                tool: source_tool,
                message: "issue has an empty message".to_string(),
            });
        }

        let mut issue = Self {
            id: String::new(),
            issue_type,
            severity,
            message,
            file_path: None,
            line_number: None,
            source_tool,
            stage,
        };
        issue.id = issue.compute_id();
        Ok(issue)
    }

    /// Attach a file location (recomputes the id)
    pub fn at(mut self, file_path: Option<String>, line_number: Option<u32>) -> Self {
        self.file_path = file_path
            .map(|p| p.trim().trim_start_matches("./").to_string())
            .filter(|p| !p.is_empty());
        self.line_number = line_number;
        self.id = self.compute_id();
        self
    }

    fn compute_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.source_tool.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.file_path.as_deref().unwrap_or("").as_bytes());
        hasher.update([0u8]);
        if let Some(line) = self.line_number {
            hasher.update(line.to_string().as_bytes());
        }
        hasher.update([0u8]);
        hasher.update(self.message.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Deduplication key: (file, line, tool, full message)
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            file_path: self.file_path.clone(),
            line_number: self.line_number,
            source_tool: self.source_tool.clone(),
            message: self.message.clone(),
        }
    }

    /// Human readable location, e.g. `src/app.py:12`
    pub fn location(&self) -> String {
        match (&self.file_path, self.line_number) {
            (Some(file), Some(line)) => format!("{}:{}", file, line),
            (Some(file), None) => file.clone(),
            (None, _) => "<project>".to_string(),
        }
    }
}

/// Outcome status of a hook run.
///
/// Parsing from strings is case-insensitive, and so are comparisons
/// against string literals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HookStatus {
    Passed,
    Failed,
    Skipped,
    Error,
    Timeout,
}

impl HookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }

    /// Whether this status leaves the hook unresolved
    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::Failed | Self::Error | Self::Timeout)
    }
}

impl std::fmt::Display for HookStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HookStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "passed" | "pass" | "success" => Ok(Self::Passed),
            "failed" | "fail" | "failure" => Ok(Self::Failed),
            "skipped" | "skip" => Ok(Self::Skipped),
            "error" => Ok(Self::Error),
            "timeout" | "timed_out" => Ok(Self::Timeout),
            _ => Err(format!("Invalid hook status: {}", s)),
        }
    }
}

impl<'de> Deserialize<'de> for HookStatus {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl PartialEq<str> for HookStatus {
    fn eq(&self, other: &str) -> bool {
        other.parse::<HookStatus>().map(|s| s == *self).unwrap_or(false)
    }
}

impl PartialEq<&str> for HookStatus {
    fn eq(&self, other: &&str) -> bool {
        self == *other
    }
}

fn default_parallel_safe() -> bool {
    false
}

fn default_timeout_seconds() -> u64 {
    300
}

fn default_enabled() -> bool {
    true
}

/// Specification of one hook, as read from configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookSpec {
    pub name: String,
    pub command: Vec<String>,
    /// Hooks that mutate shared state (lock files, caches, git) must be false
    #[serde(default = "default_parallel_safe")]
    pub parallel_safe: bool,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Parser registry key; defaults to the hook name
    #[serde(default)]
    pub parser: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl HookSpec {
    pub fn new(name: impl Into<String>, command: &[&str]) -> Self {
        Self {
            name: name.into(),
            command: command.iter().map(|s| s.to_string()).collect(),
            parallel_safe: default_parallel_safe(),
            timeout_seconds: default_timeout_seconds(),
            parser: None,
            enabled: true,
        }
    }

    pub fn parallel(mut self) -> Self {
        self.parallel_safe = true;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn with_parser(mut self, parser: impl Into<String>) -> Self {
        self.parser = Some(parser.into());
        self
    }

    /// Key used to look up this hook's output parser
    pub fn parser_key(&self) -> &str {
        self.parser.as_deref().unwrap_or(&self.name)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }
}

/// Outcome of running one hook
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookResult {
    pub name: String,
    pub stage: Stage,
    pub status: HookStatus,
    pub raw_output: String,
    /// Count the tool reported about itself, when it exposes one
    pub declared_issue_count: Option<usize>,
    pub parsed_issues: Vec<Issue>,
    pub duration: Duration,
    /// Diagnostic for Error/Timeout results
    pub error: Option<String>,
    pub error_class: Option<ErrorClass>,
}

impl HookResult {
    fn base(name: impl Into<String>, stage: Stage, status: HookStatus) -> Self {
        Self {
            name: name.into(),
            stage,
            status,
            raw_output: String::new(),
            declared_issue_count: None,
            parsed_issues: Vec::new(),
            duration: Duration::ZERO,
            error: None,
            error_class: None,
        }
    }

    pub fn passed(name: impl Into<String>, stage: Stage, raw_output: String) -> Self {
        Self {
            raw_output,
            ..Self::base(name, stage, HookStatus::Passed)
        }
    }

    pub fn failed(
        name: impl Into<String>,
        stage: Stage,
        raw_output: String,
        declared_issue_count: Option<usize>,
        parsed_issues: Vec<Issue>,
    ) -> Self {
        Self {
            raw_output,
            declared_issue_count,
            parsed_issues,
            ..Self::base(name, stage, HookStatus::Failed)
        }
    }

    pub fn skipped(name: impl Into<String>, stage: Stage, reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::base(name, stage, HookStatus::Skipped)
        }
    }

    pub fn timeout(name: impl Into<String>, stage: Stage, timeout_secs: u64) -> Self {
        Self {
            error: Some(format!("timed out after {}s", timeout_secs)),
            error_class: Some(ErrorClass::HookTimeout),
            ..Self::base(name, stage, HookStatus::Timeout)
        }
    }

    pub fn error(
        name: impl Into<String>,
        stage: Stage,
        raw_output: String,
        error: &VigilError,
    ) -> Self {
        Self {
            raw_output,
            error: Some(error.to_string()),
            error_class: Some(error.class()),
            ..Self::base(name, stage, HookStatus::Error)
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn is_passed(&self) -> bool {
        self.status == HookStatus::Passed
    }

    pub fn issue_count(&self) -> usize {
        self.parsed_issues.len()
    }

    /// A failed result must carry exactly as many issues as the tool declared
    pub fn check_count_invariant(&self) -> Result<()> {
        if self.status != HookStatus::Failed {
            return Ok(());
        }
        match self.declared_issue_count {
            Some(declared) if declared != self.parsed_issues.len() => Err(VigilError::Parsing {
                tool: self.name.clone(),
                message: format!(
                    "tool declared {} issues but {} were parsed",
                    declared,
                    self.parsed_issues.len()
                ),
            }),
            _ => Ok(()),
        }
    }
}

/// Outcome of one agent pass over an issue batch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixResult {
    /// Agent that produced this result
    pub agent: String,
    pub success: bool,
    pub confidence: f64,
    pub fixes_applied: Vec<String>,
    pub files_modified: BTreeSet<PathBuf>,
    /// Issues the agent declined or could not resolve
    pub remaining_issues: Vec<Issue>,
}

impl FixResult {
    pub fn success(agent: impl Into<String>, confidence: f64) -> Self {
        Self {
            agent: agent.into(),
            success: true,
            confidence: confidence.clamp(0.0, 1.0),
            ..Default::default()
        }
    }

    pub fn failure(agent: impl Into<String>, remaining_issues: Vec<Issue>) -> Self {
        Self {
            agent: agent.into(),
            success: false,
            confidence: 0.0,
            remaining_issues,
            ..Default::default()
        }
    }

    pub fn with_fix(mut self, description: impl Into<String>) -> Self {
        self.fixes_applied.push(description.into());
        self
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.files_modified.insert(path.into());
        self
    }

    pub fn with_remaining(mut self, issues: Vec<Issue>) -> Self {
        self.remaining_issues.extend(issues);
        self
    }

    /// Fold another result into this one
    pub fn merge(&mut self, other: FixResult) {
        self.success = self.success && other.success;
        self.confidence = self.confidence.min(other.confidence);
        self.fixes_applied.extend(other.fixes_applied);
        self.files_modified.extend(other.files_modified);
        self.remaining_issues.extend(other.remaining_issues);
    }
}

/// Coordinator-owned progress of one autofix loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationState {
    /// 1-based index of the current iteration; 0 before the first one
    pub iteration_index: usize,
    pub issues_remaining_at_start: usize,
    pub issues_remaining_at_end: usize,
    pub max_iterations: usize,
}

impl IterationState {
    pub fn new(max_iterations: usize) -> Self {
        Self {
            iteration_index: 0,
            issues_remaining_at_start: 0,
            issues_remaining_at_end: 0,
            max_iterations,
        }
    }

    /// Enter the next iteration
    pub fn begin(&mut self, issues_at_start: usize) {
        self.iteration_index += 1;
        self.issues_remaining_at_start = issues_at_start;
        self.issues_remaining_at_end = issues_at_start;
    }

    /// Record the re-verified remaining count
    pub fn finish(&mut self, issues_at_end: usize) {
        self.issues_remaining_at_end = issues_at_end;
    }

    pub fn is_converged(&self) -> bool {
        self.iteration_index > 0 && self.issues_remaining_at_end == 0
    }

    pub fn budget_spent(&self) -> bool {
        self.iteration_index >= self.max_iterations
    }

    /// Another iteration is allowed and needed
    pub fn should_continue(&self) -> bool {
        self.issues_remaining_at_end > 0 && self.iteration_index < self.max_iterations
    }

    pub fn resolved_this_iteration(&self) -> isize {
        self.issues_remaining_at_start as isize - self.issues_remaining_at_end as isize
    }
}

/// Static description of a fix agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub name: String,
    /// Declared specialization strength, used to break routing ties
    pub base_confidence: f64,
    pub capability_set: BTreeSet<IssueType>,
}

impl AgentDescriptor {
    pub fn new(name: impl Into<String>, base_confidence: f64) -> Self {
        Self {
            name: name.into(),
            base_confidence: base_confidence.clamp(0.0, 1.0),
            capability_set: BTreeSet::new(),
        }
    }

    pub fn with_capability(mut self, issue_type: IssueType) -> Self {
        self.capability_set.insert(issue_type);
        self
    }

    pub fn with_capabilities(mut self, types: impl IntoIterator<Item = IssueType>) -> Self {
        self.capability_set.extend(types);
        self
    }

    pub fn handles(&self, issue_type: IssueType) -> bool {
        self.capability_set.contains(&issue_type)
    }
}
