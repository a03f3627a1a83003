//! Configuration management for Vigil
//!
//! Project-level settings live in `.vigil/config.toml`: hook lists for the
//! fast and comprehensive stages, execution limits, autofix policy and the
//! command agents available to the router.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::{HookSpec, IssueType, Result, Stage, VigilError};

/// Repository-level Vigil configuration
///
/// Loaded from `.vigil/config.toml` in the project root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VigilConfig {
    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub autofix: AutofixConfig,

    #[serde(default)]
    pub hooks: HooksConfig,

    #[serde(default)]
    pub agents: AgentsConfig,

    #[serde(default)]
    pub progress: ProgressConfig,

    #[serde(default)]
    pub report: ReportConfig,

    #[serde(default)]
    pub downstream: DownstreamConfig,
}

/// Hook execution limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Worker pool size for parallel-safe hooks
    #[serde(default = "default_max_parallel_hooks")]
    pub max_parallel_hooks: usize,
}

/// Autofix loop policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutofixConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Wall-clock bound for all agent work in one iteration
    #[serde(default = "default_iteration_timeout_secs")]
    pub iteration_timeout_secs: u64,

    /// Minimum agent confidence for an assignment
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// Group issues by (tool, type) before dispatch
    #[serde(default = "default_true")]
    pub batch: bool,

    /// Allow one hand-off of remaining issues to a second agent
    #[serde(default = "default_true")]
    pub collaborative: bool,

    /// Consecutive agent failures before the agent is skipped
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,

    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,
}

/// Hook lists per stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HooksConfig {
    #[serde(default = "default_fast_hooks")]
    pub fast: Vec<HookSpec>,

    #[serde(default = "default_comprehensive_hooks")]
    pub comprehensive: Vec<HookSpec>,
}

/// Agents available to the router
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    /// Register the built-in whitespace agent
    #[serde(default = "default_true")]
    pub whitespace: bool,

    #[serde(default = "default_command_agents")]
    pub command: Vec<CommandAgentConfig>,
}

/// An agent that fixes issues by running a command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandAgentConfig {
    pub name: String,
    pub command: Vec<String>,
    /// Issue types this agent claims
    pub handles: Vec<IssueType>,
    /// Restrict to issues from these tools (empty = any tool)
    #[serde(default)]
    pub tools: Vec<String>,
    pub confidence: f64,
    #[serde(default = "default_agent_timeout_secs")]
    pub timeout_seconds: u64,
}

/// Progress event buffering
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Events retained for slow consumers before the oldest are dropped
    #[serde(default = "default_progress_buffer")]
    pub buffer: usize,
}

/// Run report output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_report_path")]
    pub path: String,
}

/// Steps run after the pipeline passes (tests, publish, ...)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownstreamConfig {
    #[serde(default)]
    pub steps: Vec<HookSpec>,
}

/// Iteration budget selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetMode {
    Quick,
    #[default]
    Standard,
    Thorough,
}

impl BudgetMode {
    /// Iteration budget for this mode
    pub fn max_iterations(&self, autofix: &AutofixConfig) -> usize {
        match self {
            BudgetMode::Quick => QUICK_MAX_ITERATIONS.min(autofix.max_iterations.max(1)),
            BudgetMode::Standard => autofix.max_iterations,
            BudgetMode::Thorough => THOROUGH_MAX_ITERATIONS.max(autofix.max_iterations),
        }
    }
}

const QUICK_MAX_ITERATIONS: usize = 3;
const THOROUGH_MAX_ITERATIONS: usize = 8;

// Default value providers
fn default_true() -> bool {
    true
}

fn default_max_parallel_hooks() -> usize {
    3
}

fn default_max_iterations() -> usize {
    5
}

fn default_iteration_timeout_secs() -> u64 {
    300
}

fn default_confidence_threshold() -> f64 {
    0.7
}

fn default_breaker_threshold() -> u32 {
    3
}

fn default_breaker_cooldown_secs() -> u64 {
    60
}

fn default_agent_timeout_secs() -> u64 {
    120
}

fn default_progress_buffer() -> usize {
    256
}

fn default_report_path() -> String {
    ".vigil/last-run.json".to_string()
}

fn default_fast_hooks() -> Vec<HookSpec> {
    vec![
        HookSpec::new("trailing-whitespace", &["trailing-whitespace-fixer"]).with_timeout(60),
        HookSpec::new("end-of-file-fixer", &["end-of-file-fixer"]).with_timeout(60),
        HookSpec::new("ruff-format", &["ruff", "format", "--check", "."])
            .parallel()
            .with_timeout(60),
        HookSpec::new("ruff", &["ruff", "check", "--output-format=json", "."])
            .parallel()
            .with_timeout(120),
        HookSpec::new("codespell", &["codespell"]).parallel().with_timeout(60),
    ]
}

fn default_comprehensive_hooks() -> Vec<HookSpec> {
    vec![
        HookSpec::new("zuban", &["zuban", "check"]).parallel().with_timeout(300),
        HookSpec::new("bandit", &["bandit", "-r", ".", "-f", "json", "-q"])
            .parallel()
            .with_timeout(300),
        HookSpec::new("vulture", &["vulture", "."]).parallel().with_timeout(120),
        HookSpec::new(
            "complexipy",
            &["complexipy", ".", "--max-complexity-allowed", "15"],
        )
        .parallel()
        .with_timeout(120),
        HookSpec::new("refurb", &["refurb", "."]).parallel().with_timeout(300),
        HookSpec::new("creosote", &["creosote"]).with_timeout(120),
        HookSpec::new("pytest", &["pytest", "-q", "--no-header", "-rfE"]).with_timeout(900),
    ]
}

fn default_command_agents() -> Vec<CommandAgentConfig> {
    vec![
        CommandAgentConfig {
            name: "ruff-fix".to_string(),
            command: vec![
                "ruff".to_string(),
                "check".to_string(),
                "--fix".to_string(),
                ".".to_string(),
            ],
            handles: vec![
                IssueType::Formatting,
                IssueType::DeadCode,
                IssueType::Other,
            ],
            tools: vec!["ruff".to_string()],
            confidence: 0.8,
            timeout_seconds: default_agent_timeout_secs(),
        },
        CommandAgentConfig {
            name: "ruff-format".to_string(),
            command: vec!["ruff".to_string(), "format".to_string(), ".".to_string()],
            handles: vec![IssueType::Formatting],
            tools: vec!["ruff-format".to_string()],
            confidence: 0.9,
            timeout_seconds: default_agent_timeout_secs(),
        },
    ]
}

impl VigilConfig {
    /// Load configuration from `.vigil/config.toml` or use defaults
    pub fn load_or_default(project_root: &Path) -> Result<Self> {
        let config_path = project_root.join(".vigil/config.toml");

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            tracing::debug!("No config at {:?}, using defaults", config_path);
            Ok(Self::default())
        }
    }

    /// Load and validate configuration from an explicit path
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| VigilError::Config(format!("Failed to parse {:?}: {}", path, e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Write default configuration to `.vigil/config.toml`
    pub fn write_default(project_root: &Path) -> Result<()> {
        let config_dir = project_root.join(".vigil");
        std::fs::create_dir_all(&config_dir)?;

        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| VigilError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(config_dir.join("config.toml"), content)?;
        Ok(())
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.execution.max_parallel_hooks == 0 {
            return Err(VigilError::Config(
                "execution.max_parallel_hooks must be at least 1".to_string(),
            ));
        }
        if self.autofix.max_iterations == 0 {
            return Err(VigilError::Config(
                "autofix.max_iterations must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.autofix.confidence_threshold) {
            return Err(VigilError::Config(format!(
                "autofix.confidence_threshold must be within [0, 1], got {}",
                self.autofix.confidence_threshold
            )));
        }

        let mut seen = HashSet::new();
        for hook in self.hooks.fast.iter().chain(&self.hooks.comprehensive) {
            if hook.command.is_empty() || hook.command[0].trim().is_empty() {
                return Err(VigilError::Config(format!(
                    "hook '{}' has an empty command",
                    hook.name
                )));
            }
            if !seen.insert(hook.name.as_str()) {
                return Err(VigilError::Config(format!(
                    "hook name '{}' is declared more than once",
                    hook.name
                )));
            }
        }

        for agent in &self.agents.command {
            if agent.command.is_empty() {
                return Err(VigilError::Config(format!(
                    "agent '{}' has an empty command",
                    agent.name
                )));
            }
            if agent.handles.is_empty() {
                return Err(VigilError::Config(format!(
                    "agent '{}' declares no issue types",
                    agent.name
                )));
            }
        }

        Ok(())
    }

    /// Look up a hook spec by name across both stages, with its stage
    pub fn find_hook(&self, name: &str) -> Option<(&HookSpec, Stage)> {
        let fast = self.hooks.fast.iter().map(|h| (h, Stage::FastHooks));
        let comprehensive = self
            .hooks
            .comprehensive
            .iter()
            .map(|h| (h, Stage::ComprehensiveHooks));
        fast.chain(comprehensive).find(|(h, _)| h.name == name)
    }
}

impl AutofixConfig {
    pub fn iteration_timeout(&self) -> Duration {
        Duration::from_secs(self.iteration_timeout_secs)
    }
}

impl Default for VigilConfig {
    fn default() -> Self {
        Self {
            execution: ExecutionConfig::default(),
            autofix: AutofixConfig::default(),
            hooks: HooksConfig::default(),
            agents: AgentsConfig::default(),
            progress: ProgressConfig::default(),
            report: ReportConfig::default(),
            downstream: DownstreamConfig::default(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallel_hooks: default_max_parallel_hooks(),
        }
    }
}

impl Default for AutofixConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_iterations: default_max_iterations(),
            iteration_timeout_secs: default_iteration_timeout_secs(),
            confidence_threshold: default_confidence_threshold(),
            batch: true,
            collaborative: true,
            breaker_threshold: default_breaker_threshold(),
            breaker_cooldown_secs: default_breaker_cooldown_secs(),
        }
    }
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            fast: default_fast_hooks(),
            comprehensive: default_comprehensive_hooks(),
        }
    }
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            whitespace: true,
            command: default_command_agents(),
        }
    }
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            buffer: default_progress_buffer(),
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_report_path(),
        }
    }
}
