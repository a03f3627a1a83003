//! Issue aggregation across hook results
//!
//! Folds the latest [`HookResult`]s of both stages into one ordered,
//! deduplicated work list and decides whether that list can be trusted:
//! a failed hook that yields no issues means the parsing layer is broken,
//! not that the project is clean.

use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};
use vigil_core::{DedupKey, ErrorClass, HookResult, HookStatus, Issue, IssueType, VigilError};

/// A hook that ended in `Error` or `Timeout`
#[derive(Debug, Clone, PartialEq)]
pub struct HookFault {
    pub hook: String,
    pub class: ErrorClass,
    pub message: String,
}

/// Merged view of a set of hook results
#[derive(Debug, Clone, Default)]
pub struct Aggregation {
    /// Deduplicated issues, most severe first
    pub issues: Vec<Issue>,
    pub by_type: BTreeMap<IssueType, usize>,
    /// Hooks with status `Failed`
    pub failed_hooks: Vec<String>,
    pub timed_out_hooks: Vec<String>,
    /// Hooks that ended in `Error` (parse failures included)
    pub faults: Vec<HookFault>,
    /// Issues dropped as duplicates of another hook's finding
    pub duplicates: usize,
}

impl Aggregation {
    pub fn issue_count(&self) -> usize {
        self.issues.len()
    }

    /// Hooks that did not pass or skip
    pub fn blocking_count(&self) -> usize {
        self.failed_hooks.len() + self.timed_out_hooks.len() + self.faults.len()
    }

    pub fn is_clean(&self) -> bool {
        self.blocking_count() == 0
    }

    pub fn parse_failures(&self) -> impl Iterator<Item = &HookFault> {
        self.faults
            .iter()
            .filter(|f| f.class == ErrorClass::ParsingError)
    }

    /// Why this aggregation cannot be handed to agents, if it can't.
    ///
    /// Issues from healthy hooks are always workable, so this only fires
    /// when nothing was extracted while something still blocks.
    pub fn extraction_failure(&self) -> Option<ExtractionFailure> {
        if !self.issues.is_empty() || self.is_clean() {
            return None;
        }

        if !self.failed_hooks.is_empty() {
            let err = VigilError::ExtractionInvariantViolation {
                failed_hooks: self.failed_hooks.clone(),
            };
            return Some(ExtractionFailure::from_error(&err));
        }

        let parse_failures: Vec<&HookFault> = self.parse_failures().collect();
        let only_parse_failures = parse_failures.len() == self.faults.len()
            && self.timed_out_hooks.is_empty();
        if !parse_failures.is_empty() && only_parse_failures {
            let hooks: Vec<&str> = parse_failures.iter().map(|f| f.hook.as_str()).collect();
            return Some(ExtractionFailure {
                class: ErrorClass::ParsingError,
                message: format!("no parsable output from {}", hooks.join(", ")),
            });
        }

        if let Some(fault) = self.faults.iter().find(|f| f.class != ErrorClass::ParsingError) {
            return Some(ExtractionFailure {
                class: fault.class,
                message: format!("{}: {}", fault.hook, fault.message),
            });
        }
        let hook = self.timed_out_hooks.first().cloned().unwrap_or_default();
        Some(ExtractionFailure {
            class: ErrorClass::HookTimeout,
            message: format!("{} timed out", hook),
        })
    }
}

/// A blocking state with nothing for agents to work on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionFailure {
    pub class: ErrorClass,
    pub message: String,
}

impl ExtractionFailure {
    pub fn from_error(err: &VigilError) -> Self {
        Self {
            class: err.class(),
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for ExtractionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

/// Merge `results` into a single work list
pub fn aggregate<'a>(results: impl IntoIterator<Item = &'a HookResult>) -> Aggregation {
    let mut agg = Aggregation::default();
    let mut seen: HashMap<DedupKey, usize> = HashMap::new();
    let mut issues: Vec<Issue> = Vec::new();

    for result in results {
        match result.status {
            HookStatus::Passed | HookStatus::Skipped => continue,
            HookStatus::Failed => agg.failed_hooks.push(result.name.clone()),
            HookStatus::Timeout => {
                agg.timed_out_hooks.push(result.name.clone());
                continue;
            }
            HookStatus::Error => {
                agg.faults.push(HookFault {
                    hook: result.name.clone(),
                    class: result.error_class.unwrap_or(ErrorClass::Internal),
                    message: result.error.clone().unwrap_or_default(),
                });
                continue;
            }
        }

        if result.parsed_issues.is_empty() {
            warn!("Hook {} failed without reporting any issues", result.name);
        }

        for issue in &result.parsed_issues {
            match seen.get(&issue.dedup_key()) {
                Some(&slot) => {
                    agg.duplicates += 1;
                    if issue.severity < issues[slot].severity {
                        issues[slot].severity = issue.severity;
                    }
                }
                None => {
                    seen.insert(issue.dedup_key(), issues.len());
                    issues.push(issue.clone());
                }
            }
        }
    }

    issues.sort_by(|a, b| {
        a.severity
            .cmp(&b.severity)
            .then_with(|| a.file_path.cmp(&b.file_path))
            .then_with(|| a.line_number.cmp(&b.line_number))
            .then_with(|| a.source_tool.cmp(&b.source_tool))
            .then_with(|| a.message.cmp(&b.message))
    });
    for issue in &issues {
        *agg.by_type.entry(issue.issue_type).or_default() += 1;
    }
    agg.issues = issues;

    debug!(
        "Aggregated {} issues ({} duplicates) from {} failed hooks",
        agg.issues.len(),
        agg.duplicates,
        agg.failed_hooks.len()
    );
    agg
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::{Severity, Stage};

    fn issue(tool: &str, severity: Severity, line: u32, message: &str) -> Issue {
        Issue::new(IssueType::TypeError, severity, message, tool, Stage::ComprehensiveHooks)
            .unwrap()
            .at(Some("src/app.py".to_string()), Some(line))
    }

    fn failed(name: &str, issues: Vec<Issue>) -> HookResult {
        let count = issues.len();
        HookResult::failed(name, Stage::ComprehensiveHooks, String::new(), Some(count), issues)
    }

    #[test]
    fn test_dedup_keeps_highest_severity() {
        let a = failed("zuban", vec![issue("zuban", Severity::Medium, 3, "bad return")]);
        let b = failed("zuban", vec![issue("zuban", Severity::Critical, 3, "bad return")]);

        let agg = aggregate([&a, &b]);
        assert_eq!(agg.issue_count(), 1);
        assert_eq!(agg.duplicates, 1);
        assert_eq!(agg.issues[0].severity, Severity::Critical);
    }

    #[test]
    fn test_same_line_distinct_messages_kept() {
        let result = failed(
            "zuban",
            vec![
                issue("zuban", Severity::High, 3, "Incompatible return value type (got \"str\")"),
                issue("zuban", Severity::High, 3, "Incompatible return value type (got \"int\")"),
            ],
        );
        assert_eq!(aggregate([&result]).issue_count(), 2);
    }

    #[test]
    fn test_ordering_and_type_counts() {
        let result = failed(
            "zuban",
            vec![
                issue("zuban", Severity::Low, 1, "low"),
                issue("zuban", Severity::High, 9, "high late"),
                issue("zuban", Severity::High, 2, "high early"),
            ],
        );
        let agg = aggregate([&result]);
        let messages: Vec<&str> = agg.issues.iter().map(|i| i.message.as_str()).collect();
        assert_eq!(messages, vec!["high early", "high late", "low"]);
        assert_eq!(agg.by_type.get(&IssueType::TypeError), Some(&3));
    }

    #[test]
    fn test_failed_without_issues_violates_invariant() {
        let result = failed("zuban", vec![]);
        let failure = aggregate([&result]).extraction_failure().unwrap();
        assert_eq!(failure.class, ErrorClass::ExtractionInvariantViolation);
    }

    #[test]
    fn test_only_parse_failures() {
        let err = VigilError::Parsing {
            tool: "bandit".to_string(),
            message: "truncated".to_string(),
        };
        let result = HookResult::error("bandit", Stage::ComprehensiveHooks, String::new(), &err);
        let failure = aggregate([&result]).extraction_failure().unwrap();
        assert_eq!(failure.class, ErrorClass::ParsingError);
    }

    #[test]
    fn test_timeout_alone_is_hook_timeout() {
        let result = HookResult::timeout("pytest", Stage::ComprehensiveHooks, 600);
        let agg = aggregate([&result]);
        assert_eq!(agg.timed_out_hooks, vec!["pytest"]);
        assert_eq!(agg.extraction_failure().unwrap().class, ErrorClass::HookTimeout);
    }

    #[test]
    fn test_issues_beside_faults_are_workable() {
        let timeout = HookResult::timeout("pytest", Stage::ComprehensiveHooks, 600);
        let result = failed("zuban", vec![issue("zuban", Severity::High, 1, "x")]);
        let agg = aggregate([&timeout, &result]);
        assert!(agg.extraction_failure().is_none());
        assert_eq!(agg.blocking_count(), 2);
    }

    #[test]
    fn test_clean_results() {
        let passed = HookResult::passed("ruff", Stage::FastHooks, String::new());
        let agg = aggregate([&passed]);
        assert!(agg.is_clean());
        assert!(agg.extraction_failure().is_none());
    }
}
