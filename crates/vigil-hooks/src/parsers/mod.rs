//! Tool output parsers
//!
//! Every hook's raw output is turned into [`Issue`]s by a parser looked up
//! by tool name. Tools with a machine-readable mode are decoded as JSON or
//! NDJSON; the rest are matched line by line with anchored regexes. Both
//! kinds may also extract the count the tool declares about itself
//! ("Found 60 errors"), and the registry refuses any parse whose issue count
//! disagrees with that declaration.
//!
//! Unknown tools fail closed: there is no generic fallback parser.

pub mod error;
mod line;
mod structured;

pub use error::ParseError;
pub use line::{MISSING_FINAL_NEWLINE, TRAILING_WHITESPACE};

use std::collections::HashMap;
use std::path::Path;
use tracing::debug;
use vigil_core::{Issue, IssueType, Severity, Stage};

/// A defect as recognised by a parser, before attribution to a tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub issue_type: IssueType,
    pub severity: Severity,
    pub message: String,
    pub file_path: Option<String>,
    pub line_number: Option<u32>,
}

impl Finding {
    pub fn new(issue_type: IssueType, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            issue_type,
            severity,
            message: message.into(),
            file_path: None,
            line_number: None,
        }
    }

    pub fn at(mut self, file_path: impl Into<String>, line_number: Option<u32>) -> Self {
        self.file_path = Some(file_path.into());
        self.line_number = line_number;
        self
    }
}

pub type DecodeFn = fn(&str) -> Result<Vec<Finding>, ParseError>;
pub type CountFn = fn(&str) -> Option<usize>;

/// How a tool's output is read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStrategy {
    Structured,
    LineOriented,
}

/// A registered parser.
///
/// Structured parsers receive stdout only, since tools keep diagnostics
/// out of their JSON stream. Line-oriented parsers receive stdout and
/// stderr combined.
#[derive(Clone, Copy)]
pub enum Parser {
    Structured { decode: DecodeFn, count: CountFn },
    LineOriented { decode: DecodeFn, count: CountFn },
}

impl Parser {
    pub fn strategy(&self) -> ParseStrategy {
        match self {
            Parser::Structured { .. } => ParseStrategy::Structured,
            Parser::LineOriented { .. } => ParseStrategy::LineOriented,
        }
    }

    pub fn decode(&self, raw: &str) -> Result<Vec<Finding>, ParseError> {
        match self {
            Parser::Structured { decode, .. } | Parser::LineOriented { decode, .. } => decode(raw),
        }
    }

    /// Issue count the tool reports about itself, if any
    pub fn declared_count(&self, raw: &str) -> Option<usize> {
        match self {
            Parser::Structured { count, .. } | Parser::LineOriented { count, .. } => count(raw),
        }
    }
}

impl std::fmt::Debug for Parser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Parser").field(&self.strategy()).finish()
    }
}

pub(crate) fn no_declared_count(_raw: &str) -> Option<usize> {
    None
}

/// Lookup table from tool name to parser
#[derive(Debug, Clone)]
pub struct ParserRegistry {
    parsers: HashMap<String, Parser>,
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl ParserRegistry {
    /// Registry with no parsers
    pub fn empty() -> Self {
        Self {
            parsers: HashMap::new(),
        }
    }

    /// Registry with every built-in parser
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        structured::register(&mut registry);
        line::register(&mut registry);
        registry
    }

    pub fn register(&mut self, tool: impl Into<String>, parser: Parser) {
        self.parsers.insert(tool.into(), parser);
    }

    pub fn get(&self, tool: &str) -> Option<&Parser> {
        self.parsers.get(tool)
    }

    pub fn contains(&self, tool: &str) -> bool {
        self.parsers.contains_key(tool)
    }

    /// Registered tool names, sorted
    pub fn tools(&self) -> Vec<&str> {
        let mut tools: Vec<&str> = self.parsers.keys().map(String::as_str).collect();
        tools.sort_unstable();
        tools
    }

    /// Issue count declared by `tool` in `raw_output`
    pub fn declared_count(&self, tool: &str, raw_output: &str) -> Result<Option<usize>, ParseError> {
        let parser = self
            .get(tool)
            .ok_or_else(|| ParseError::UnknownTool(tool.to_string()))?;
        Ok(parser.declared_count(raw_output))
    }

    /// Parse `raw_output` from `tool` into issues attributed to `tool`.
    ///
    /// When `declared_count` is given, the number of parsed issues must match
    /// it exactly.
    pub fn parse(
        &self,
        tool: &str,
        raw_output: &str,
        declared_count: Option<usize>,
        stage: Stage,
    ) -> Result<Vec<Issue>, ParseError> {
        self.parse_as(tool, tool, raw_output, declared_count, stage, None)
    }

    /// Parse with a parser key that differs from the reporting tool name.
    ///
    /// Absolute paths under `project_root` are made relative to it.
    pub fn parse_as(
        &self,
        parser_key: &str,
        source_tool: &str,
        raw_output: &str,
        declared_count: Option<usize>,
        stage: Stage,
        project_root: Option<&Path>,
    ) -> Result<Vec<Issue>, ParseError> {
        let parser = self
            .get(parser_key)
            .ok_or_else(|| ParseError::UnknownTool(parser_key.to_string()))?;

        let findings = parser.decode(raw_output)?;

        if let Some(declared) = declared_count {
            if declared != findings.len() {
                return Err(ParseError::CountMismatch {
                    declared,
                    parsed: findings.len(),
                });
            }
        }

        let issues = findings
            .into_iter()
            .map(|finding| to_issue(finding, source_tool, stage, project_root))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            "Parsed {} issues from {} ({:?})",
            issues.len(),
            source_tool,
            parser.strategy()
        );
        Ok(issues)
    }
}

fn to_issue(
    finding: Finding,
    source_tool: &str,
    stage: Stage,
    project_root: Option<&Path>,
) -> Result<Issue, ParseError> {
    let file_path = finding
        .file_path
        .map(|path| relativize(&path, project_root));

    Issue::new(
        finding.issue_type,
        finding.severity,
        finding.message,
        source_tool,
        stage,
    )
    .map(|issue| issue.at(file_path, finding.line_number))
    .map_err(|e| ParseError::InvalidIssue(e.to_string()))
}

fn relativize(path: &str, project_root: Option<&Path>) -> String {
    let Some(root) = project_root else {
        return path.to_string();
    };
    match Path::new(path).strip_prefix(root) {
        Ok(relative) => relative.to_string_lossy().to_string(),
        Err(_) => path.to_string(),
    }
}

/// Slice from the first line that opens a JSON document.
///
/// Some tools print a banner before their JSON payload.
pub(crate) fn json_payload(raw: &str) -> Result<&str, ParseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ParseError::EmptyOutput);
    }
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Ok(trimmed);
    }
    let mut offset = 0;
    for line in trimmed.split_inclusive('\n') {
        let start = line.trim_start();
        if start.starts_with('{') || start.starts_with('[') {
            return Ok(&trimmed[offset..]);
        }
        offset += line.len();
    }
    Err(ParseError::Malformed("no JSON document in output".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_tool_fails_closed() {
        let registry = ParserRegistry::with_builtin();
        let err = registry
            .parse("made-up-linter", "x.py:1: bad", None, Stage::FastHooks)
            .unwrap_err();
        assert_eq!(err, ParseError::UnknownTool("made-up-linter".to_string()));
    }

    #[test]
    fn test_builtin_catalogue() {
        let registry = ParserRegistry::with_builtin();
        for tool in [
            "ruff",
            "ruff-format",
            "pyright",
            "bandit",
            "semgrep",
            "pip-audit",
            "gitleaks",
            "mypy",
            "mypy-json",
            "zuban",
            "trailing-whitespace",
            "end-of-file-fixer",
            "codespell",
            "vulture",
            "complexipy",
            "refurb",
            "creosote",
            "pytest",
        ] {
            assert!(registry.contains(tool), "missing parser for {}", tool);
        }
        assert_eq!(
            registry.get("ruff").unwrap().strategy(),
            ParseStrategy::Structured
        );
        assert_eq!(
            registry.get("zuban").unwrap().strategy(),
            ParseStrategy::LineOriented
        );
    }

    #[test]
    fn test_count_mismatch_is_rejected() {
        let registry = ParserRegistry::with_builtin();
        let raw = "app.py:3: error: Name \"x\" is not defined  [name-defined]\n\
                   Found 2 errors in 1 file (checked 4 source files)";
        let declared = registry.declared_count("zuban", raw).unwrap();
        assert_eq!(declared, Some(2));
        let err = registry
            .parse("zuban", raw, declared, Stage::ComprehensiveHooks)
            .unwrap_err();
        assert_eq!(
            err,
            ParseError::CountMismatch {
                declared: 2,
                parsed: 1
            }
        );
    }

    #[test]
    fn test_parse_as_attributes_and_relativizes() {
        let registry = ParserRegistry::with_builtin();
        let raw = "/work/proj/src/app.py:3: error: Incompatible types  [assignment]";
        let issues = registry
            .parse_as(
                "mypy",
                "typecheck",
                raw,
                None,
                Stage::ComprehensiveHooks,
                Some(Path::new("/work/proj")),
            )
            .unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].source_tool, "typecheck");
        assert_eq!(issues[0].file_path.as_deref(), Some("src/app.py"));
        assert_eq!(issues[0].line_number, Some(3));
    }

    #[test]
    fn test_custom_parser_registration() {
        fn decode(raw: &str) -> Result<Vec<Finding>, ParseError> {
            Ok(raw
                .lines()
                .filter(|l| !l.is_empty())
                .map(|l| Finding::new(IssueType::Other, Severity::Low, l))
                .collect())
        }
        let mut registry = ParserRegistry::empty();
        registry.register(
            "custom",
            Parser::LineOriented {
                decode,
                count: no_declared_count,
            },
        );
        let issues = registry
            .parse("custom", "one\ntwo\n", None, Stage::FastHooks)
            .unwrap();
        assert_eq!(issues.len(), 2);
        assert_eq!(registry.tools(), vec!["custom"]);
    }

    #[test]
    fn test_json_payload_skips_banner() {
        assert_eq!(json_payload("Run started: today\n[]").unwrap(), "[]");
        assert_eq!(json_payload("  \n"), Err(ParseError::EmptyOutput));
        assert!(matches!(
            json_payload("no json here"),
            Err(ParseError::Malformed(_))
        ));
    }
}
