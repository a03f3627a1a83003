//! In-process whitespace fixer

use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::debug;
use vigil_core::{AgentDescriptor, FixResult, Issue, IssueType, Result};
use vigil_hooks::parsers::{MISSING_FINAL_NEWLINE, TRAILING_WHITESPACE};

use crate::agent::{AgentContext, FixAgent};

const CONFIDENCE: f64 = 0.95;

/// Strips trailing whitespace and normalizes the final newline
pub struct WhitespaceAgent {
    descriptor: AgentDescriptor,
}

impl Default for WhitespaceAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl WhitespaceAgent {
    pub fn new() -> Self {
        Self {
            descriptor: AgentDescriptor::new("whitespace", CONFIDENCE)
                .with_capability(IssueType::Formatting),
        }
    }
}

/// Whitespace-normalized file content.
///
/// Each line keeps its own terminator, so CRLF files stay CRLF. The final
/// newline uses the last terminator seen, or `\n` when there is none.
pub fn normalize(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut ending = "\n";
    for line in content.split_inclusive('\n') {
        let (body, terminator) = match line.strip_suffix("\r\n") {
            Some(body) => (body, "\r\n"),
            None => match line.strip_suffix('\n') {
                Some(body) => (body, "\n"),
                None => (line, ""),
            },
        };
        if !terminator.is_empty() {
            ending = terminator;
        }
        out.push_str(body.trim_end_matches([' ', '\t']));
        out.push_str(terminator);
    }
    let trimmed_len = out.trim_end_matches(['\r', '\n']).len();
    out.truncate(trimmed_len);
    if !out.is_empty() {
        out.push_str(ending);
    }
    out
}

#[async_trait]
impl FixAgent for WhitespaceAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    fn can_handle(&self, issue: &Issue) -> f64 {
        let recognised =
            issue.message == TRAILING_WHITESPACE || issue.message == MISSING_FINAL_NEWLINE;
        if recognised && issue.file_path.is_some() {
            CONFIDENCE
        } else {
            0.0
        }
    }

    async fn fix(&self, issues: &[Issue], ctx: &AgentContext) -> Result<FixResult> {
        let mut by_file: BTreeMap<&str, Vec<&Issue>> = BTreeMap::new();
        let mut remaining = Vec::new();
        for issue in issues {
            match issue.file_path.as_deref() {
                Some(path) if self.can_handle(issue) > 0.0 => {
                    by_file.entry(path).or_default().push(issue)
                }
                _ => remaining.push(issue.clone()),
            }
        }

        let mut result = FixResult::success(self.name(), CONFIDENCE);
        for (path, file_issues) in by_file {
            if ctx.cancel.is_cancelled() {
                remaining.extend(file_issues.into_iter().cloned());
                continue;
            }
            let content = match ctx.files.read(path) {
                Ok(content) => content,
                Err(e) => {
                    debug!("Cannot read {}: {}", path, e);
                    remaining.extend(file_issues.into_iter().cloned());
                    continue;
                }
            };
            let fixed = normalize(&content);
            if fixed != content {
                if let Err(e) = ctx.files.write(path, &fixed) {
                    debug!("Cannot write {}: {}", path, e);
                    remaining.extend(file_issues.into_iter().cloned());
                    continue;
                }
                result = result
                    .with_fix(format!("normalized whitespace in {}", path))
                    .with_file(path);
            }
        }

        if !remaining.is_empty() {
            result.success = !result.fixes_applied.is_empty();
        }
        Ok(result.with_remaining(remaining))
    }
}
