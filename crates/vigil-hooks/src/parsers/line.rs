//! Parsers for tools that only print human-readable output

use lazy_static::lazy_static;
use regex::Regex;
use vigil_core::{IssueType, Severity};

use super::{no_declared_count, Finding, ParseError, Parser, ParserRegistry};

/// Message of issues reported by the trailing-whitespace fixer
pub const TRAILING_WHITESPACE: &str = "trailing whitespace";
/// Message of issues reported by the end-of-file fixer
pub const MISSING_FINAL_NEWLINE: &str = "file does not end with exactly one newline";

lazy_static! {
    // src/app.py:12: error: Incompatible return value type  [return-value]
    // src/app.py:12:5: error: ...
    static ref MYPY_ERROR: Regex =
        Regex::new(r"^(?P<file>[^\s:][^:]*):(?P<line>\d+)(?::\d+)?: error: (?P<msg>.+)$").unwrap();
    static ref MYPY_FOUND: Regex =
        Regex::new(r"(?m)^Found (\d+) errors? in \d+ files?").unwrap();
    static ref MYPY_SUCCESS: Regex =
        Regex::new(r"(?m)^Success: no issues found").unwrap();

    static ref WOULD_REFORMAT: Regex = Regex::new(r"^Would reformat: (?P<file>.+)$").unwrap();
    static ref REFORMAT_SUMMARY: Regex =
        Regex::new(r"(?m)^(\d+) files? would be reformatted").unwrap();

    // pre-commit-hooks fixers report each touched file
    static ref FIXING: Regex = Regex::new(r"^Fixing (?P<file>.+)$").unwrap();

    // app/views.py:7: recieve ==> receive
    static ref CODESPELL: Regex =
        Regex::new(r"^(?P<file>.+?):(?P<line>\d+): (?P<word>.+?) ==> (?P<fix>.+)$").unwrap();

    // app/util.py:30: unused function 'helper' (60% confidence)
    static ref VULTURE: Regex = Regex::new(
        r"^(?P<file>.+?):(?P<line>\d+): (?P<msg>.+?) \((?P<conf>\d+)% confidence(?:, \d+ lines?)?\)$"
    ).unwrap();

    // app/models.py:41:9 [FURB123]: Replace `list(x)` with `x.copy()`
    static ref REFURB: Regex = Regex::new(
        r"^(?P<file>.+?):(?P<line>\d+):\d+ \[(?P<code>FURB\d+)\]: (?P<msg>.+)$"
    ).unwrap();

    // FAILED tests/test_api.py::test_login - AssertionError: assert 401 == 200
    // ERROR tests/test_db.py - ModuleNotFoundError: No module named 'psycopg'
    static ref PYTEST_SHORT: Regex = Regex::new(
        r"^(?P<kind>FAILED|ERROR) (?P<node>\S+)(?: - (?P<reason>.*))?$"
    ).unwrap();
    static ref PYTEST_SUMMARY: Regex =
        Regex::new(r"(?m)^=*\s*(?P<body>\d+ (?:failed|passed|errors?|skipped).* in \d+(?:\.\d+)?s.*?)\s*=*$").unwrap();
    static ref PYTEST_FAILED: Regex = Regex::new(r"(\d+) failed").unwrap();
    static ref PYTEST_ERRORS: Regex = Regex::new(r"(\d+) errors?").unwrap();
}

pub(super) fn register(registry: &mut ParserRegistry) {
    let typecheck = Parser::LineOriented {
        decode: parse_mypy,
        count: mypy_count,
    };
    registry.register("mypy", typecheck);
    registry.register("zuban", typecheck);

    let entries: [(&str, Parser); 9] = [
        (
            "ruff-format",
            Parser::LineOriented {
                decode: parse_ruff_format,
                count: ruff_format_count,
            },
        ),
        (
            "trailing-whitespace",
            Parser::LineOriented {
                decode: parse_trailing_whitespace,
                count: no_declared_count,
            },
        ),
        (
            "end-of-file-fixer",
            Parser::LineOriented {
                decode: parse_end_of_file,
                count: no_declared_count,
            },
        ),
        (
            "codespell",
            Parser::LineOriented {
                decode: parse_codespell,
                count: no_declared_count,
            },
        ),
        (
            "vulture",
            Parser::LineOriented {
                decode: parse_vulture,
                count: no_declared_count,
            },
        ),
        (
            "complexipy",
            Parser::LineOriented {
                decode: parse_complexipy,
                count: no_declared_count,
            },
        ),
        (
            "refurb",
            Parser::LineOriented {
                decode: parse_refurb,
                count: no_declared_count,
            },
        ),
        (
            "creosote",
            Parser::LineOriented {
                decode: parse_creosote,
                count: no_declared_count,
            },
        ),
        (
            "pytest",
            Parser::LineOriented {
                decode: parse_pytest,
                count: pytest_count,
            },
        ),
    ];
    for (tool, parser) in entries {
        registry.register(tool, parser);
    }
}

fn line_number(raw: &str) -> Result<u32, ParseError> {
    raw.parse()
        .map_err(|_| ParseError::Malformed(format!("invalid line number '{}'", raw)))
}

/// Apply `pattern` to each line, mapping matches through `build`
fn collect_matches<F>(raw: &str, pattern: &Regex, mut build: F) -> Result<Vec<Finding>, ParseError>
where
    F: FnMut(&regex::Captures) -> Result<Finding, ParseError>,
{
    raw.lines()
        .map(str::trim_end)
        .filter_map(|line| pattern.captures(line))
        .map(|caps| build(&caps))
        .collect()
}

// mypy / zuban

fn parse_mypy(raw: &str) -> Result<Vec<Finding>, ParseError> {
    // Notes annotate the preceding error and are not counted in the summary
    collect_matches(raw, &MYPY_ERROR, |caps| {
        Ok(
            Finding::new(IssueType::TypeError, Severity::High, caps["msg"].trim())
                .at(&caps["file"], Some(line_number(&caps["line"])?)),
        )
    })
}

fn mypy_count(raw: &str) -> Option<usize> {
    if let Some(caps) = MYPY_FOUND.captures(raw) {
        return caps[1].parse().ok();
    }
    MYPY_SUCCESS.is_match(raw).then_some(0)
}

// ruff format --check

fn parse_ruff_format(raw: &str) -> Result<Vec<Finding>, ParseError> {
    collect_matches(raw, &WOULD_REFORMAT, |caps| {
        Ok(Finding::new(
            IssueType::Formatting,
            Severity::Low,
            "file is not formatted",
        )
        .at(caps["file"].trim(), None))
    })
}

fn ruff_format_count(raw: &str) -> Option<usize> {
    REFORMAT_SUMMARY
        .captures(raw)
        .and_then(|caps| caps[1].parse().ok())
}

// pre-commit-hooks fixers

fn parse_trailing_whitespace(raw: &str) -> Result<Vec<Finding>, ParseError> {
    collect_matches(raw, &FIXING, |caps| {
        Ok(
            Finding::new(IssueType::Formatting, Severity::Low, TRAILING_WHITESPACE)
                .at(caps["file"].trim(), None),
        )
    })
}

fn parse_end_of_file(raw: &str) -> Result<Vec<Finding>, ParseError> {
    collect_matches(raw, &FIXING, |caps| {
        Ok(Finding::new(
            IssueType::Formatting,
            Severity::Low,
            MISSING_FINAL_NEWLINE,
        )
        .at(caps["file"].trim(), None))
    })
}

// codespell

fn parse_codespell(raw: &str) -> Result<Vec<Finding>, ParseError> {
    collect_matches(raw, &CODESPELL, |caps| {
        Ok(Finding::new(
            IssueType::Documentation,
            Severity::Low,
            format!("misspelled '{}', suggest '{}'", &caps["word"], caps["fix"].trim()),
        )
        .at(&caps["file"], Some(line_number(&caps["line"])?)))
    })
}

// vulture

fn parse_vulture(raw: &str) -> Result<Vec<Finding>, ParseError> {
    collect_matches(raw, &VULTURE, |caps| {
        let confidence: u32 = caps["conf"].parse().unwrap_or(0);
        let severity = if confidence >= 90 {
            Severity::Medium
        } else {
            Severity::Low
        };
        Ok(Finding::new(
            IssueType::DeadCode,
            severity,
            format!("{} ({}% confidence)", &caps["msg"], confidence),
        )
        .at(&caps["file"], Some(line_number(&caps["line"])?)))
    })
}

// complexipy

/// Reads FAILED rows of the results table. Cells are split on box-drawing
/// or ASCII pipes; the function is the cell before the complexity score
/// and the path is the first cell naming a Python file.
fn parse_complexipy(raw: &str) -> Result<Vec<Finding>, ParseError> {
    let mut findings = Vec::new();

    for line in raw.lines().filter(|l| l.contains("FAILED")) {
        let cells: Vec<&str> = line
            .split(['│', '┃', '|'])
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .collect();

        let Some(score_idx) = cells.iter().position(|c| c.parse::<u32>().is_ok()) else {
            continue;
        };
        if score_idx == 0 {
            continue;
        }
        let function = cells[score_idx - 1];
        let file = cells[..score_idx - 1]
            .iter()
            .find(|c| c.ends_with(".py"))
            .copied();

        let finding = Finding::new(
            IssueType::Complexity,
            Severity::Medium,
            format!(
                "function '{}' has cognitive complexity {}",
                function, cells[score_idx]
            ),
        );
        findings.push(match file {
            Some(file) => finding.at(file, None),
            None => finding,
        });
    }
    Ok(findings)
}

// refurb

fn parse_refurb(raw: &str) -> Result<Vec<Finding>, ParseError> {
    collect_matches(raw, &REFURB, |caps| {
        Ok(Finding::new(
            IssueType::Other,
            Severity::Low,
            format!("{} {}", &caps["code"], caps["msg"].trim()),
        )
        .at(&caps["file"], Some(line_number(&caps["line"])?)))
    })
}

// creosote

/// Unused dependencies are listed either inline after the header or as
/// bullet lines beneath it.
fn parse_creosote(raw: &str) -> Result<Vec<Finding>, ParseError> {
    const HEADER: &str = "Unused dependencies found:";

    let mut names: Vec<String> = Vec::new();
    let mut in_list = false;

    for line in raw.lines() {
        if let Some(idx) = line.find(HEADER) {
            in_list = true;
            names.extend(
                line[idx + HEADER.len()..]
                    .split([',', ' '])
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .map(String::from),
            );
            continue;
        }
        if in_list {
            let item = line.trim().trim_start_matches(['-', '*']).trim();
            if item.is_empty() || item.contains(':') {
                in_list = false;
            } else {
                names.push(item.to_string());
            }
        }
    }

    Ok(names
        .into_iter()
        .map(|name| {
            Finding::new(
                IssueType::DeadCode,
                Severity::Low,
                format!("unused dependency '{}'", name),
            )
            .at("pyproject.toml", None)
        })
        .collect())
}

// pytest -rfE

fn parse_pytest(raw: &str) -> Result<Vec<Finding>, ParseError> {
    collect_matches(raw, &PYTEST_SHORT, |caps| {
        let node = &caps["node"];
        let file = node.split("::").next().unwrap_or(node);
        let reason = caps
            .name("reason")
            .map(|m| m.as_str().trim())
            .filter(|r| !r.is_empty());
        let verb = if &caps["kind"] == "FAILED" {
            "failed"
        } else {
            "errored"
        };
        let message = match reason {
            Some(reason) => format!("{} {}: {}", node, verb, reason),
            None => format!("{} {}", node, verb),
        };
        Ok(Finding::new(IssueType::TestFailure, Severity::High, message).at(file, None))
    })
}

fn pytest_count(raw: &str) -> Option<usize> {
    let summary = PYTEST_SUMMARY.captures_iter(raw).last()?;
    let body = summary.name("body")?.as_str();
    let count = |pattern: &Regex| -> usize {
        pattern
            .captures(body)
            .and_then(|caps| caps[1].parse().ok())
            .unwrap_or(0)
    };
    Some(count(&PYTEST_FAILED) + count(&PYTEST_ERRORS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mypy_lines_and_count() {
        let raw = "\
src/app.py:12: error: Incompatible return value type (got \"str\", expected \"int\")  [return-value]
src/app.py:12: note: Revealed type is \"builtins.str\"
src/db.py:4:9: error: Module \"os\" has no attribute \"nope\"  [attr-defined]
Found 2 errors in 2 files (checked 9 source files)";
        let findings = parse_mypy(raw).unwrap();
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[1].file_path.as_deref(), Some("src/db.py"));
        assert_eq!(findings[1].line_number, Some(4));
        assert!(findings[0].message.ends_with("[return-value]"));
        assert_eq!(mypy_count(raw), Some(2));
        assert_eq!(mypy_count("Found 1 error in 1 file (checked 1 source file)"), Some(1));
        assert_eq!(
            mypy_count("Success: no issues found in 9 source files"),
            Some(0)
        );
        assert_eq!(mypy_count("Traceback (most recent call last):"), None);
    }

    #[test]
    fn test_ruff_format_check() {
        let raw = "Would reformat: app/main.py\nWould reformat: app/util.py\n2 files would be reformatted, 14 files already formatted";
        assert_eq!(parse_ruff_format(raw).unwrap().len(), 2);
        assert_eq!(ruff_format_count(raw), Some(2));
    }

    #[test]
    fn test_pre_commit_fixers() {
        let raw = "Fixing app/main.py\nFixing README.md\n";
        let ws = parse_trailing_whitespace(raw).unwrap();
        assert_eq!(ws.len(), 2);
        assert_eq!(ws[1].file_path.as_deref(), Some("README.md"));
        assert_eq!(parse_end_of_file(raw).unwrap().len(), 2);
    }

    #[test]
    fn test_codespell() {
        let findings = parse_codespell("app/views.py:7: recieve ==> receive\n").unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].message, "misspelled 'recieve', suggest 'receive'");
        assert_eq!(findings[0].issue_type, IssueType::Documentation);
    }

    #[test]
    fn test_vulture_confidence() {
        let raw = "app/util.py:30: unused function 'helper' (60% confidence)\n\
                   app/util.py:2: unused import 'sys' (90% confidence, 1 line)";
        let findings = parse_vulture(raw).unwrap();
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].severity, Severity::Low);
        assert_eq!(findings[1].severity, Severity::Medium);
    }

    #[test]
    fn test_complexipy_table() {
        let raw = "\
┃ Path            ┃ File     ┃ Function   ┃ Complexity ┃ Status ┃
│ app/service.py  │ service.py │ reconcile │ 22         │ FAILED │
│ app/service.py  │ service.py │ load      │ 3          │ PASSED │";
        let findings = parse_complexipy(raw).unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(
            findings[0].message,
            "function 'reconcile' has cognitive complexity 22"
        );
        assert_eq!(findings[0].file_path.as_deref(), Some("app/service.py"));
    }

    #[test]
    fn test_refurb() {
        let findings =
            parse_refurb("app/models.py:41:9 [FURB123]: Replace `list(x)` with `x.copy()`").unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].line_number, Some(41));
        assert!(findings[0].message.starts_with("FURB123"));
    }

    #[test]
    fn test_creosote_inline_and_bullets() {
        let inline = parse_creosote("Unused dependencies found: requests, toml").unwrap();
        assert_eq!(inline.len(), 2);

        let bullets =
            parse_creosote("Found dependencies in pyproject.toml: 5\nUnused dependencies found:\n- six\n- attrs\n")
                .unwrap();
        assert_eq!(bullets.len(), 2);
        assert_eq!(bullets[0].message, "unused dependency 'six'");
    }

    #[test]
    fn test_pytest_summary() {
        let raw = "\
=========================== short test summary info ============================
FAILED tests/test_api.py::test_login - AssertionError: assert 401 == 200
ERROR tests/test_db.py - ModuleNotFoundError: No module named 'psycopg'
==================== 1 failed, 4 passed, 1 error in 0.42s =====================";
        let findings = parse_pytest(raw).unwrap();
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].file_path.as_deref(), Some("tests/test_api.py"));
        assert!(findings[1].message.contains("errored"));
        assert_eq!(pytest_count(raw), Some(2));

        assert_eq!(pytest_count("2 failed, 3 passed in 1.20s"), Some(2));
        assert_eq!(pytest_count("no summary"), None);
    }
}
