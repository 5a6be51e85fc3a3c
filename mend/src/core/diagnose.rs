//! Rule-based classification of failed verification output.
//!
//! The rule table below is evaluated top-to-bottom per failing step and the
//! first matching rule wins. Table order is part of the contract: it is the
//! tie-break for output matching more than one signature, so rules must not
//! be reordered without revisiting every caller that depends on categories.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{
    Finding, FindingCategory, Location, RunResult, StepResult,
};

/// Lines of raw tail carried by an `unknown` finding.
const UNKNOWN_TAIL_LINES: usize = 20;

static MODULE_NOT_FOUND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"ModuleNotFoundError: No module named '([^']+)'").unwrap()
});
static NAME_ERROR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"NameError: name '([^']+)' is not defined").unwrap());
static CORS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bCORS\b|Access-Control-Allow-Origin").unwrap());
static PYTEST_FAILED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(?:FAILED|ERROR) (\S+)").unwrap());
static ROUTE_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:^|[\s"'=(,])(/[a-z][a-z0-9_]*(?:/[A-Za-z0-9_{}-]+)*)"#).unwrap()
});
static ASSERTION_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"AssertionError").unwrap());
static LINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*([^\s:]+\.(?:js|jsx|ts|tsx|py))[:\s]+(\d+):(\d+)\s+(?:error|warning)")
        .unwrap()
});
static PY_TRACE_FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"File "([^"]+)", line (\d+)"#).unwrap());
static PYTEST_FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(.+?\.py):(\d+):").unwrap());

struct Rule {
    matches: fn(&str) -> bool,
    extract: fn(&str, &StepResult) -> Finding,
}

/// Ordered rule table. First match wins.
const RULES: &[Rule] = &[
    // missing-dependency
    Rule {
        matches: |output| MODULE_NOT_FOUND_RE.is_match(output),
        extract: extract_missing_dependency,
    },
    // missing-import
    Rule {
        matches: |output| NAME_ERROR_RE.is_match(output),
        extract: extract_missing_import,
    },
    // cors
    Rule {
        matches: |output| CORS_RE.is_match(output),
        extract: extract_cors,
    },
    // route-not-registered
    Rule {
        matches: |output| unregistered_route(output).is_some(),
        extract: extract_route_not_registered,
    },
    // assertion-failure
    Rule {
        matches: |output| PYTEST_FAILED_RE.is_match(output) || ASSERTION_RE.is_match(output),
        extract: extract_assertion_failure,
    },
    // lint-violation
    Rule {
        matches: |output| LINT_RE.is_match(output),
        extract: extract_lint_violation,
    },
];

/// Classify a failed run into an ordered sequence of findings.
///
/// Pure function of the run result: identical captured output yields an
/// identical findings sequence. Steps with status ERROR/TIMEOUT/SKIPPED are
/// never examined; their failures are not fixable.
pub fn diagnose(run: &RunResult) -> Vec<Finding> {
    run.fixable_steps().map(classify_step).collect()
}

fn classify_step(step: &StepResult) -> Finding {
    for rule in RULES {
        if (rule.matches)(&step.output) {
            return (rule.extract)(&step.output, step);
        }
    }
    unknown_finding(step)
}

fn extract_missing_dependency(output: &str, step: &StepResult) -> Finding {
    let caps = MODULE_NOT_FOUND_RE.captures(output).expect("rule matched");
    let module = caps[1].to_string();
    Finding {
        category: FindingCategory::MissingDependency,
        message: format!("module '{module}' is not installed"),
        detail: Some(module),
        location: trace_location(output),
        scope: step.scope,
        step: step.name.clone(),
    }
}

fn extract_missing_import(output: &str, step: &StepResult) -> Finding {
    let caps = NAME_ERROR_RE.captures(output).expect("rule matched");
    let symbol = caps[1].to_string();
    Finding {
        category: FindingCategory::MissingImport,
        message: format!("name '{symbol}' is not defined"),
        detail: Some(symbol),
        location: trace_location(output),
        scope: step.scope,
        step: step.name.clone(),
    }
}

fn extract_cors(output: &str, step: &StepResult) -> Finding {
    Finding {
        category: FindingCategory::CorsMisconfigured,
        message: "CORS middleware missing or too strict".to_string(),
        detail: None,
        location: trace_location(output),
        scope: step.scope,
        step: step.name.clone(),
    }
}

/// Request path from a line mentioning both the path and a 404.
///
/// Both must sit on the same line: a 404 in one failure and a path in an
/// unrelated one should not combine into a routing diagnosis.
fn unregistered_route(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        if !line.contains("404") {
            return None;
        }
        ROUTE_PATH_RE
            .captures(line)
            .map(|caps| caps[1].to_string())
    })
}

fn extract_route_not_registered(output: &str, step: &StepResult) -> Finding {
    let path = unregistered_route(output).expect("rule matched");
    Finding {
        category: FindingCategory::RouteNotRegistered,
        message: format!("request to '{path}' returned 404"),
        detail: Some(path),
        location: trace_location(output),
        scope: step.scope,
        step: step.name.clone(),
    }
}

fn extract_assertion_failure(output: &str, step: &StepResult) -> Finding {
    let mut location = trace_location(output).unwrap_or_default();
    if let Some(caps) = PYTEST_FAILED_RE.captures(output) {
        let test_id = caps[1]
            .split(" - ")
            .next()
            .unwrap_or(&caps[1])
            .trim()
            .to_string();
        location.file = Some(
            test_id
                .split_once("::")
                .map(|(file, _)| file.to_string())
                .unwrap_or_else(|| test_id.clone()),
        );
        location.test = Some(test_id);
    }
    let message = match &location.test {
        Some(test) => format!("test '{test}' failed"),
        None => "assertion failed".to_string(),
    };
    Finding {
        category: FindingCategory::AssertionFailure,
        message,
        detail: None,
        location: Some(location),
        scope: step.scope,
        step: step.name.clone(),
    }
}

fn extract_lint_violation(output: &str, step: &StepResult) -> Finding {
    let caps = LINT_RE.captures(output).expect("rule matched");
    let file = caps[1].to_string();
    let line = caps[2].parse().ok();
    Finding {
        category: FindingCategory::LintViolation,
        message: format!("lint violation in {file}"),
        detail: None,
        location: Some(Location {
            file: Some(file),
            line,
            test: None,
        }),
        scope: step.scope,
        step: step.name.clone(),
    }
}

fn unknown_finding(step: &StepResult) -> Finding {
    Finding {
        category: FindingCategory::Unknown,
        message: step.tail(UNKNOWN_TAIL_LINES).join("\n"),
        detail: None,
        location: None,
        scope: step.scope,
        step: step.name.clone(),
    }
}

/// Best-effort file/line from a Python traceback or pytest failure line.
fn trace_location(output: &str) -> Option<Location> {
    if let Some(caps) = PY_TRACE_FILE_RE.captures(output) {
        return Some(Location {
            file: Some(caps[1].to_string()),
            line: caps[2].parse().ok(),
            test: None,
        });
    }
    if let Some(caps) = PYTEST_FILE_RE.captures(output) {
        return Some(Location {
            file: Some(caps[1].to_string()),
            line: caps[2].parse().ok(),
            test: None,
        });
    }
    None
}

/// Files referenced by the captured output, deduplicated in appearance order.
///
/// Used as a hint when a plan template needs a concrete target file.
pub fn files_hint(output: &str) -> Vec<String> {
    let mut files = Vec::new();
    for caps in PY_TRACE_FILE_RE.captures_iter(output) {
        push_unique(&mut files, caps[1].to_string());
    }
    for caps in PYTEST_FILE_RE.captures_iter(output) {
        push_unique(&mut files, caps[1].to_string());
    }
    files
}

fn push_unique(files: &mut Vec<String>, file: String) {
    if !files.contains(&file) {
        files.push(file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Scope, StepStatus};

    fn failed_step(output: &str) -> StepResult {
        StepResult {
            scope: Scope::Backend,
            name: "pytest".to_string(),
            command: vec!["python".to_string(), "-m".to_string(), "pytest".to_string()],
            exit_code: Some(1),
            status: StepStatus::Fail,
            duration_ms: 10,
            output: output.to_string(),
        }
    }

    fn run_with(output: &str) -> RunResult {
        RunResult {
            steps: vec![failed_step(output)],
        }
    }

    #[test]
    fn classifies_missing_dependency() {
        let run = run_with("ModuleNotFoundError: No module named 'httpx'");
        let findings = diagnose(&run);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].category, FindingCategory::MissingDependency);
        assert_eq!(findings[0].detail.as_deref(), Some("httpx"));
    }

    #[test]
    fn classifies_missing_import_with_location() {
        let output = "Traceback (most recent call last):\n  File \"app/main.py\", line 12, in root\nNameError: name 'Query' is not defined";
        let findings = diagnose(&run_with(output));
        assert_eq!(findings[0].category, FindingCategory::MissingImport);
        assert_eq!(findings[0].detail.as_deref(), Some("Query"));
        let location = findings[0].location.as_ref().expect("location");
        assert_eq!(location.file.as_deref(), Some("app/main.py"));
        assert_eq!(location.line, Some(12));
    }

    #[test]
    fn classifies_assertion_failure_with_test_id() {
        let output = "FAILED tests/test_api.py::test_list - assert 404 == 200";
        let findings = diagnose(&run_with(output));
        assert_eq!(findings[0].category, FindingCategory::AssertionFailure);
        let location = findings[0].location.as_ref().expect("location");
        assert_eq!(location.test.as_deref(), Some("tests/test_api.py::test_list"));
        assert_eq!(location.file.as_deref(), Some("tests/test_api.py"));
    }

    #[test]
    fn classifies_unregistered_route_from_404_line() {
        let output = "E       AssertionError: GET /defects returned 404";
        let findings = diagnose(&run_with(output));
        assert_eq!(findings[0].category, FindingCategory::RouteNotRegistered);
        assert_eq!(findings[0].detail.as_deref(), Some("/defects"));
    }

    #[test]
    fn route_rule_wins_over_assertion_failure() {
        let output =
            "FAILED tests/test_defects.py::test_list - AssertionError: GET '/defects' returned 404";
        let findings = diagnose(&run_with(output));
        assert_eq!(findings[0].category, FindingCategory::RouteNotRegistered);
    }

    #[test]
    fn path_and_404_on_separate_lines_stay_an_assertion() {
        let output =
            "response = client.get(\"/defects\")\nE       assert 404 == 200\nAssertionError: expected 200";
        let findings = diagnose(&run_with(output));
        assert_eq!(findings[0].category, FindingCategory::AssertionFailure);
    }

    #[test]
    fn classifies_lint_violation() {
        let output = "  src/App.tsx:14:3  error  'useState' is not defined  no-undef";
        let findings = diagnose(&run_with(output));
        assert_eq!(findings[0].category, FindingCategory::LintViolation);
        assert_eq!(
            findings[0].location.as_ref().and_then(|l| l.file.as_deref()),
            Some("src/App.tsx")
        );
    }

    #[test]
    fn first_match_wins_over_later_rules() {
        // Output matching both missing-dependency and assertion-failure:
        // table order makes missing-dependency win.
        let output =
            "FAILED tests/test_api.py::test_list\nModuleNotFoundError: No module named 'httpx'";
        let findings = diagnose(&run_with(output));
        assert_eq!(findings[0].category, FindingCategory::MissingDependency);
    }

    #[test]
    fn unmatched_output_yields_unknown_with_raw_tail() {
        let findings = diagnose(&run_with("segmentation fault (core dumped)"));
        assert_eq!(findings[0].category, FindingCategory::Unknown);
        assert!(findings[0].message.contains("segmentation fault"));
    }

    #[test]
    fn timeout_and_error_steps_are_never_diagnosed() {
        let mut timeout = failed_step("ModuleNotFoundError: No module named 'x'");
        timeout.status = StepStatus::Timeout;
        let mut launch_error = failed_step("no such file or directory");
        launch_error.status = StepStatus::Error;
        let run = RunResult {
            steps: vec![timeout, launch_error],
        };
        assert!(diagnose(&run).is_empty());
    }

    #[test]
    fn diagnose_is_deterministic() {
        let run = run_with("NameError: name 'Query' is not defined\nAssertionError");
        assert_eq!(diagnose(&run), diagnose(&run));
    }

    #[test]
    fn files_hint_deduplicates_in_order() {
        let output = "File \"app/main.py\", line 3\ntests/test_api.py:9: in test_x\nFile \"app/main.py\", line 8";
        assert_eq!(
            files_hint(output),
            vec!["app/main.py".to_string(), "tests/test_api.py".to_string()]
        );
    }
}
