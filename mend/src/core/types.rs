//! Shared deterministic types for the run/diagnose/fix loop.
//!
//! These types define stable contracts between core components. They should
//! not depend on external state or I/O and must remain deterministic across
//! runs.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A named verification domain with its own command set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Backend,
    Frontend,
}

impl Scope {
    pub fn label(self) -> &'static str {
        match self {
            Scope::Backend => "backend",
            Scope::Frontend => "frontend",
        }
    }
}

/// Which scopes a run or fix invocation covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScopeSelection {
    All,
    BackendOnly,
    FrontendOnly,
}

impl ScopeSelection {
    /// Scopes covered by this selection, in merge order.
    pub fn scopes(self) -> &'static [Scope] {
        match self {
            ScopeSelection::All => &[Scope::Backend, Scope::Frontend],
            ScopeSelection::BackendOnly => &[Scope::Backend],
            ScopeSelection::FrontendOnly => &[Scope::Frontend],
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ScopeSelection::All => "all",
            ScopeSelection::BackendOnly => "backend",
            ScopeSelection::FrontendOnly => "frontend",
        }
    }
}

/// Outcome of one invoked verification command.
///
/// `Error` (the command could not be launched) and `Timeout` are distinct from
/// `Fail` because they are not fixable: later stages must not attempt to
/// repair an absent interpreter or a hung process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StepStatus {
    Pass,
    Fail,
    Error,
    Timeout,
    Skipped,
}

impl StepStatus {
    /// Only plain verification failures feed the diagnostic engine.
    pub fn is_fixable(self) -> bool {
        matches!(self, StepStatus::Fail)
    }
}

/// Result of one invoked command. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub scope: Scope,
    /// Step name within the scope (e.g. `pytest`, `install`, `lint`).
    pub name: String,
    pub command: Vec<String>,
    /// `None` when the command never produced an exit code (ERROR/TIMEOUT/SKIPPED).
    pub exit_code: Option<i32>,
    pub status: StepStatus,
    pub duration_ms: u64,
    /// Combined stdout/stderr, bounded by the capture byte limit.
    pub output: String,
}

impl StepResult {
    /// A step that never ran, with the reason in `output`.
    pub fn skipped(scope: Scope, name: &str, reason: &str) -> Self {
        Self {
            scope,
            name: name.to_string(),
            command: Vec::new(),
            exit_code: None,
            status: StepStatus::Skipped,
            duration_ms: 0,
            output: reason.to_string(),
        }
    }

    /// Last `max_lines` lines of captured output.
    pub fn tail(&self, max_lines: usize) -> Vec<String> {
        let lines: Vec<&str> = self.output.lines().collect();
        let start = lines.len().saturating_sub(max_lines);
        lines[start..].iter().map(|line| line.to_string()).collect()
    }

    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }
}

/// Aggregate status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Pass,
    Fail,
}

/// Ordered step results for one executor invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub steps: Vec<StepResult>,
}

impl RunResult {
    /// FAIL if any step is neither PASS nor SKIPPED.
    pub fn status(&self) -> RunStatus {
        let failed = self
            .steps
            .iter()
            .any(|step| !matches!(step.status, StepStatus::Pass | StepStatus::Skipped));
        if failed { RunStatus::Fail } else { RunStatus::Pass }
    }

    /// Steps whose failure the diagnostic engine may classify.
    pub fn fixable_steps(&self) -> impl Iterator<Item = &StepResult> {
        self.steps.iter().filter(|step| step.status.is_fixable())
    }

    /// Steps that failed for reasons no fix can address (launch error, timeout).
    pub fn unfixable_steps(&self) -> impl Iterator<Item = &StepResult> {
        self.steps
            .iter()
            .filter(|step| matches!(step.status, StepStatus::Error | StepStatus::Timeout))
    }
}

/// Closed set of failure classes the diagnostic engine can assign.
///
/// The rule table in [`crate::core::diagnose`] is evaluated in declaration
/// order; that order is part of the contract and breaks ties between
/// overlapping signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FindingCategory {
    MissingDependency,
    MissingImport,
    CorsMisconfigured,
    RouteNotRegistered,
    AssertionFailure,
    LintViolation,
    Unknown,
}

/// Failure location extracted from captured output, when available.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub file: Option<String>,
    pub line: Option<u32>,
    pub test: Option<String>,
}

/// Structured classification of one observed failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub category: FindingCategory,
    pub message: String,
    /// Rule-specific extraction (module name, undefined symbol, ...).
    pub detail: Option<String>,
    pub location: Option<Location>,
    /// Source step reference.
    pub scope: Scope,
    pub step: String,
}

/// File mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Create,
    Replace,
    Insert,
    Delete,
}

/// One concrete, reversible file mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchAction {
    /// Project-relative target path.
    pub target_file: PathBuf,
    pub op: PatchOp,
    /// Full post-patch file content (empty for `Delete`).
    pub content: String,
    /// Full file content the plan assumed at generation time.
    /// `None` only for `Create` (the file must not exist yet).
    pub expected: Option<String>,
    /// Which finding motivated this action.
    pub rationale: String,
    /// Name of the planner rule (or `advisor`) that produced it.
    pub rule: String,
}

/// How a fix plan was generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlanStrategy {
    RuleBased,
    Advisor,
}

/// Ordered patch actions for one iteration, plus generation metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixPlan {
    pub scope: ScopeSelection,
    pub strategy: PlanStrategy,
    pub dry_run: bool,
    pub actions: Vec<PatchAction>,
}

impl FixPlan {
    pub fn empty(scope: ScopeSelection, strategy: PlanStrategy, dry_run: bool) -> Self {
        Self {
            scope,
            strategy,
            dry_run,
            actions: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// One pipeline iteration: the run it observed and what was planned/applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationRecord {
    /// 1-indexed iteration number.
    pub index: u32,
    pub run: RunResult,
    pub plan: Option<FixPlan>,
    pub applied: bool,
}

/// Terminal pipeline status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PipelineStatus {
    Success,
    Partial,
    Failed,
    #[serde(rename = "NO_CHANGE")]
    NoChange,
}

/// Written once at loop exit. Immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub status: PipelineStatus,
    pub iterations: u32,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(scope: Scope, status: StepStatus) -> StepResult {
        StepResult {
            scope,
            name: "t".to_string(),
            command: vec!["true".to_string()],
            exit_code: Some(0),
            status,
            duration_ms: 1,
            output: String::new(),
        }
    }

    #[test]
    fn run_status_passes_with_only_pass_and_skip() {
        let run = RunResult {
            steps: vec![
                step(Scope::Backend, StepStatus::Pass),
                step(Scope::Frontend, StepStatus::Skipped),
            ],
        };
        assert_eq!(run.status(), RunStatus::Pass);
    }

    #[test]
    fn run_status_fails_on_error_and_timeout() {
        for status in [StepStatus::Fail, StepStatus::Error, StepStatus::Timeout] {
            let run = RunResult {
                steps: vec![step(Scope::Backend, status)],
            };
            assert_eq!(run.status(), RunStatus::Fail);
        }
    }

    #[test]
    fn only_plain_failures_are_fixable() {
        let run = RunResult {
            steps: vec![
                step(Scope::Backend, StepStatus::Fail),
                step(Scope::Backend, StepStatus::Timeout),
                step(Scope::Frontend, StepStatus::Error),
            ],
        };
        assert_eq!(run.fixable_steps().count(), 1);
        assert_eq!(run.unfixable_steps().count(), 2);
    }

    #[test]
    fn tail_returns_last_lines() {
        let mut result = step(Scope::Backend, StepStatus::Fail);
        result.output = "one\ntwo\nthree\n".to_string();
        assert_eq!(result.tail(2), vec!["two".to_string(), "three".to_string()]);
    }
}
