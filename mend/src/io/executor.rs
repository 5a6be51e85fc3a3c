//! Run Executor: drives per-scope verification commands.
//!
//! The [`VerifyRunner`] trait decouples the pipeline from the actual
//! toolchains (pytest, npm). Tests use scripted runners that return
//! predetermined results without spawning processes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::types::{RunResult, Scope, ScopeSelection, StepResult, StepStatus};
use crate::io::process::run_command_with_timeout;

/// Frontend scripts executed when present, in dependency order.
const FRONTEND_SCRIPTS: &[&str] = &["lint", "test", "build"];

/// Parameters for one executor invocation.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Project under verification.
    pub project_dir: PathBuf,
    pub selection: ScopeSelection,
    /// Skip the frontend `npm ci`/`npm install` step.
    pub skip_install: bool,
    /// Per-command wall-clock timeout.
    pub timeout: Duration,
    /// Byte bound on captured output per stream.
    pub output_limit_bytes: usize,
}

/// Abstraction over verification execution backends.
pub trait VerifyRunner {
    fn run(&self, request: &RunRequest) -> Result<RunResult>;
}

/// Real runner invoking the project's toolchains (pytest, npm).
pub struct ToolchainRunner;

impl VerifyRunner for ToolchainRunner {
    /// Selected scopes execute concurrently (they share no data); their step
    /// sequences are merged in fixed backend-then-frontend order so the
    /// resulting [`RunResult`] is deterministic.
    #[instrument(skip_all, fields(project = %request.project_dir.display(), scope = request.selection.label()))]
    fn run(&self, request: &RunRequest) -> Result<RunResult> {
        let scopes = request.selection.scopes();
        info!(scopes = scopes.len(), "starting verification run");

        // `scopes()` lists backend before frontend; joining in that order
        // keeps the merged step sequence deterministic.
        let per_scope: Vec<(Scope, Vec<StepResult>)> = thread::scope(|s| {
            let handles: Vec<_> = scopes
                .iter()
                .map(|&scope| (scope, s.spawn(move || run_scope(scope, request))))
                .collect();
            handles
                .into_iter()
                .map(|(scope, handle)| match handle.join() {
                    Ok(steps) => (scope, steps),
                    Err(_) => (
                        scope,
                        vec![StepResult {
                            scope,
                            name: "scope".to_string(),
                            command: Vec::new(),
                            exit_code: None,
                            status: StepStatus::Error,
                            duration_ms: 0,
                            output: "scope worker panicked".to_string(),
                        }],
                    ),
                })
                .collect()
        });

        let steps: Vec<StepResult> = per_scope
            .into_iter()
            .flat_map(|(_, steps)| steps)
            .collect();
        debug!(steps = steps.len(), "verification run finished");
        Ok(RunResult { steps })
    }
}

fn run_scope(scope: Scope, request: &RunRequest) -> Vec<StepResult> {
    match scope {
        Scope::Backend => backend_steps(request),
        Scope::Frontend => frontend_steps(request),
    }
}

/// Backend verification: pytest against the project root.
///
/// Prefers the project venv's interpreter. `pytest.ini` wins over a bare
/// `tests/` directory; neither means there is nothing to verify.
fn backend_steps(request: &RunRequest) -> Vec<StepResult> {
    let project = &request.project_dir;
    let python = select_python(project);

    let args: Vec<String> = if project.join("pytest.ini").is_file() {
        ["-m", "pytest", "-c", "./pytest.ini", "-q"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    } else if project.join("tests").is_dir() {
        ["-m", "pytest", "-q"].iter().map(|s| s.to_string()).collect()
    } else {
        return vec![StepResult::skipped(
            Scope::Backend,
            "pytest",
            "no pytest.ini or tests/ directory",
        )];
    };

    let mut command = vec![python];
    command.extend(args);
    vec![run_step(Scope::Backend, "pytest", &command, project, request)]
}

fn select_python(project: &Path) -> String {
    let venv_python = project.join(".venv").join("bin").join("python");
    if venv_python.is_file() {
        venv_python.display().to_string()
    } else {
        "python3".to_string()
    }
}

/// Frontend verification: npm install then the `lint`/`test`/`build` scripts
/// declared in `frontend/package.json`, sequentially, stopping at the first
/// step that does not pass (later steps depend on earlier ones).
fn frontend_steps(request: &RunRequest) -> Vec<StepResult> {
    let frontend_dir = request.project_dir.join("frontend");
    let package_json = frontend_dir.join("package.json");

    if !package_json.is_file() {
        return vec![StepResult::skipped(
            Scope::Frontend,
            "frontend",
            "frontend/package.json not found",
        )];
    }
    if !binary_on_path("node") || !binary_on_path("npm") {
        return vec![StepResult::skipped(
            Scope::Frontend,
            "frontend",
            "node/npm not available on PATH",
        )];
    }

    let scripts = match read_package_scripts(&package_json) {
        Ok(scripts) => scripts,
        Err(err) => {
            warn!(err = %err, "unparseable package.json");
            return vec![StepResult {
                scope: Scope::Frontend,
                name: "package.json".to_string(),
                command: Vec::new(),
                exit_code: None,
                status: StepStatus::Fail,
                duration_ms: 0,
                output: format!("package.json parse error: {err:#}"),
            }];
        }
    };

    let wanted: Vec<&str> = FRONTEND_SCRIPTS
        .iter()
        .copied()
        .filter(|name| scripts.contains_key(*name))
        .collect();
    if wanted.is_empty() {
        return vec![StepResult::skipped(
            Scope::Frontend,
            "frontend",
            "no lint/test/build scripts in package.json",
        )];
    }

    let mut steps = Vec::new();
    if !request.skip_install {
        let ci = run_step(
            Scope::Frontend,
            "install",
            &npm(&["ci"]),
            &frontend_dir,
            request,
        );
        let ci_passed = ci.status == StepStatus::Pass;
        steps.push(ci);
        if !ci_passed {
            // `npm ci` requires a lockfile; fall back to a plain install.
            let fallback = run_step(
                Scope::Frontend,
                "install-fallback",
                &npm(&["install"]),
                &frontend_dir,
                request,
            );
            let failed = fallback.status != StepStatus::Pass;
            steps.push(fallback);
            if failed {
                return steps;
            }
        }
    }

    for script in wanted {
        let step = run_step(
            Scope::Frontend,
            script,
            &npm(&["run", script]),
            &frontend_dir,
            request,
        );
        let stop = step.status != StepStatus::Pass;
        steps.push(step);
        if stop {
            break;
        }
    }
    steps
}

fn npm(args: &[&str]) -> Vec<String> {
    let mut command = vec!["npm".to_string()];
    command.extend(args.iter().map(|s| s.to_string()));
    command
}

fn read_package_scripts(package_json: &Path) -> Result<BTreeMap<String, String>> {
    let contents = std::fs::read_to_string(package_json)
        .with_context(|| format!("read {}", package_json.display()))?;
    let value: serde_json::Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse {}", package_json.display()))?;
    let mut scripts = BTreeMap::new();
    if let Some(map) = value.get("scripts").and_then(|v| v.as_object()) {
        for (name, script) in map {
            if let Some(script) = script.as_str() {
                scripts.insert(name.clone(), script.to_string());
            }
        }
    }
    Ok(scripts)
}

/// Run one command and classify the outcome.
///
/// Timeout maps to TIMEOUT; a command that cannot be launched at all maps to
/// ERROR rather than FAIL so later stages never treat it as fixable.
fn run_step(
    scope: Scope,
    name: &str,
    command: &[String],
    cwd: &Path,
    request: &RunRequest,
) -> StepResult {
    let mut cmd = Command::new(&command[0]);
    cmd.args(&command[1..]).current_dir(cwd);

    match run_command_with_timeout(cmd, request.timeout, request.output_limit_bytes) {
        Ok(output) => {
            let status = if output.timed_out {
                StepStatus::Timeout
            } else if output.status.success() {
                StepStatus::Pass
            } else {
                StepStatus::Fail
            };
            StepResult {
                scope,
                name: name.to_string(),
                command: command.to_vec(),
                exit_code: output.status.code(),
                status,
                duration_ms: output.duration.as_millis() as u64,
                output: output.combined(),
            }
        }
        Err(err) => {
            warn!(step = name, err = %err, "command could not be launched");
            StepResult {
                scope,
                name: name.to_string(),
                command: command.to_vec(),
                exit_code: None,
                status: StepStatus::Error,
                duration_ms: 0,
                output: format!("{err:#}"),
            }
        }
    }
}

fn binary_on_path(name: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(name).is_file())
}
