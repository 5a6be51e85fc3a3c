//! The `run` verb: execute the verification steps once and write artifacts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::core::types::{RunResult, RunStatus, ScopeSelection};
use crate::exit_codes;
use crate::io::artifacts::{self, ArtifactPaths, RunArtifacts};
use crate::io::config::MendConfig;
use crate::io::executor::{RunRequest, ToolchainRunner, VerifyRunner};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub project_dir: PathBuf,
    pub selection: ScopeSelection,
    pub skip_install: bool,
    /// Overrides the configured step timeout when set.
    pub timeout: Option<Duration>,
    pub json_summary: bool,
}

pub fn run_verb(options: &RunOptions) -> Result<i32> {
    let project_dir = resolve_project_dir(&options.project_dir)?;
    let config = MendConfig::load(&project_dir)?;
    let paths = ArtifactPaths::new(&project_dir);

    let command = format!("mend run --path {}", project_dir.display());
    let (run, run_artifacts) = execute_run(
        &ToolchainRunner,
        &paths,
        &project_dir,
        &command,
        options.selection,
        options.skip_install,
        options.timeout.unwrap_or_else(|| config.step_timeout()),
        config.output_limit_bytes,
        options.json_summary,
    )?;

    println!("run: {:?}", run.status());
    println!("summary: {}", run_artifacts.summary_path.display());
    if let Some(prompt) = &run_artifacts.prompt_path {
        println!("failure prompt: {}", prompt.display());
    }

    Ok(match run.status() {
        RunStatus::Pass => exit_codes::OK,
        RunStatus::Fail if environment_failure(&run) => exit_codes::ENVIRONMENT,
        RunStatus::Fail => exit_codes::VERIFY_FAILED,
    })
}

/// A run that failed only through launch errors (missing interpreter, npm not
/// runnable) is an environment problem, not a verification failure.
fn environment_failure(run: &RunResult) -> bool {
    use crate::core::types::StepStatus;
    let mut saw_error = false;
    for step in &run.steps {
        match step.status {
            StepStatus::Error => saw_error = true,
            StepStatus::Pass | StepStatus::Skipped => {}
            StepStatus::Fail | StepStatus::Timeout => return false,
        }
    }
    saw_error
}

/// Run the verification steps and write the run artifacts. Shared by the
/// `run`, `fix`, and `pipeline` verbs.
#[allow(clippy::too_many_arguments)]
pub fn execute_run<R: VerifyRunner + ?Sized>(
    runner: &R,
    paths: &ArtifactPaths,
    project_dir: &Path,
    command: &str,
    selection: ScopeSelection,
    skip_install: bool,
    timeout: Duration,
    output_limit_bytes: usize,
    json_summary: bool,
) -> Result<(RunResult, RunArtifacts)> {
    let request = RunRequest {
        project_dir: project_dir.to_path_buf(),
        selection,
        skip_install,
        timeout,
        output_limit_bytes,
    };
    let run = runner.run(&request)?;
    let run_artifacts =
        artifacts::write_run_artifacts(paths, project_dir, command, &run, json_summary)?;
    info!(status = ?run.status(), steps = run.steps.len(), "verification run finished");
    Ok((run, run_artifacts))
}

/// The project directory must exist before any verb runs; a bad path is a
/// configuration error, not a verification failure.
pub fn resolve_project_dir(path: &Path) -> Result<PathBuf> {
    if !path.is_dir() {
        bail!("project directory does not exist: {}", path.display());
    }
    path.canonicalize()
        .with_context(|| format!("canonicalize {}", path.display()))
}
