//! On-disk artifact layout and writers under `.mend/`.
//!
//! Every run, fix, and pipeline invocation leaves human-readable and
//! machine-readable traces here; the core never reads them back. Artifact
//! writes are independent of `RUST_LOG` tracing.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::core::diagnose::files_hint;
use crate::core::types::{
    Finding, FixPlan, PipelineResult, RunResult, RunStatus, StepResult, StepStatus,
};

const FAILURE_PROMPT_TEMPLATE: &str = include_str!("templates/failure_prompt.md");
const ADVISOR_PROMPT_TEMPLATE: &str = include_str!("templates/advisor_prompt.md");

/// Lines of step output scanned for key failure lines.
const TAIL_LINES: usize = 60;
/// Key lines kept per failing step in summaries.
const KEY_LINES: usize = 3;

/// Signatures that mark a line as worth surfacing in a condensed summary.
const KEY_SIGNATURES: &[&str] = &[
    "FAILED",
    "AssertionError",
    "Traceback",
    "short test summary info",
    "ModuleNotFoundError",
    "NameError",
    "ImportError",
    "CORS",
    "404",
];

static TEMPLATES: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.add_template("failure_prompt", FAILURE_PROMPT_TEMPLATE)
        .expect("failure prompt template should be valid");
    env.add_template("advisor_prompt", ADVISOR_PROMPT_TEMPLATE)
        .expect("advisor prompt template should be valid");
    env
});

/// Resolved artifact locations for one project.
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    pub root: PathBuf,
    pub run_logs: PathBuf,
    pub pipeline_logs: PathBuf,
    pub backups: PathBuf,
    pub lock_path: PathBuf,
    pub result_txt: PathBuf,
    pub result_json: PathBuf,
}

impl ArtifactPaths {
    pub fn new(project_dir: &Path) -> Self {
        let root = project_dir.join(".mend");
        Self {
            run_logs: root.join("run_logs"),
            pipeline_logs: root.join("pipeline_logs"),
            backups: root.join("backups"),
            lock_path: root.join("lock"),
            result_txt: root.join("result.txt"),
            result_json: root.join("result.json"),
            root,
        }
    }
}

/// Artifact stamp shared by all files of one invocation.
pub fn timestamp() -> String {
    chrono::Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Paths written for one run invocation.
#[derive(Debug, Clone)]
pub struct RunArtifacts {
    pub timestamp: String,
    pub log_path: PathBuf,
    pub summary_path: PathBuf,
    pub json_summary_path: Option<PathBuf>,
    pub prompt_path: Option<PathBuf>,
}

/// Write the raw log, bounded summary, optional JSON summary, and (on
/// failure) the failure prompt for one run.
pub fn write_run_artifacts(
    paths: &ArtifactPaths,
    project_dir: &Path,
    command: &str,
    run: &RunResult,
    json_summary: bool,
) -> Result<RunArtifacts> {
    let stamp = timestamp();
    fs::create_dir_all(&paths.run_logs)
        .with_context(|| format!("create {}", paths.run_logs.display()))?;

    let log_path = paths.run_logs.join(format!("run_{stamp}.log"));
    write_text(&log_path, &render_run_log(project_dir, &stamp, run))?;

    let summary_path = paths.run_logs.join(format!("run_{stamp}.summary.txt"));
    write_text(
        &summary_path,
        &render_run_summary(project_dir, &stamp, command, run),
    )?;

    let json_summary_path = if json_summary {
        let path = paths.run_logs.join(format!("run_{stamp}.summary.json"));
        let payload = json!({
            "meta": {
                "project_dir": project_dir.display().to_string(),
                "timestamp": stamp,
                "command": command,
                "log_path": log_path.display().to_string(),
                "summary_path": summary_path.display().to_string(),
            },
            "status": run.status(),
            "steps": &run.steps,
        });
        write_json(&path, &payload)?;
        Some(path)
    } else {
        None
    };

    let prompt_path = if run.status() == RunStatus::Fail {
        let path = paths.run_logs.join(format!("run_{stamp}.prompt.md"));
        write_text(&path, &render_failure_prompt(command, run)?)?;
        Some(path)
    } else {
        None
    };

    debug!(log = %log_path.display(), "run artifacts written");
    Ok(RunArtifacts {
        timestamp: stamp,
        log_path,
        summary_path,
        json_summary_path,
        prompt_path,
    })
}

/// Paths written for one fix cycle.
#[derive(Debug, Clone)]
pub struct FixArtifacts {
    pub timestamp: String,
    pub plan_json_path: PathBuf,
    pub plan_md_path: PathBuf,
    pub prompt_path: PathBuf,
    pub summary_path: PathBuf,
    pub json_summary_path: PathBuf,
    pub patch_path: Option<PathBuf>,
}

/// Inputs for [`write_fix_artifacts`].
pub struct FixReport<'a> {
    pub project_dir: &'a Path,
    pub command: &'a str,
    pub iteration: u32,
    pub run: &'a RunResult,
    pub run_artifacts: &'a RunArtifacts,
    pub plan: &'a FixPlan,
    pub applied: bool,
    pub exit_code: i32,
    /// Unified diffs of applied actions; `None` when nothing was applied.
    pub diffs: Option<&'a [String]>,
}

/// Write plan (structured + human-readable), failure prompt, summaries, and
/// the unified diff of applied changes for one fix cycle.
pub fn write_fix_artifacts(paths: &ArtifactPaths, report: &FixReport<'_>) -> Result<FixArtifacts> {
    let stamp = timestamp();
    fs::create_dir_all(&paths.run_logs)
        .with_context(|| format!("create {}", paths.run_logs.display()))?;

    let plan_json_path = paths.run_logs.join(format!("fix_{stamp}.plan.json"));
    write_json(&plan_json_path, report.plan)?;

    let plan_md_path = paths.run_logs.join(format!("fix_{stamp}.plan.md"));
    write_text(&plan_md_path, &render_plan_markdown(report))?;

    let prompt_path = paths.run_logs.join(format!("fix_{stamp}.prompt.md"));
    write_text(&prompt_path, &render_failure_prompt(report.command, report.run)?)?;

    let summary_path = paths.run_logs.join(format!("fix_{stamp}.summary.txt"));
    write_text(&summary_path, &render_fix_summary(report, &stamp))?;

    let json_summary_path = paths.run_logs.join(format!("fix_{stamp}.summary.json"));
    let payload = json!({
        "meta": {
            "project_dir": report.project_dir.display().to_string(),
            "timestamp": stamp,
            "command": report.command,
            "iteration": report.iteration,
            "dry_run": report.plan.dry_run,
            "applied": report.applied,
            "exit_code": report.exit_code,
        },
        "run": {
            "status": report.run.status(),
            "log_path": report.run_artifacts.log_path.display().to_string(),
            "summary_path": report.run_artifacts.summary_path.display().to_string(),
        },
        "plan": report.plan,
    });
    write_json(&json_summary_path, &payload)?;

    let patch_path = if let Some(diffs) = report.diffs {
        let path = paths.run_logs.join(format!("fix_{stamp}.patch.diff"));
        write_text(&path, &diffs.join("\n"))?;
        Some(path)
    } else {
        None
    };

    Ok(FixArtifacts {
        timestamp: stamp,
        plan_json_path,
        plan_md_path,
        prompt_path,
        summary_path,
        json_summary_path,
        patch_path,
    })
}

/// Write the pipeline log plus human/JSON summaries.
pub fn write_pipeline_artifacts(
    paths: &ArtifactPaths,
    project_dir: &Path,
    result: &PipelineResult,
    iteration_lines: &[String],
) -> Result<()> {
    let stamp = timestamp();
    fs::create_dir_all(&paths.pipeline_logs)
        .with_context(|| format!("create {}", paths.pipeline_logs.display()))?;

    let mut log = vec![
        format!("timestamp: {stamp}"),
        format!("project_dir: {}", project_dir.display()),
    ];
    log.extend(iteration_lines.iter().cloned());
    log.push(format!("final_status: {:?}", result.status));
    write_text(
        &paths.pipeline_logs.join(format!("pipeline_{stamp}.log")),
        &(log.join("\n") + "\n"),
    )?;

    let summary = [
        "1) Pipeline meta:".to_string(),
        format!("- project_dir: {}", project_dir.display()),
        format!("- timestamp: {stamp}"),
        "2) Result:".to_string(),
        format!("- status: {:?}", result.status),
        format!("- iterations: {}", result.iterations),
        format!("- reason: {}", result.reason),
    ];
    write_text(
        &paths
            .pipeline_logs
            .join(format!("pipeline_{stamp}.summary.txt")),
        &(summary.join("\n") + "\n"),
    )?;

    let payload = json!({
        "meta": {
            "project_dir": project_dir.display().to_string(),
            "timestamp": stamp,
        },
        "result": result,
    });
    write_json(
        &paths
            .pipeline_logs
            .join(format!("pipeline_{stamp}.summary.json")),
        &payload,
    )?;
    Ok(())
}

/// Write the final plain-text and structured result documents.
pub fn write_result_documents(paths: &ArtifactPaths, result: &PipelineResult) -> Result<()> {
    fs::create_dir_all(&paths.root).with_context(|| format!("create {}", paths.root.display()))?;
    let text = format!(
        "status: {:?}\niterations: {}\nreason: {}\n",
        result.status, result.iterations, result.reason
    );
    write_text(&paths.result_txt, &text)?;
    write_json(&paths.result_json, result)?;
    Ok(())
}

/// Render the advisor request prompt.
pub fn render_advisor_prompt(
    command: &str,
    run: &RunResult,
    findings: &[Finding],
) -> Result<String> {
    #[derive(Serialize)]
    struct FindingContext {
        category: String,
        scope: String,
        step: String,
        message: String,
    }
    let findings: Vec<FindingContext> = findings
        .iter()
        .map(|finding| FindingContext {
            category: format!("{:?}", finding.category),
            scope: finding.scope.label().to_string(),
            step: finding.step.clone(),
            message: finding.message.clone(),
        })
        .collect();
    let template = TEMPLATES.get_template("advisor_prompt")?;
    let rendered = template.render(context! {
        command => command,
        summary_lines => failure_summary_lines(run),
        findings => findings,
        verify_command => verify_command(run),
    })?;
    Ok(rendered)
}

/// Render the failure prompt document: reproduction command, condensed
/// summary, failure location, fix instructions, completion checklist.
fn render_failure_prompt(command: &str, run: &RunResult) -> Result<String> {
    let output = combined_failing_output(run);
    let digest = FailureDigest::from_output(&output);
    let files = files_hint(&output);
    let file_path = digest
        .file_path
        .or_else(|| files.first().cloned())
        .unwrap_or_else(|| "needs investigation".to_string());

    let template = TEMPLATES.get_template("failure_prompt")?;
    let rendered = template.render(context! {
        command => command,
        summary_lines => failure_summary_lines(run),
        test_name => digest.test_name.unwrap_or_else(|| "needs investigation".to_string()),
        file_path => file_path,
        stack_top => or_placeholder(digest.stack_top, "(no stack trace top)"),
        stack_bottom => or_placeholder(digest.stack_bottom, "(no stack trace bottom)"),
        verify_command => verify_command(run),
    })?;
    Ok(rendered)
}

fn or_placeholder(lines: Vec<String>, placeholder: &str) -> String {
    if lines.is_empty() {
        placeholder.to_string()
    } else {
        lines.join("\n")
    }
}

/// Failure location digest extracted from captured output.
struct FailureDigest {
    test_name: Option<String>,
    file_path: Option<String>,
    stack_top: Vec<String>,
    stack_bottom: Vec<String>,
}

impl FailureDigest {
    fn from_output(output: &str) -> Self {
        let lines: Vec<&str> = output.lines().collect();
        let mut test_name = None;
        let mut file_path = None;

        for line in &lines {
            if let Some(rest) = line
                .strip_prefix("FAILED ")
                .or_else(|| line.strip_prefix("ERROR "))
            {
                let test_id = rest.split(" - ").next().unwrap_or(rest).trim().to_string();
                file_path = Some(
                    test_id
                        .split_once("::")
                        .map(|(file, _)| file.to_string())
                        .unwrap_or_else(|| test_id.clone()),
                );
                test_name = Some(test_id);
                break;
            }
        }
        if file_path.is_none() {
            file_path = files_hint(output).into_iter().next();
        }

        let trace_idx = lines.iter().position(|line| line.contains("Traceback"));
        let stack_top = trace_idx
            .map(|idx| {
                lines[idx..(idx + 6).min(lines.len())]
                    .iter()
                    .map(|line| line.to_string())
                    .collect()
            })
            .unwrap_or_default();
        let stack_bottom = lines
            .iter()
            .rev()
            .take(6)
            .rev()
            .map(|line| line.to_string())
            .collect();

        Self {
            test_name,
            file_path,
            stack_top,
            stack_bottom,
        }
    }
}

/// The command a human would rerun to reproduce the first failing step.
fn verify_command(run: &RunResult) -> String {
    run.steps
        .iter()
        .find(|step| !matches!(step.status, StepStatus::Pass | StepStatus::Skipped))
        .map(StepResult::command_line)
        .filter(|line| !line.is_empty())
        .unwrap_or_else(|| "python -m pytest -q".to_string())
}

fn combined_failing_output(run: &RunResult) -> String {
    run.steps
        .iter()
        .filter(|step| !matches!(step.status, StepStatus::Pass | StepStatus::Skipped))
        .map(|step| step.output.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Key lines per failing step: signature hits from the output tail, else the
/// last few lines.
pub fn failure_summary_lines(run: &RunResult) -> Vec<String> {
    let mut lines = Vec::new();
    for step in &run.steps {
        if matches!(step.status, StepStatus::Pass | StepStatus::Skipped) {
            continue;
        }
        for line in key_lines(step) {
            lines.push(format!("{}/{}: {}", step.scope.label(), step.name, line));
        }
    }
    lines
}

fn key_lines(step: &StepResult) -> Vec<String> {
    let tail = step.tail(TAIL_LINES);
    let picked: Vec<String> = tail
        .iter()
        .filter(|line| KEY_SIGNATURES.iter().any(|sig| line.contains(sig)))
        .cloned()
        .collect();
    let picked = if picked.is_empty() { tail } else { picked };
    let start = picked.len().saturating_sub(KEY_LINES);
    picked[start..].to_vec()
}

fn render_run_log(project_dir: &Path, stamp: &str, run: &RunResult) -> String {
    let mut lines = vec![
        "== Run Log ==".to_string(),
        format!("timestamp: {stamp}"),
        format!("project_dir: {}", project_dir.display()),
        String::new(),
    ];
    for step in &run.steps {
        lines.push(format!("== {}/{} ==", step.scope.label(), step.name));
        lines.push(format!("status: {:?}", step.status));
        if !step.command.is_empty() {
            lines.push(format!("cmd: {}", step.command_line()));
        }
        if let Some(code) = step.exit_code {
            lines.push(format!("exit_code: {code}"));
        }
        lines.push(format!("duration_ms: {}", step.duration_ms));
        lines.push("OUTPUT:".to_string());
        lines.push(step.output.clone());
        lines.push(String::new());
    }
    lines.join("\n").trim_end().to_string() + "\n"
}

fn render_run_summary(project_dir: &Path, stamp: &str, command: &str, run: &RunResult) -> String {
    let mut lines = vec![
        "1) Run meta:".to_string(),
        format!("- project_dir: {}", project_dir.display()),
        format!("- timestamp: {stamp}"),
        format!("- command: {command}"),
        "2) Steps:".to_string(),
    ];
    if run.steps.is_empty() {
        lines.push("- (none)".to_string());
    }
    for step in &run.steps {
        lines.push(format!(
            "- {}/{}: {:?} exit_code={} duration_ms={}",
            step.scope.label(),
            step.name,
            step.status,
            step.exit_code
                .map(|code| code.to_string())
                .unwrap_or_else(|| "N/A".to_string()),
            step.duration_ms,
        ));
    }
    lines.push(format!("3) Overall: {:?}", run.status()));

    if run.status() == RunStatus::Fail {
        lines.push("4) Failure summary:".to_string());
        let summary = failure_summary_lines(run);
        if summary.is_empty() {
            lines.push("- check the run log for the failing command".to_string());
        }
        for line in &summary {
            lines.push(format!("- {line}"));
        }
        lines.push("5) Next actions:".to_string());
        for line in summary.iter().take(5) {
            lines.push(format!("- address: {line}"));
        }
        if summary.is_empty() {
            lines.push("- check log output for the failing command".to_string());
        }
    }
    lines.join("\n") + "\n"
}

fn render_plan_markdown(report: &FixReport<'_>) -> String {
    let mut lines = vec![
        format!("- path: {}", report.project_dir.display()),
        format!("- iteration: {}", report.iteration),
        format!("- strategy: {:?}", report.plan.strategy),
        format!("- dry_run: {}", report.plan.dry_run),
        "- actions:".to_string(),
    ];
    if report.plan.actions.is_empty() {
        lines.push("  - (none)".to_string());
    }
    for action in &report.plan.actions {
        lines.push(format!(
            "  - {} [{:?}]: {}",
            action.target_file.display(),
            action.op,
            action.rationale
        ));
    }
    lines.join("\n") + "\n"
}

fn render_fix_summary(report: &FixReport<'_>, stamp: &str) -> String {
    let lines = [
        "1) Fix meta:".to_string(),
        format!("- project_dir: {}", report.project_dir.display()),
        format!("- timestamp: {stamp}"),
        format!("- command: {}", report.command),
        format!("- exit_code: {}", report.exit_code),
        format!("- iteration: {}", report.iteration),
        format!("- dry_run: {}", report.plan.dry_run),
        format!("- applied: {}", report.applied),
        "2) Run summary:".to_string(),
        format!("- run_status: {:?}", report.run.status()),
        format!("- run_log: {}", report.run_artifacts.log_path.display()),
        format!(
            "- run_summary: {}",
            report.run_artifacts.summary_path.display()
        ),
    ];
    lines.join("\n") + "\n"
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

/// Serialize to pretty-printed JSON with trailing newline.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut payload = serde_json::to_string_pretty(value).context("serialize json")?;
    payload.push('\n');
    write_text(path, &payload)
}
