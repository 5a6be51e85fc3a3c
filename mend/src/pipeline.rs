//! The pipeline controller: bounded run → fix → run convergence loop.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::core::types::{
    IterationRecord, PipelineResult, PipelineStatus, RunStatus, ScopeSelection, StepResult,
};
use crate::exit_codes;
use crate::fix::{CycleConfig, advisor_from_config, fix_cycle};
use crate::io::advisor::Advisor;
use crate::io::artifacts::{self, ArtifactPaths};
use crate::io::config::MendConfig;
use crate::io::executor::{ToolchainRunner, VerifyRunner};
use crate::io::lock::ProjectLock;
use crate::run::resolve_project_dir;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub project_dir: PathBuf,
    pub selection: ScopeSelection,
    /// Mutate the project between runs. Without it the first failing
    /// iteration stops at its dry-run plan.
    pub apply: bool,
    pub max_iterations: Option<u32>,
    pub timeout: Option<Duration>,
    pub use_advisor: bool,
    pub skip_install: bool,
}

/// Resolved settings for one pipeline invocation.
pub struct PipelineConfig<'a> {
    pub project_dir: &'a Path,
    pub paths: &'a ArtifactPaths,
    pub selection: ScopeSelection,
    pub apply: bool,
    pub max_iterations: u32,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub use_advisor: bool,
    pub skip_install: bool,
}

pub struct PipelineOutcome {
    pub result: PipelineResult,
    pub records: Vec<IterationRecord>,
}

/// Drive the loop until the run passes, no progress is possible, or the
/// iteration cap is reached. Every decision is recorded as an
/// [`IterationRecord`]; the record count never exceeds the cap.
pub fn run_pipeline(
    runner: &dyn VerifyRunner,
    advisor: &dyn Advisor,
    cfg: &PipelineConfig<'_>,
) -> Result<PipelineOutcome> {
    let command = format!("mend pipeline --path {}", cfg.project_dir.display());
    let mut records: Vec<IterationRecord> = Vec::new();

    let result = loop {
        let index = records.len() as u32 + 1;
        info!(iteration = index, max = cfg.max_iterations, "pipeline iteration");

        let cycle_cfg = CycleConfig {
            project_dir: cfg.project_dir,
            paths: cfg.paths,
            command: &command,
            selection: cfg.selection,
            skip_install: cfg.skip_install,
            apply: cfg.apply,
            timeout: cfg.timeout,
            output_limit_bytes: cfg.output_limit_bytes,
            use_advisor: cfg.use_advisor,
            iteration: index,
        };
        let cycle = fix_cycle(runner, advisor, &cycle_cfg)?;
        let applied = cycle.applied_count() > 0;
        records.push(IterationRecord {
            index,
            run: cycle.run.clone(),
            plan: cycle.plan.clone(),
            applied,
        });

        if cycle.run.status() == RunStatus::Pass {
            break PipelineResult {
                status: PipelineStatus::Success,
                iterations: index,
                reason: "verification passed".to_string(),
            };
        }

        // Only FAIL steps are fixable; a run that failed purely through
        // timeouts or launch errors cannot converge.
        if cycle.run.fixable_steps().next().is_none() {
            break PipelineResult {
                status: PipelineStatus::Failed,
                iterations: index,
                reason: unfixable_reason(cycle.run.unfixable_steps().next()),
            };
        }

        let plan_is_empty = cycle.plan.as_ref().is_none_or(|plan| plan.is_empty());

        if !cfg.apply {
            break PipelineResult {
                status: PipelineStatus::Partial,
                iterations: index,
                reason: "dry run stopped before applying the plan".to_string(),
            };
        }

        if plan_is_empty {
            break PipelineResult {
                status: PipelineStatus::Failed,
                iterations: index,
                reason: "no applicable fix for the findings".to_string(),
            };
        }

        if !applied {
            break PipelineResult {
                status: PipelineStatus::NoChange,
                iterations: index,
                reason: "every patch action was refused by the content guard".to_string(),
            };
        }

        if index >= cfg.max_iterations {
            break PipelineResult {
                status: PipelineStatus::Failed,
                iterations: index,
                reason: format!("iteration cap reached after {index} iteration(s)"),
            };
        }
    };

    info!(status = ?result.status, iterations = result.iterations, "pipeline finished");
    Ok(PipelineOutcome { result, records })
}

fn unfixable_reason(step: Option<&StepResult>) -> String {
    match step {
        Some(step) => format!(
            "step {}/{} ended with {:?} and cannot be fixed",
            step.scope.label(),
            step.name,
            step.status
        ),
        None => "verification failed with no fixable step".to_string(),
    }
}

fn iteration_lines(records: &[IterationRecord]) -> Vec<String> {
    records
        .iter()
        .map(|record| {
            format!(
                "iteration {}: run={:?} plan_actions={} applied={}",
                record.index,
                record.run.status(),
                record.plan.as_ref().map_or(0, |plan| plan.actions.len()),
                record.applied,
            )
        })
        .collect()
}

pub fn pipeline_verb(options: &PipelineOptions) -> Result<i32> {
    let project_dir = resolve_project_dir(&options.project_dir)?;
    let config = MendConfig::load(&project_dir)?;
    let paths = ArtifactPaths::new(&project_dir);
    let timeout = options.timeout.unwrap_or_else(|| config.step_timeout());

    // The whole invocation holds the lock; a dry run still writes artifacts.
    let _lock = ProjectLock::acquire(&paths.lock_path).context("acquire project lock")?;

    let max_iterations = options.max_iterations.unwrap_or(config.max_iterations);
    if max_iterations == 0 {
        anyhow::bail!("--max-iterations must be positive");
    }

    let advisor = advisor_from_config(&config, options.use_advisor, timeout)?;
    let cfg = PipelineConfig {
        project_dir: &project_dir,
        paths: &paths,
        selection: options.selection,
        apply: options.apply,
        max_iterations,
        timeout,
        output_limit_bytes: config.output_limit_bytes,
        use_advisor: options.use_advisor,
        skip_install: options.skip_install,
    };
    let outcome = run_pipeline(&ToolchainRunner, advisor.as_ref(), &cfg)?;

    artifacts::write_pipeline_artifacts(
        &paths,
        &project_dir,
        &outcome.result,
        &iteration_lines(&outcome.records),
    )?;
    artifacts::write_result_documents(&paths, &outcome.result)?;

    println!(
        "pipeline: {:?} after {} iteration(s): {}",
        outcome.result.status, outcome.result.iterations, outcome.result.reason
    );
    println!("result: {}", paths.result_txt.display());

    Ok(match outcome.result.status {
        PipelineStatus::Success => exit_codes::OK,
        _ => exit_codes::VERIFY_FAILED,
    })
}
