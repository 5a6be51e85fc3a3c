//! The `fix` verb: one run → diagnose → plan → (apply) cycle.
//!
//! The pipeline verb loops over the same cycle; everything here is written so
//! both callers share one code path.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::core::diagnose::diagnose;
use crate::core::plan::{PlanContext, build_plan, safe_relative};
use crate::core::types::{Finding, FixPlan, RunResult, RunStatus, ScopeSelection};
use crate::exit_codes;
use crate::io::advisor::{Advisor, AdvisorRequest, CommandAdvisor, NullAdvisor};
use crate::io::artifacts::{self, ArtifactPaths, FixArtifacts, FixReport, RunArtifacts};
use crate::io::config::MendConfig;
use crate::io::executor::{ToolchainRunner, VerifyRunner};
use crate::io::lock::ProjectLock;
use crate::io::patcher::{ApplyOutcome, apply_plan};
use crate::run::{execute_run, resolve_project_dir};

#[derive(Debug, Clone)]
pub struct FixOptions {
    pub project_dir: PathBuf,
    pub selection: ScopeSelection,
    /// Mutate the project. Without it the cycle stops at a dry-run plan.
    pub apply: bool,
    pub timeout: Option<Duration>,
    pub use_advisor: bool,
    pub skip_install: bool,
}

/// Everything one cycle needs, resolved from options and config.
pub struct CycleConfig<'a> {
    pub project_dir: &'a Path,
    pub paths: &'a ArtifactPaths,
    pub command: &'a str,
    pub selection: ScopeSelection,
    pub skip_install: bool,
    pub apply: bool,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub use_advisor: bool,
    /// 1-indexed; the standalone `fix` verb always passes 1.
    pub iteration: u32,
}

/// What one cycle produced. `plan` and `artifacts` are `None` only when the
/// run passed and no fix was needed.
pub struct CycleOutcome {
    pub run: RunResult,
    pub run_artifacts: RunArtifacts,
    pub findings: Vec<Finding>,
    pub plan: Option<FixPlan>,
    pub apply: Option<ApplyOutcome>,
    pub artifacts: Option<FixArtifacts>,
}

impl CycleOutcome {
    pub fn applied_count(&self) -> usize {
        self.apply
            .as_ref()
            .map(|outcome| outcome.applied.len())
            .unwrap_or(0)
    }
}

/// Reads project files for the pure planner.
struct DiskContext<'a> {
    project_dir: &'a Path,
}

impl PlanContext for DiskContext<'_> {
    fn read(&self, rel: &Path) -> Option<String> {
        let rel = safe_relative(&rel.display().to_string())?;
        fs::read_to_string(self.project_dir.join(rel)).ok()
    }
}

/// Run once, diagnose failures, build a plan, and apply it when allowed.
pub fn fix_cycle(
    runner: &dyn VerifyRunner,
    advisor: &dyn Advisor,
    cfg: &CycleConfig<'_>,
) -> Result<CycleOutcome> {
    let (run, run_artifacts) = execute_run(
        runner,
        cfg.paths,
        cfg.project_dir,
        cfg.command,
        cfg.selection,
        cfg.skip_install,
        cfg.timeout,
        cfg.output_limit_bytes,
        true,
    )?;

    if run.status() == RunStatus::Pass {
        info!(iteration = cfg.iteration, "run passed, nothing to fix");
        return Ok(CycleOutcome {
            run,
            run_artifacts,
            findings: Vec::new(),
            plan: None,
            apply: None,
            artifacts: None,
        });
    }

    let findings = diagnose(&run);
    info!(iteration = cfg.iteration, findings = findings.len(), "run failed, planning");

    let ctx = DiskContext {
        project_dir: cfg.project_dir,
    };
    let dry_run = !cfg.apply;
    let mut plan = build_plan(&findings, &ctx, cfg.selection, dry_run);

    if plan.is_empty() && cfg.use_advisor {
        let request = AdvisorRequest {
            project_dir: cfg.project_dir,
            verify_command: cfg.command,
            run: &run,
            findings: &findings,
            scope: cfg.selection,
            dry_run,
        };
        match advisor.propose(&request) {
            Ok(Some(proposed)) if !proposed.is_empty() => {
                info!(actions = proposed.actions.len(), "advisor proposed a plan");
                plan = proposed;
            }
            Ok(_) => info!("advisor proposed nothing"),
            // A broken advisor degrades to an empty plan; the failure prompt
            // is still written for manual follow-up.
            Err(err) => warn!(err = %format!("{err:#}"), "advisor failed"),
        }
    }

    let apply = if cfg.apply && !plan.is_empty() {
        Some(apply_plan(cfg.project_dir, &plan, &cfg.paths.backups)?)
    } else {
        None
    };
    let applied = apply
        .as_ref()
        .is_some_and(|outcome| outcome.any_applied());

    let diffs = apply
        .as_ref()
        .filter(|outcome| outcome.any_applied())
        .map(|outcome| outcome.diffs.as_slice());
    let fix_artifacts = artifacts::write_fix_artifacts(
        cfg.paths,
        &FixReport {
            project_dir: cfg.project_dir,
            command: cfg.command,
            iteration: cfg.iteration,
            run: &run,
            run_artifacts: &run_artifacts,
            plan: &plan,
            applied,
            exit_code: exit_codes::VERIFY_FAILED,
            diffs,
        },
    )?;

    Ok(CycleOutcome {
        run,
        run_artifacts,
        findings,
        plan: Some(plan),
        apply,
        artifacts: Some(fix_artifacts),
    })
}

/// Build the advisor collaborator from config. Requesting the advisor without
/// configuring one is a configuration error.
pub fn advisor_from_config(
    config: &MendConfig,
    use_advisor: bool,
    timeout: Duration,
) -> Result<Box<dyn Advisor>> {
    if !use_advisor {
        return Ok(Box::new(NullAdvisor));
    }
    let Some(advisor_config) = config.advisor.clone() else {
        bail!("--advisor requires an [advisor] table in .mend/config.toml");
    };
    Ok(Box::new(CommandAdvisor::new(
        advisor_config,
        timeout,
        config.output_limit_bytes,
    )))
}

pub fn fix_verb(options: &FixOptions) -> Result<i32> {
    let project_dir = resolve_project_dir(&options.project_dir)?;
    let config = MendConfig::load(&project_dir)?;
    let paths = ArtifactPaths::new(&project_dir);
    let timeout = options.timeout.unwrap_or_else(|| config.step_timeout());

    // Mutating invocations are serialized per project.
    let _lock = if options.apply {
        Some(
            ProjectLock::acquire(&paths.lock_path)
                .context("acquire project lock")?,
        )
    } else {
        None
    };

    let advisor = advisor_from_config(&config, options.use_advisor, timeout)?;
    let command = format!("mend fix --path {}", project_dir.display());
    let cfg = CycleConfig {
        project_dir: &project_dir,
        paths: &paths,
        command: &command,
        selection: options.selection,
        skip_install: options.skip_install,
        apply: options.apply,
        timeout,
        output_limit_bytes: config.output_limit_bytes,
        use_advisor: options.use_advisor,
        iteration: 1,
    };
    let outcome = fix_cycle(&ToolchainRunner, advisor.as_ref(), &cfg)?;

    match outcome.run.status() {
        RunStatus::Pass => {
            println!("fix: run passed, nothing to do");
            Ok(exit_codes::OK)
        }
        RunStatus::Fail => {
            let plan = outcome.plan.as_ref().map_or(0, |plan| plan.actions.len());
            println!(
                "fix: run failed, {} planned action(s), {} applied",
                plan,
                outcome.applied_count()
            );
            if let Some(artifacts) = &outcome.artifacts {
                println!("plan: {}", artifacts.plan_md_path.display());
                println!("prompt: {}", artifacts.prompt_path.display());
            }
            Ok(exit_codes::VERIFY_FAILED)
        }
    }
}
