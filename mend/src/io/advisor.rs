//! External advisor fallback for failures the rule table cannot plan for.
//!
//! The advisor is any command the user configures. It receives the rendered
//! failure prompt on stdin, writes a JSON plan to the configured file, and
//! exits zero. The plan is schema-validated and every action is re-checked
//! here (path safety, on-disk content stamped as the apply guard) so a
//! misbehaving advisor can propose nothing worse than a refused action.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::core::plan::safe_relative;
use crate::core::types::{Finding, FixPlan, PatchAction, PatchOp, PlanStrategy, RunResult, ScopeSelection};
use crate::io::artifacts;
use crate::io::config::AdvisorConfig;
use crate::io::process::run_command_with_input;

static PLAN_SCHEMA: LazyLock<jsonschema::Validator> = LazyLock::new(|| {
    let schema: serde_json::Value =
        serde_json::from_str(include_str!("../../schemas/fix_plan.schema.json"))
            .unwrap_or_else(|err| panic!("fix plan schema is not valid JSON: {err}"));
    jsonschema::validator_for(&schema)
        .unwrap_or_else(|err| panic!("fix plan schema does not compile: {err}"))
});

/// Everything an advisor needs to propose a plan for one failing run.
pub struct AdvisorRequest<'a> {
    pub project_dir: &'a Path,
    pub verify_command: &'a str,
    pub run: &'a RunResult,
    pub findings: &'a [Finding],
    pub scope: ScopeSelection,
    pub dry_run: bool,
}

pub trait Advisor {
    /// Propose a plan, or `None` when no advisor is configured or it has
    /// nothing to offer. Errors mean the advisor itself misbehaved.
    fn propose(&self, request: &AdvisorRequest<'_>) -> Result<Option<FixPlan>>;
}

/// Used when no `[advisor]` table is configured.
pub struct NullAdvisor;

impl Advisor for NullAdvisor {
    fn propose(&self, _request: &AdvisorRequest<'_>) -> Result<Option<FixPlan>> {
        Ok(None)
    }
}

/// Runs the configured advisor command and loads its plan file.
pub struct CommandAdvisor {
    config: AdvisorConfig,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandAdvisor {
    pub fn new(config: AdvisorConfig, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            config,
            timeout,
            output_limit_bytes,
        }
    }
}

impl Advisor for CommandAdvisor {
    fn propose(&self, request: &AdvisorRequest<'_>) -> Result<Option<FixPlan>> {
        let prompt =
            artifacts::render_advisor_prompt(request.verify_command, request.run, request.findings)?;

        // The plan round-trip stays inside `.mend/` so invoking an advisor
        // never mutates project files, dry run included.
        let plan_rel = safe_relative(&self.config.plan_file)
            .filter(|rel| rel.starts_with(".mend"))
            .with_context(|| {
                format!(
                    "advisor plan_file must be a relative path under .mend/: {}",
                    self.config.plan_file
                )
            })?;
        let plan_path = request.project_dir.join(&plan_rel);
        if let Some(parent) = plan_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        // A stale plan from a previous invocation must never be mistaken for
        // this one's answer.
        if plan_path.exists() {
            fs::remove_file(&plan_path)
                .with_context(|| format!("remove stale plan {}", plan_path.display()))?;
        }

        let (program, args) = self
            .config
            .command
            .split_first()
            .context("advisor command is empty")?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(request.project_dir);
        info!(command = %self.config.command.join(" "), "invoking advisor");
        let output = run_command_with_input(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .context("run advisor command")?;
        if output.timed_out {
            bail!("advisor command timed out");
        }
        if !output.status.success() {
            bail!(
                "advisor command exited with {:?}: {}",
                output.status.code(),
                output.combined()
            );
        }

        let raw = match fs::read_to_string(&plan_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("advisor wrote no plan file");
                return Ok(None);
            }
            Err(err) => return Err(err).with_context(|| format!("read {}", plan_path.display())),
        };
        let plan = parse_plan(&raw, request)?;
        Ok(Some(plan))
    }
}

#[derive(Deserialize)]
struct RawPlan {
    actions: Vec<RawAction>,
}

#[derive(Deserialize)]
struct RawAction {
    target_file: String,
    op: PatchOp,
    content: String,
    rationale: String,
}

/// Validate and harden the advisor's JSON into a [`FixPlan`].
fn parse_plan(raw: &str, request: &AdvisorRequest<'_>) -> Result<FixPlan> {
    let value: serde_json::Value =
        serde_json::from_str(raw).context("advisor plan is not valid JSON")?;
    if let Err(err) = PLAN_SCHEMA.validate(&value) {
        bail!("advisor plan failed schema validation: {err}");
    }
    let raw_plan: RawPlan = serde_json::from_value(value).context("deserialize advisor plan")?;

    let mut actions = Vec::new();
    for raw_action in raw_plan.actions {
        let Some(rel) = safe_relative(&raw_action.target_file) else {
            warn!(target = %raw_action.target_file, "advisor action dropped, unsafe path");
            continue;
        };
        // Stamp the current on-disk content so the apply-time guard can
        // detect the project changing between planning and applying.
        let expected = match raw_action.op {
            PatchOp::Create => None,
            _ => match fs::read_to_string(request.project_dir.join(&rel)) {
                Ok(current) => Some(current),
                Err(_) => {
                    warn!(target = %rel.display(), "advisor action dropped, target unreadable");
                    continue;
                }
            },
        };
        actions.push(PatchAction {
            target_file: rel,
            op: raw_action.op,
            content: raw_action.content,
            expected,
            rationale: raw_action.rationale,
            rule: "advisor".to_string(),
        });
    }

    Ok(FixPlan {
        scope: request.scope,
        strategy: PlanStrategy::Advisor,
        dry_run: request.dry_run,
        actions,
    })
}
