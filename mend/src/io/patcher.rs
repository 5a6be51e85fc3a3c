//! Patch Applier: backup-before-write, stale-plan guard, atomic replace.
//!
//! Failures here are recorded per action, never thrown: a guard mismatch or
//! filesystem error aborts only the offending action and the caller decides
//! what the iteration outcome means.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use similar::TextDiff;
use tracing::{debug, info, warn};

use crate::core::plan::safe_relative;
use crate::core::types::{FixPlan, PatchAction, PatchOp};

/// One backup taken before mutating a file. Never deleted automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub target_file: PathBuf,
    pub backup_path: PathBuf,
    pub timestamp: String,
}

/// A patch action that was refused, with the reason recorded as data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyError {
    pub target_file: PathBuf,
    pub reason: String,
}

/// What one apply pass actually did.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    pub applied: Vec<PathBuf>,
    pub backups: Vec<BackupRecord>,
    pub errors: Vec<ApplyError>,
    /// Unified diff per applied action, in plan order.
    pub diffs: Vec<String>,
}

impl ApplyOutcome {
    pub fn any_applied(&self) -> bool {
        !self.applied.is_empty()
    }
}

/// Apply a fix plan against the project tree.
///
/// Per action: validate the target path, check the current content against
/// what the plan assumed, back the file up once per apply, then write via a
/// temp file and atomic rename. Dry-run plans must never reach this function;
/// the planner and controller short-circuit earlier, so being handed one is a
/// caller bug and an error.
pub fn apply_plan(project_dir: &Path, plan: &FixPlan, backup_root: &Path) -> Result<ApplyOutcome> {
    if plan.dry_run {
        bail!("refusing to apply a dry-run plan");
    }

    let stamp = crate::io::artifacts::timestamp();
    let backup_dir = backup_root.join(&stamp);
    let mut outcome = ApplyOutcome::default();
    let mut backed_up: HashSet<PathBuf> = HashSet::new();

    for action in &plan.actions {
        match apply_action(project_dir, action, &backup_dir, &stamp, &mut backed_up) {
            Ok(Applied { backup, diff }) => {
                info!(target = %action.target_file.display(), rule = %action.rule, "patched");
                if let Some(backup) = backup {
                    outcome.backups.push(backup);
                }
                outcome.diffs.push(diff);
                outcome.applied.push(action.target_file.clone());
            }
            Err(err) => {
                warn!(target = %action.target_file.display(), err = %err, "patch action refused");
                outcome.errors.push(ApplyError {
                    target_file: action.target_file.clone(),
                    reason: format!("{err:#}"),
                });
            }
        }
    }

    Ok(outcome)
}

struct Applied {
    /// `None` when an earlier action in this apply already backed the file up.
    backup: Option<BackupRecord>,
    diff: String,
}

fn apply_action(
    project_dir: &Path,
    action: &PatchAction,
    backup_dir: &Path,
    stamp: &str,
    backed_up: &mut HashSet<PathBuf>,
) -> Result<Applied> {
    let rel = safe_relative(&action.target_file.display().to_string())
        .with_context(|| format!("unsafe target path {}", action.target_file.display()))?;
    let target = project_dir.join(&rel);

    let current = match fs::read_to_string(&target) {
        Ok(content) => Some(content),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => return Err(err).with_context(|| format!("read {}", target.display())),
    };

    check_guard(action, current.as_deref())?;

    let backup = if backed_up.insert(rel.clone()) {
        Some(write_backup(&rel, current.as_deref(), backup_dir, stamp)?)
    } else {
        None
    };

    let old = current.as_deref().unwrap_or("");
    let new = match action.op {
        PatchOp::Delete => "",
        _ => action.content.as_str(),
    };
    let diff = render_diff(&rel, old, new);

    match action.op {
        PatchOp::Delete => {
            fs::remove_file(&target).with_context(|| format!("remove {}", target.display()))?;
        }
        _ => {
            write_atomic(&target, &action.content)?;
        }
    }
    debug!(target = %target.display(), op = ?action.op, "action applied");

    Ok(Applied { backup, diff })
}

/// Stale-plan guard: current on-disk content must match what the plan assumed.
fn check_guard(action: &PatchAction, current: Option<&str>) -> Result<()> {
    match (action.op, &action.expected, current) {
        (PatchOp::Create, _, Some(_)) => bail!("target already exists"),
        (PatchOp::Create, _, None) => Ok(()),
        (_, None, _) => bail!("plan carries no expected content for a non-create action"),
        (_, Some(_), None) => bail!("target no longer exists"),
        (_, Some(expected), Some(current)) if expected != current => {
            bail!("content changed since the plan was generated")
        }
        _ => Ok(()),
    }
}

/// Copy the pre-patch content to the timestamped backup tree. A file with no
/// prior content gets an empty `.absent` marker so restoration is always
/// well-defined.
fn write_backup(
    rel: &Path,
    current: Option<&str>,
    backup_dir: &Path,
    stamp: &str,
) -> Result<BackupRecord> {
    let backup_path = match current {
        Some(_) => backup_dir.join(rel),
        None => {
            let mut name = rel.as_os_str().to_os_string();
            name.push(".absent");
            backup_dir.join(PathBuf::from(name))
        }
    };
    if let Some(parent) = backup_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create backup dir {}", parent.display()))?;
    }
    fs::write(&backup_path, current.unwrap_or(""))
        .with_context(|| format!("write backup {}", backup_path.display()))?;
    Ok(BackupRecord {
        target_file: rel.to_path_buf(),
        backup_path,
        timestamp: stamp.to_string(),
    })
}

fn render_diff(rel: &Path, old: &str, new: &str) -> String {
    let rel = rel.display();
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{rel}"), &format!("b/{rel}"))
        .to_string()
}

/// Write via a temp file in the target directory plus atomic rename, so a
/// crash mid-write never leaves a half-written target.
fn write_atomic(target: &Path, contents: &str) -> Result<()> {
    let parent = target
        .parent()
        .with_context(|| format!("target has no parent {}", target.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    let mut tmp_name = target
        .file_name()
        .with_context(|| format!("target has no file name {}", target.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents).with_context(|| format!("write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, target).with_context(|| format!("replace {}", target.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{PlanStrategy, ScopeSelection};

    fn plan_with(actions: Vec<PatchAction>) -> FixPlan {
        FixPlan {
            scope: ScopeSelection::BackendOnly,
            strategy: PlanStrategy::RuleBased,
            dry_run: false,
            actions,
        }
    }

    fn insert_action(target: &str, expected: &str, content: &str) -> PatchAction {
        PatchAction {
            target_file: PathBuf::from(target),
            op: PatchOp::Insert,
            content: content.to_string(),
            expected: Some(expected.to_string()),
            rationale: "test".to_string(),
            rule: "test".to_string(),
        }
    }

    #[test]
    fn applies_and_backs_up_once_per_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let project = temp.path();
        fs::write(project.join("requirements.txt"), "fastapi\n").expect("seed");

        let plan = plan_with(vec![insert_action(
            "requirements.txt",
            "fastapi\n",
            "fastapi\nhttpx\n",
        )]);
        let backup_root = project.join(".mend/backups");
        let outcome = apply_plan(project, &plan, &backup_root).expect("apply");

        assert_eq!(outcome.applied.len(), 1);
        assert_eq!(outcome.backups.len(), 1);
        assert!(outcome.errors.is_empty());
        assert_eq!(
            fs::read_to_string(project.join("requirements.txt")).expect("read"),
            "fastapi\nhttpx\n"
        );
        // Backup reproduces the exact pre-patch bytes.
        let backup = &outcome.backups[0];
        assert_eq!(
            fs::read_to_string(&backup.backup_path).expect("read backup"),
            "fastapi\n"
        );
        assert!(outcome.diffs[0].contains("+httpx"));
    }

    #[test]
    fn guard_mismatch_records_error_and_leaves_file_alone() {
        let temp = tempfile::tempdir().expect("tempdir");
        let project = temp.path();
        fs::write(project.join("requirements.txt"), "fastapi\npydantic\n").expect("seed");

        let plan = plan_with(vec![insert_action(
            "requirements.txt",
            "fastapi\n",
            "fastapi\nhttpx\n",
        )]);
        let outcome = apply_plan(project, &plan, &project.join("backups")).expect("apply");

        assert!(!outcome.any_applied());
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].reason.contains("content changed"));
        assert!(outcome.backups.is_empty());
        assert_eq!(
            fs::read_to_string(project.join("requirements.txt")).expect("read"),
            "fastapi\npydantic\n"
        );
    }

    #[test]
    fn create_refuses_existing_target() {
        let temp = tempfile::tempdir().expect("tempdir");
        let project = temp.path();
        fs::write(project.join("requirements.txt"), "fastapi\n").expect("seed");

        let plan = plan_with(vec![PatchAction {
            target_file: PathBuf::from("requirements.txt"),
            op: PatchOp::Create,
            content: "httpx\n".to_string(),
            expected: None,
            rationale: "test".to_string(),
            rule: "test".to_string(),
        }]);
        let outcome = apply_plan(project, &plan, &project.join("backups")).expect("apply");
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].reason.contains("already exists"));
    }

    #[test]
    fn create_writes_absent_marker_backup() {
        let temp = tempfile::tempdir().expect("tempdir");
        let project = temp.path();

        let plan = plan_with(vec![PatchAction {
            target_file: PathBuf::from("requirements.txt"),
            op: PatchOp::Create,
            content: "httpx\n".to_string(),
            expected: None,
            rationale: "test".to_string(),
            rule: "test".to_string(),
        }]);
        let outcome = apply_plan(project, &plan, &project.join("backups")).expect("apply");

        assert!(outcome.any_applied());
        let backup = &outcome.backups[0];
        assert!(backup.backup_path.to_string_lossy().ends_with(".absent"));
        assert_eq!(
            fs::read_to_string(&backup.backup_path).expect("read marker"),
            ""
        );
    }

    #[test]
    fn delete_backs_up_then_removes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let project = temp.path();
        fs::write(project.join("stale.py"), "old\n").expect("seed");

        let plan = plan_with(vec![PatchAction {
            target_file: PathBuf::from("stale.py"),
            op: PatchOp::Delete,
            content: String::new(),
            expected: Some("old\n".to_string()),
            rationale: "test".to_string(),
            rule: "test".to_string(),
        }]);
        let outcome = apply_plan(project, &plan, &project.join("backups")).expect("apply");

        assert!(outcome.any_applied());
        assert!(!project.join("stale.py").exists());
        assert_eq!(
            fs::read_to_string(&outcome.backups[0].backup_path).expect("read backup"),
            "old\n"
        );
    }

    #[test]
    fn unsafe_paths_are_refused() {
        let temp = tempfile::tempdir().expect("tempdir");
        let plan = plan_with(vec![insert_action("../escape.txt", "", "x\n")]);
        let outcome = apply_plan(temp.path(), &plan, &temp.path().join("backups")).expect("apply");
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].reason.contains("unsafe"));
    }

    #[test]
    fn dry_run_plan_never_applies() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut plan = plan_with(vec![insert_action("a.txt", "", "x\n")]);
        plan.dry_run = true;
        let err = apply_plan(temp.path(), &plan, &temp.path().join("backups")).unwrap_err();
        assert!(err.to_string().contains("dry-run"));
    }
}
