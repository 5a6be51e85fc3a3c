//! End-to-end fix cycles against a scripted runner and a real tempdir project.

use std::fs;
use std::path::Path;
use std::time::Duration;

use mend::core::types::{PlanStrategy, RunStatus, ScopeSelection};
use mend::fix::{CycleConfig, fix_cycle};
use mend::io::advisor::NullAdvisor;
use mend::io::artifacts::ArtifactPaths;
use mend::test_support::{ScriptedRunner, failing_run, passing_run};

const MODULE_NOT_FOUND: &str =
    "Traceback (most recent call last):\n  File \"app/main.py\", line 2, in <module>\nModuleNotFoundError: No module named 'httpx'";

fn cycle_config<'a>(
    project_dir: &'a Path,
    paths: &'a ArtifactPaths,
    apply: bool,
) -> CycleConfig<'a> {
    CycleConfig {
        project_dir,
        paths,
        command: "mend fix --path .",
        selection: ScopeSelection::BackendOnly,
        skip_install: false,
        apply,
        timeout: Duration::from_secs(30),
        output_limit_bytes: 64 * 1024,
        use_advisor: false,
        iteration: 1,
    }
}

#[test]
fn dry_run_plans_without_mutating_anything() {
    let temp = tempfile::tempdir().expect("tempdir");
    let project = temp.path();
    fs::write(project.join("requirements.txt"), "fastapi\n").expect("seed");
    let paths = ArtifactPaths::new(project);

    let runner = ScriptedRunner::new(vec![failing_run(MODULE_NOT_FOUND)]);
    let outcome =
        fix_cycle(&runner, &NullAdvisor, &cycle_config(project, &paths, false)).expect("cycle");

    let plan = outcome.plan.expect("plan");
    assert!(plan.dry_run);
    assert_eq!(plan.strategy, PlanStrategy::RuleBased);
    assert_eq!(plan.actions.len(), 1);
    assert_eq!(
        plan.actions[0].target_file,
        std::path::PathBuf::from("requirements.txt")
    );

    // Zero mutation: the project file is untouched and no backups exist.
    assert_eq!(
        fs::read_to_string(project.join("requirements.txt")).expect("read"),
        "fastapi\n"
    );
    assert!(!paths.backups.exists());
    assert!(outcome.apply.is_none());

    // The plan and failure prompt artifacts were still written.
    let artifacts = outcome.artifacts.expect("artifacts");
    assert!(artifacts.plan_json_path.is_file());
    assert!(artifacts.prompt_path.is_file());
}

#[test]
fn apply_fixes_missing_dependency_with_backup_and_diff() {
    let temp = tempfile::tempdir().expect("tempdir");
    let project = temp.path();
    fs::write(project.join("requirements.txt"), "fastapi\n").expect("seed");
    let paths = ArtifactPaths::new(project);

    let runner = ScriptedRunner::new(vec![failing_run(MODULE_NOT_FOUND)]);
    let outcome =
        fix_cycle(&runner, &NullAdvisor, &cycle_config(project, &paths, true)).expect("cycle");

    assert_eq!(
        fs::read_to_string(project.join("requirements.txt")).expect("read"),
        "fastapi\nhttpx\n"
    );

    let apply = outcome.apply.expect("apply outcome");
    assert_eq!(apply.applied.len(), 1);
    assert_eq!(apply.backups.len(), 1);
    // Backup preserves the pre-patch bytes exactly.
    assert_eq!(
        fs::read_to_string(&apply.backups[0].backup_path).expect("read backup"),
        "fastapi\n"
    );

    let artifacts = outcome.artifacts.expect("artifacts");
    let patch_path = artifacts.patch_path.expect("patch diff");
    let diff = fs::read_to_string(patch_path).expect("read diff");
    assert!(diff.contains("+httpx"));
}

#[test]
fn apply_registers_router_for_404_route() {
    let temp = tempfile::tempdir().expect("tempdir");
    let project = temp.path();
    fs::create_dir_all(project.join("app/api")).expect("mkdir");
    fs::write(
        project.join("app/api/router.py"),
        "from fastapi import APIRouter\nfrom app.api.routers.health import router as health_router\n\napi_router = APIRouter()\napi_router.include_router(health_router)\n",
    )
    .expect("seed");
    let paths = ArtifactPaths::new(project);

    let runner = ScriptedRunner::new(vec![failing_run(
        "FAILED tests/test_defects.py::test_list - AssertionError: GET /defects returned 404",
    )]);
    let outcome =
        fix_cycle(&runner, &NullAdvisor, &cycle_config(project, &paths, true)).expect("cycle");

    let apply = outcome.apply.expect("apply outcome");
    assert_eq!(apply.applied.len(), 1);

    let content = fs::read_to_string(project.join("app/api/router.py")).expect("read");
    assert!(content.contains("from app.api.routers.defects import router as defects_router"));
    assert!(content.contains("api_router.include_router(defects_router)"));
    // The existing health registration is untouched.
    assert!(content.contains("api_router.include_router(health_router)"));
}

#[test]
fn refix_after_successful_fix_plans_nothing() {
    let temp = tempfile::tempdir().expect("tempdir");
    let project = temp.path();
    fs::write(project.join("requirements.txt"), "fastapi\nhttpx\n").expect("seed");
    let paths = ArtifactPaths::new(project);

    // Same failing output, but the dependency is already listed.
    let runner = ScriptedRunner::new(vec![failing_run(MODULE_NOT_FOUND)]);
    let outcome =
        fix_cycle(&runner, &NullAdvisor, &cycle_config(project, &paths, true)).expect("cycle");

    let plan = outcome.plan.expect("plan");
    assert!(plan.is_empty());
    assert!(outcome.apply.is_none());
    assert_eq!(
        fs::read_to_string(project.join("requirements.txt")).expect("read"),
        "fastapi\nhttpx\n"
    );
}

#[test]
fn passing_run_skips_planning_and_fix_artifacts() {
    let temp = tempfile::tempdir().expect("tempdir");
    let project = temp.path();
    let paths = ArtifactPaths::new(project);

    let runner = ScriptedRunner::new(vec![passing_run()]);
    let outcome =
        fix_cycle(&runner, &NullAdvisor, &cycle_config(project, &paths, true)).expect("cycle");

    assert_eq!(outcome.run.status(), RunStatus::Pass);
    assert!(outcome.findings.is_empty());
    assert!(outcome.plan.is_none());
    assert!(outcome.artifacts.is_none());
    // Run artifacts are written even for passing runs; no failure prompt.
    assert!(outcome.run_artifacts.log_path.is_file());
    assert!(outcome.run_artifacts.prompt_path.is_none());
}
