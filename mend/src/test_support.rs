//! Test-only helpers: step/run constructors and scripted collaborators.

use std::sync::Mutex;

use anyhow::Result;

use crate::core::types::{FixPlan, RunResult, Scope, StepResult, StepStatus};
use crate::io::advisor::{Advisor, AdvisorRequest};
use crate::io::executor::{RunRequest, VerifyRunner};

/// Create a deterministic step with the given status and output.
pub fn step(scope: Scope, name: &str, status: StepStatus, output: &str) -> StepResult {
    StepResult {
        scope,
        name: name.to_string(),
        command: vec!["true".to_string()],
        exit_code: match status {
            StepStatus::Pass => Some(0),
            StepStatus::Fail => Some(1),
            _ => None,
        },
        status,
        duration_ms: 1,
        output: output.to_string(),
    }
}

/// A run with a single passing backend step.
pub fn passing_run() -> RunResult {
    RunResult {
        steps: vec![step(Scope::Backend, "pytest", StepStatus::Pass, "1 passed")],
    }
}

/// A run with a single failing backend step carrying `output`.
pub fn failing_run(output: &str) -> RunResult {
    RunResult {
        steps: vec![step(Scope::Backend, "pytest", StepStatus::Fail, output)],
    }
}

/// Returns pre-scripted run results in sequence; repeats the last one once
/// the script is exhausted. Records how many runs were requested.
pub struct ScriptedRunner {
    script: Mutex<Vec<RunResult>>,
    calls: Mutex<u32>,
}

impl ScriptedRunner {
    pub fn new(script: Vec<RunResult>) -> Self {
        assert!(!script.is_empty(), "script needs at least one run result");
        let mut script = script;
        script.reverse();
        Self {
            script: Mutex::new(script),
            calls: Mutex::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        *self.calls.lock().expect("calls lock")
    }
}

impl VerifyRunner for ScriptedRunner {
    fn run(&self, _request: &RunRequest) -> Result<RunResult> {
        *self.calls.lock().expect("calls lock") += 1;
        let mut script = self.script.lock().expect("script lock");
        if script.len() > 1 {
            Ok(script.pop().expect("non-empty script"))
        } else {
            Ok(script[0].clone())
        }
    }
}

/// Always proposes the same plan (or nothing).
pub struct ScriptedAdvisor {
    plan: Option<FixPlan>,
}

impl ScriptedAdvisor {
    pub fn new(plan: Option<FixPlan>) -> Self {
        Self { plan }
    }
}

impl Advisor for ScriptedAdvisor {
    fn propose(&self, request: &AdvisorRequest<'_>) -> Result<Option<FixPlan>> {
        Ok(self.plan.clone().map(|mut plan| {
            plan.dry_run = request.dry_run;
            plan
        }))
    }
}
