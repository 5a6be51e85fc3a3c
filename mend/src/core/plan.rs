//! Rule-based fix planning: findings in, patch actions out.
//!
//! Each finding category maps to at most one pure content template. Templates
//! take the current file content and return the full post-fix content, or
//! `None` when the fix does not apply (already fixed, file missing, symbol
//! unused). A template that changes nothing produces no action, which is what
//! makes re-planning against already-fixed content yield an empty plan.

use std::path::{Component, Path, PathBuf};

use crate::core::types::{
    Finding, FindingCategory, FixPlan, PatchAction, PatchOp, PlanStrategy, ScopeSelection,
};

/// Origin regex accepted by the generated CORS middleware: localhost plus
/// private network ranges.
pub const CORS_ORIGIN_REGEX: &str = "https?://(localhost|127\\.0\\.0\\.1|192\\.168\\..*|10\\..*|172\\.(1[6-9]|2\\d|3[0-1])\\..*)";

/// Read access to project files at plan time.
///
/// Keeps the planner pure: orchestration implements this over the project
/// directory, tests over an in-memory map.
pub trait PlanContext {
    /// Content of a project-relative file, `None` if absent.
    fn read(&self, rel: &Path) -> Option<String>;
}

/// Build a rule-based fix plan from the findings of one failed run.
///
/// At most one action is produced per target file; later findings naming an
/// already-planned file are dropped so the applier's content guard stays
/// coherent within the plan.
pub fn build_plan(
    findings: &[Finding],
    ctx: &dyn PlanContext,
    scope: ScopeSelection,
    dry_run: bool,
) -> FixPlan {
    let mut plan = FixPlan::empty(scope, PlanStrategy::RuleBased, dry_run);
    for finding in findings {
        let Some(action) = action_for_finding(finding, ctx) else {
            continue;
        };
        if plan
            .actions
            .iter()
            .any(|existing| existing.target_file == action.target_file)
        {
            continue;
        }
        plan.actions.push(action);
    }
    plan
}

fn action_for_finding(finding: &Finding, ctx: &dyn PlanContext) -> Option<PatchAction> {
    match finding.category {
        FindingCategory::MissingDependency => plan_missing_dependency(finding, ctx),
        FindingCategory::MissingImport => plan_missing_import(finding, ctx),
        FindingCategory::CorsMisconfigured => plan_cors(finding, ctx),
        FindingCategory::RouteNotRegistered => plan_route_not_registered(finding, ctx),
        FindingCategory::AssertionFailure
        | FindingCategory::LintViolation
        | FindingCategory::Unknown => None,
    }
}

fn plan_missing_dependency(finding: &Finding, ctx: &dyn PlanContext) -> Option<PatchAction> {
    let module = finding.detail.as_deref()?;
    let target = PathBuf::from("requirements.txt");
    let old = ctx.read(&target);
    let new = append_requirement(old.as_deref(), module)?;
    let op = if old.is_some() {
        PatchOp::Insert
    } else {
        PatchOp::Create
    };
    Some(PatchAction {
        target_file: target,
        op,
        content: new,
        expected: old,
        rationale: finding.message.clone(),
        rule: "append-requirement".to_string(),
    })
}

fn plan_missing_import(finding: &Finding, ctx: &dyn PlanContext) -> Option<PatchAction> {
    let symbol = finding.detail.as_deref()?;
    let file = finding.location.as_ref()?.file.as_deref()?;
    let target = safe_relative(file)?;
    if target.extension().is_none_or(|ext| ext != "py") {
        return None;
    }
    let old = ctx.read(&target)?;
    let new = merge_fastapi_import(&old, symbol)?;
    Some(PatchAction {
        target_file: target,
        op: PatchOp::Insert,
        content: new,
        expected: Some(old),
        rationale: finding.message.clone(),
        rule: "fastapi-import".to_string(),
    })
}

fn plan_cors(finding: &Finding, ctx: &dyn PlanContext) -> Option<PatchAction> {
    let target = ["app/main.py", "main.py"]
        .iter()
        .map(PathBuf::from)
        .find(|candidate| ctx.read(candidate).is_some())?;
    let old = ctx.read(&target)?;
    let new = ensure_cors_middleware(&old)?;
    Some(PatchAction {
        target_file: target,
        op: PatchOp::Insert,
        content: new,
        expected: Some(old),
        rationale: finding.message.clone(),
        rule: "cors-middleware".to_string(),
    })
}

fn plan_route_not_registered(finding: &Finding, ctx: &dyn PlanContext) -> Option<PatchAction> {
    let path = finding.detail.as_deref()?;
    let resource = route_resource(path)?;
    let target = PathBuf::from("app/api/router.py");
    let old = ctx.read(&target)?;
    let new = ensure_router_include(&old, &resource)?;
    Some(PatchAction {
        target_file: target,
        op: PatchOp::Insert,
        content: new,
        expected: Some(old),
        rationale: finding.message.clone(),
        rule: "include-router".to_string(),
    })
}

/// Reject absolute paths and parent traversal in planner targets.
pub fn safe_relative(raw: &str) -> Option<PathBuf> {
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        return None;
    }
    if path
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        return None;
    }
    Some(path)
}

/// Append a module to a requirements file, `None` if already listed.
fn append_requirement(old: Option<&str>, module: &str) -> Option<String> {
    if let Some(old) = old {
        let listed = old.lines().any(|line| {
            let name = line
                .split(['=', '<', '>', '~', '[', ';', ' '])
                .next()
                .unwrap_or("")
                .trim();
            name.eq_ignore_ascii_case(module)
        });
        if listed {
            return None;
        }
        let mut new = old.to_string();
        if !new.is_empty() && !new.ends_with('\n') {
            new.push('\n');
        }
        new.push_str(module);
        new.push('\n');
        Some(new)
    } else {
        Some(format!("{module}\n"))
    }
}

/// Merge `symbol` into the file's `from fastapi import ...` line.
///
/// Returns `None` when the file never references the symbol or already
/// imports it. A missing import line is inserted after shebang, module
/// docstring, and `from __future__` imports.
fn merge_fastapi_import(content: &str, symbol: &str) -> Option<String> {
    if !content.contains(symbol) {
        return None;
    }
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();

    let import_line = lines
        .iter()
        .position(|line| line.starts_with("from fastapi import"));
    match import_line {
        Some(idx) => {
            let existing: Vec<String> = lines[idx]
                .split_once("import")
                .map(|(_, names)| names.split(',').map(|n| n.trim().to_string()).collect())
                .unwrap_or_default();
            if existing.iter().any(|name| name == symbol) {
                return None;
            }
            let mut merged = existing;
            merged.push(symbol.to_string());
            merged.sort();
            merged.dedup();
            lines[idx] = format!("from fastapi import {}", merged.join(", "));
        }
        None => {
            let insert_at = insertion_index(&lines);
            lines.insert(insert_at, format!("from fastapi import {symbol}"));
        }
    }
    Some(join_lines(lines))
}

/// Ensure a CORS middleware block with a permissive private-network origin
/// regex exists. `None` when the file already carries both.
fn ensure_cors_middleware(content: &str) -> Option<String> {
    if content.contains("CORSMiddleware") && content.contains("allow_origin_regex") {
        return None;
    }
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();

    if !content.contains("CORSMiddleware") {
        let insert_at = insertion_index(&lines);
        lines.insert(
            insert_at,
            "from fastapi.middleware.cors import CORSMiddleware".to_string(),
        );
    }

    if content.contains("app.add_middleware") && content.contains("CORSMiddleware") {
        // Middleware registered but without the origin regex: widen the
        // registration in place. The import line also names CORSMiddleware,
        // so anchor on the argument line, never the first mention.
        let mut updated = Vec::with_capacity(lines.len() + 1);
        let mut inserted = false;
        for line in lines {
            let is_registration =
                !inserted && line.contains("CORSMiddleware") && !line.contains("import");
            if is_registration && line.contains("add_middleware(") && line.contains(')') {
                // Single-line call: splice the kwarg into the argument list.
                updated.push(line.replacen(
                    "CORSMiddleware",
                    &format!("CORSMiddleware, allow_origin_regex=\"{CORS_ORIGIN_REGEX}\""),
                    1,
                ));
                inserted = true;
                continue;
            }
            updated.push(line);
            if is_registration {
                updated.push(format!("    allow_origin_regex=\"{CORS_ORIGIN_REGEX}\","));
                inserted = true;
            }
        }
        return Some(join_lines(updated));
    }

    lines.extend(
        [
            "",
            "app.add_middleware(",
            "    CORSMiddleware,",
            &format!("    allow_origin_regex=\"{CORS_ORIGIN_REGEX}\","),
            "    allow_credentials=False,",
            "    allow_methods=[\"*\"],",
            "    allow_headers=[\"*\"],",
            ")",
        ]
        .iter()
        .map(|line| line.to_string()),
    );
    Some(join_lines(lines))
}

/// First path segment as a Python module name, `None` when it is not one.
fn route_resource(path: &str) -> Option<String> {
    let segment = path.trim_start_matches('/').split('/').next()?;
    let is_module_name = segment
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && segment.starts_with(|c: char| c.is_ascii_lowercase());
    is_module_name.then(|| segment.to_string())
}

/// Ensure the aggregate router includes the resource's per-route router.
/// `None` when it already does.
fn ensure_router_include(content: &str, resource: &str) -> Option<String> {
    let alias = format!("{resource}_router");
    if content.contains(&format!("include_router({alias}")) {
        return None;
    }
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();

    if !content.contains(&alias) {
        let import = format!("from app.api.routers.{resource} import router as {alias}");
        match lines
            .iter()
            .rposition(|line| line.starts_with("from app.api.routers."))
        {
            Some(idx) => lines.insert(idx + 1, import),
            None => {
                let insert_at = insertion_index(&lines);
                lines.insert(insert_at, import);
            }
        }
    }

    // Register through the same variable the existing includes use.
    let registrar = lines
        .iter()
        .find_map(|line| {
            line.split_once(".include_router(")
                .map(|(head, _)| head.trim().to_string())
        })
        .unwrap_or_else(|| "api_router".to_string());
    let include = format!("{registrar}.include_router({alias})");
    match lines
        .iter()
        .rposition(|line| line.contains(".include_router("))
    {
        Some(idx) => lines.insert(idx + 1, include),
        None => lines.push(include),
    }
    Some(join_lines(lines))
}

/// Index after shebang, module docstring, and `from __future__` imports.
fn insertion_index(lines: &[String]) -> usize {
    let mut idx = 0;
    if lines.first().is_some_and(|line| line.starts_with("#!")) {
        idx = 1;
    }
    if idx < lines.len() {
        let trimmed = lines[idx].trim_start();
        if trimmed.starts_with("\"\"\"") || trimmed.starts_with("'''") {
            let quote = &trimmed[..3];
            let closed_on_open_line = trimmed.len() > 3 && trimmed[3..].contains(quote);
            idx += 1;
            if !closed_on_open_line {
                while idx < lines.len() {
                    let done = lines[idx].contains(quote);
                    idx += 1;
                    if done {
                        break;
                    }
                }
            }
        }
    }
    while idx < lines.len() && lines[idx].starts_with("from __future__ import") {
        idx += 1;
    }
    idx
}

fn join_lines(lines: Vec<String>) -> String {
    let mut joined = lines.join("\n");
    joined.push('\n');
    joined
}
