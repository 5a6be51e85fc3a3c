//! Validation loop CLI for generated full-stack projects.
//!
//! `mend` runs a project's test suites, diagnoses failures, plans minimal
//! file patches, applies them with backups, and repeats up to an iteration
//! cap. All artifacts land under the project's `.mend/` directory.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};

use mend::core::types::ScopeSelection;
use mend::fix::{FixOptions, fix_verb};
use mend::io::generator::{Generator, ScaffoldGenerator, materialize};
use mend::pipeline::{PipelineOptions, pipeline_verb};
use mend::run::{RunOptions, run_verb};
use mend::{exit_codes, logging};

#[derive(Parser)]
#[command(
    name = "mend",
    version,
    about = "Run, diagnose, and fix generated projects until their tests pass"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a minimal runnable project scaffold.
    Generate {
        /// One-line description of the project.
        #[arg(long)]
        idea: String,
        /// Project name; defaults to a name derived from the idea.
        #[arg(long)]
        name: Option<String>,
        /// Scaffold template.
        #[arg(long, default_value = "fastapi-min")]
        template: Template,
        /// Output directory.
        #[arg(long, default_value = ".")]
        out: PathBuf,
        /// Overwrite existing files.
        #[arg(long)]
        force: bool,
    },
    /// Run the verification steps once.
    Run {
        #[command(flatten)]
        common: CommonArgs,
        /// Run both scopes (the default).
        #[arg(long, conflicts_with_all = ["backend_only", "frontend_only"])]
        all: bool,
        /// Run only the backend scope.
        #[arg(long, conflicts_with = "frontend_only")]
        backend_only: bool,
        /// Run only the frontend scope.
        #[arg(long)]
        frontend_only: bool,
        /// Also write a machine-readable run summary.
        #[arg(long)]
        json_summary: bool,
    },
    /// One run → diagnose → plan (→ apply) cycle.
    Fix {
        #[command(flatten)]
        common: CommonArgs,
        #[arg(long, value_enum, default_value = "all")]
        scope: ScopeArg,
        /// Apply the plan. Without this flag the cycle is a dry run.
        #[arg(long)]
        apply: bool,
        /// Fall back to the configured advisor when no rule matches.
        #[arg(long)]
        advisor: bool,
    },
    /// Loop run → fix → run until the tests pass or the cap is reached.
    Pipeline {
        #[command(flatten)]
        common: CommonArgs,
        #[arg(long, value_enum, default_value = "all")]
        scope: ScopeArg,
        /// Apply plans between runs. Without this flag the pipeline stops
        /// PARTIAL at the first dry-run plan.
        #[arg(long)]
        apply: bool,
        /// Override the configured iteration cap.
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Fall back to the configured advisor when no rule matches.
        #[arg(long)]
        advisor: bool,
    },
}

#[derive(Args)]
struct CommonArgs {
    /// Project directory.
    #[arg(long, default_value = ".")]
    path: PathBuf,
    /// Skip the frontend dependency install step.
    #[arg(long)]
    no_install: bool,
    /// Per-step timeout in seconds; overrides the configured value.
    #[arg(long)]
    timeout: Option<u64>,
}

impl CommonArgs {
    fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ScopeArg {
    All,
    Backend,
    Frontend,
}

impl From<ScopeArg> for ScopeSelection {
    fn from(arg: ScopeArg) -> Self {
        match arg {
            ScopeArg::All => ScopeSelection::All,
            ScopeArg::Backend => ScopeSelection::BackendOnly,
            ScopeArg::Frontend => ScopeSelection::FrontendOnly,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Template {
    /// Minimal FastAPI service with a pytest suite.
    FastapiMin,
}

fn main() {
    logging::init();
    let code = match dispatch() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::CONFIG
        }
    };
    std::process::exit(code);
}

fn dispatch() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Generate {
            idea,
            name,
            template: Template::FastapiMin,
            out,
            force,
        } => cmd_generate(&idea, name.as_deref(), &out, force),
        Command::Run {
            common,
            all: _,
            backend_only,
            frontend_only,
            json_summary,
        } => {
            let selection = if backend_only {
                ScopeSelection::BackendOnly
            } else if frontend_only {
                ScopeSelection::FrontendOnly
            } else {
                ScopeSelection::All
            };
            run_verb(&RunOptions {
                project_dir: common.path.clone(),
                selection,
                skip_install: common.no_install,
                timeout: common.timeout(),
                json_summary,
            })
        }
        Command::Fix {
            common,
            scope,
            apply,
            advisor,
        } => fix_verb(&FixOptions {
            project_dir: common.path.clone(),
            selection: scope.into(),
            apply,
            timeout: common.timeout(),
            use_advisor: advisor,
            skip_install: common.no_install,
        }),
        Command::Pipeline {
            common,
            scope,
            apply,
            max_iterations,
            advisor,
        } => pipeline_verb(&PipelineOptions {
            project_dir: common.path.clone(),
            selection: scope.into(),
            apply,
            max_iterations,
            timeout: common.timeout(),
            use_advisor: advisor,
            skip_install: common.no_install,
        }),
    }
}

fn cmd_generate(idea: &str, name: Option<&str>, out: &std::path::Path, force: bool) -> Result<i32> {
    let name = match name {
        Some(name) => name.to_string(),
        None => derive_name(idea),
    };
    let spec = ScaffoldGenerator.generate(idea, &name)?;
    materialize(&spec, out, force)?;
    println!("generated {} in {}", spec.name, out.display());
    Ok(exit_codes::OK)
}

/// A slug from the first few words of the idea.
fn derive_name(idea: &str) -> String {
    let slug: String = idea
        .split_whitespace()
        .take(3)
        .collect::<Vec<_>>()
        .join("-")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect::<String>()
        .to_ascii_lowercase();
    if slug.is_empty() {
        "mend-project".to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_flags_parse() {
        let cli = Cli::try_parse_from([
            "mend",
            "run",
            "--path",
            "/tmp/project",
            "--backend-only",
            "--timeout",
            "30",
            "--json-summary",
        ])
        .expect("parse");
        match cli.command {
            Command::Run {
                common,
                backend_only,
                json_summary,
                ..
            } => {
                assert_eq!(common.path, PathBuf::from("/tmp/project"));
                assert!(backend_only);
                assert!(json_summary);
                assert_eq!(common.timeout(), Some(Duration::from_secs(30)));
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn conflicting_scope_flags_rejected() {
        assert!(Cli::try_parse_from(["mend", "run", "--backend-only", "--frontend-only"]).is_err());
    }

    #[test]
    fn pipeline_flags_parse() {
        let cli = Cli::try_parse_from([
            "mend",
            "pipeline",
            "--path",
            "p",
            "--apply",
            "--max-iterations",
            "5",
            "--scope",
            "backend",
        ])
        .expect("parse");
        match cli.command {
            Command::Pipeline {
                apply,
                max_iterations,
                scope,
                ..
            } => {
                assert!(apply);
                assert_eq!(max_iterations, Some(5));
                assert!(matches!(scope, ScopeArg::Backend));
            }
            _ => panic!("expected pipeline command"),
        }
    }

    #[test]
    fn derive_name_slugs_the_idea() {
        assert_eq!(derive_name("Track my reading lists"), "track-my-reading");
        assert_eq!(derive_name("???"), "mend-project");
    }
}
