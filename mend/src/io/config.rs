//! Project configuration, loaded from `.mend/config.toml`.
//!
//! Every field has a default so a project with no config file still runs.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::plan::safe_relative;

pub const CONFIG_REL_PATH: &str = ".mend/config.toml";

fn config_path(project_dir: &Path) -> PathBuf {
    project_dir.join(CONFIG_REL_PATH)
}

const DEFAULT_STEP_TIMEOUT_SECONDS: u64 = 600;
const DEFAULT_MAX_ITERATIONS: u32 = 3;
const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MendConfig {
    /// Wall-clock cap per verification step.
    #[serde(default = "default_step_timeout_seconds")]
    pub step_timeout_seconds: u64,
    /// Pipeline iteration cap (run/fix cycles).
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Cap on captured stdout+stderr per step.
    #[serde(default = "default_output_limit_bytes")]
    pub output_limit_bytes: usize,
    /// Optional external advisor used when no rule produces a plan.
    #[serde(default)]
    pub advisor: Option<AdvisorConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdvisorConfig {
    /// Command argv; receives the failure prompt on stdin.
    pub command: Vec<String>,
    /// File, relative to the project root, where the advisor writes its
    /// plan. Must live under `.mend/` so the plan round-trip never touches
    /// project files.
    pub plan_file: String,
}

fn default_step_timeout_seconds() -> u64 {
    DEFAULT_STEP_TIMEOUT_SECONDS
}

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

fn default_output_limit_bytes() -> usize {
    DEFAULT_OUTPUT_LIMIT_BYTES
}

impl Default for MendConfig {
    fn default() -> Self {
        Self {
            step_timeout_seconds: default_step_timeout_seconds(),
            max_iterations: default_max_iterations(),
            output_limit_bytes: default_output_limit_bytes(),
            advisor: None,
        }
    }
}

impl MendConfig {
    /// Load `.mend/config.toml`, or fall back to defaults when the file does
    /// not exist.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = config_path(project_dir);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        };
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("parse {}", path.display()))?;
        config.validate()?;
        debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.step_timeout_seconds == 0 {
            bail!("step_timeout_seconds must be positive");
        }
        if self.max_iterations == 0 {
            bail!("max_iterations must be positive");
        }
        if self.output_limit_bytes == 0 {
            bail!("output_limit_bytes must be positive");
        }
        if let Some(advisor) = &self.advisor {
            if advisor.command.is_empty() {
                bail!("advisor.command must not be empty");
            }
            if advisor.plan_file.is_empty() {
                bail!("advisor.plan_file must not be empty");
            }
            let under_mend = safe_relative(&advisor.plan_file)
                .is_some_and(|rel| rel.starts_with(".mend"));
            if !under_mend {
                bail!("advisor.plan_file must be a relative path under .mend/");
            }
        }
        Ok(())
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_seconds)
    }

    /// Write the config atomically (temp file + rename in `.mend/`).
    pub fn save(&self, project_dir: &Path) -> Result<()> {
        self.validate()?;
        let path = config_path(project_dir);
        let parent = path
            .parent()
            .with_context(|| format!("config path has no parent {}", path.display()))?;
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        let contents = toml::to_string_pretty(self).context("serialize config")?;
        let tmp_path = path.with_extension("toml.tmp");
        fs::write(&tmp_path, contents).with_context(|| format!("write {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &path).with_context(|| format!("replace {}", path.display()))?;
        debug!(path = %path.display(), "config written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(project_dir: &Path, contents: &str) {
        let path = config_path(project_dir);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, contents).expect("write config");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = MendConfig::load(temp.path()).expect("load");
        assert_eq!(config, MendConfig::default());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_config(temp.path(), "max_iterations = 5\n");
        let config = MendConfig::load(temp.path()).expect("load");
        assert_eq!(config.max_iterations, 5);
        assert_eq!(config.step_timeout_seconds, DEFAULT_STEP_TIMEOUT_SECONDS);
    }

    #[test]
    fn advisor_table_parses() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_config(
            temp.path(),
            "[advisor]\ncommand = [\"my-advisor\", \"--json\"]\nplan_file = \".mend/advisor_plan.json\"\n",
        );
        let config = MendConfig::load(temp.path()).expect("load");
        let advisor = config.advisor.expect("advisor");
        assert_eq!(advisor.command, vec!["my-advisor", "--json"]);
        assert_eq!(advisor.plan_file, ".mend/advisor_plan.json");
    }

    #[test]
    fn plan_file_outside_mend_dir_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        for plan_file in ["plan.json", "../plan.json", "/tmp/plan.json", ".mend_plan.json"] {
            write_config(
                temp.path(),
                &format!("[advisor]\ncommand = [\"my-advisor\"]\nplan_file = \"{plan_file}\"\n"),
            );
            let err = MendConfig::load(temp.path()).unwrap_err();
            assert!(
                format!("{err:#}").contains("plan_file"),
                "expected plan_file rejection for {plan_file}"
            );
        }
    }

    #[test]
    fn zero_iterations_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_config(temp.path(), "max_iterations = 0\n");
        let err = MendConfig::load(temp.path()).unwrap_err();
        assert!(format!("{err:#}").contains("max_iterations"));
    }

    #[test]
    fn unknown_keys_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_config(temp.path(), "bogus = 1\n");
        assert!(MendConfig::load(temp.path()).is_err());
    }

    #[test]
    fn save_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = MendConfig {
            max_iterations: 7,
            ..MendConfig::default()
        };
        config.save(temp.path()).expect("save");
        let loaded = MendConfig::load(temp.path()).expect("load");
        assert_eq!(loaded, config);
    }
}
