//! Project scaffolding for the `generate` verb.
//!
//! A generator produces a project spec (directories plus a path→content map);
//! materializing it to disk is shared here so every generator gets the same
//! path-safety and overwrite rules.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::core::plan::safe_relative;
use crate::io::config::MendConfig;

/// What a generator wants written, before anything touches disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectSpec {
    pub name: String,
    pub directories: Vec<String>,
    /// Relative path → full file content. Ordered so materialization and
    /// logs are deterministic.
    pub files: BTreeMap<String, String>,
}

pub trait Generator {
    fn generate(&self, idea: &str, name: &str) -> Result<ProjectSpec>;
}

/// Built-in template: a minimal FastAPI service with a passing pytest suite,
/// ready for `mend run`.
pub struct ScaffoldGenerator;

impl Generator for ScaffoldGenerator {
    fn generate(&self, idea: &str, name: &str) -> Result<ProjectSpec> {
        let mut files = BTreeMap::new();
        files.insert(
            "requirements.txt".to_string(),
            "fastapi\nuvicorn\npytest\nhttpx\n".to_string(),
        );
        files.insert(
            "app/main.py".to_string(),
            "from fastapi import FastAPI\n\napp = FastAPI()\n\n\n@app.get(\"/health\")\ndef health():\n    return {\"status\": \"ok\"}\n\n\n@app.get(\"/\")\ndef root():\n    return {\"service\": \"ok\"}\n".to_string(),
        );
        files.insert("app/__init__.py".to_string(), String::new());
        files.insert(
            "tests/test_health.py".to_string(),
            "from fastapi.testclient import TestClient\n\nfrom app.main import app\n\nclient = TestClient(app)\n\n\ndef test_health():\n    response = client.get(\"/health\")\n    assert response.status_code == 200\n    assert response.json() == {\"status\": \"ok\"}\n".to_string(),
        );
        files.insert(
            "pytest.ini".to_string(),
            "[pytest]\ntestpaths = tests\n".to_string(),
        );
        files.insert(
            "README.md".to_string(),
            format!("# {name}\n\n{idea}\n\nRun the test suite with `mend run --path .`.\n"),
        );
        Ok(ProjectSpec {
            name: name.to_string(),
            directories: vec!["app".to_string(), "tests".to_string()],
            files,
        })
    }
}

/// Write a spec to `out_dir`. Existing files are refused unless `force`;
/// nothing escapes the output directory. A default `.mend/config.toml` is
/// seeded so later verbs run with explicit settings.
pub fn materialize(spec: &ProjectSpec, out_dir: &Path, force: bool) -> Result<()> {
    fs::create_dir_all(out_dir).with_context(|| format!("create {}", out_dir.display()))?;

    for dir in &spec.directories {
        let rel = safe_relative(dir).with_context(|| format!("unsafe directory path {dir}"))?;
        let path = out_dir.join(rel);
        fs::create_dir_all(&path).with_context(|| format!("create {}", path.display()))?;
    }

    for (rel, content) in &spec.files {
        let rel = safe_relative(rel).with_context(|| format!("unsafe file path {rel}"))?;
        let path = out_dir.join(&rel);
        if path.exists() && !force {
            bail!(
                "refusing to overwrite existing file {} (use --force)",
                path.display()
            );
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, content).with_context(|| format!("write {}", path.display()))?;
    }

    MendConfig::default().save(out_dir)?;
    info!(project = %spec.name, out = %out_dir.display(), files = spec.files.len(), "project generated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaffold_materializes_a_runnable_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = ScaffoldGenerator
            .generate("track reading lists", "bookworm")
            .expect("generate");
        materialize(&spec, temp.path(), false).expect("materialize");

        assert!(temp.path().join("app/main.py").exists());
        assert!(temp.path().join("tests/test_health.py").exists());
        assert!(temp.path().join("pytest.ini").exists());
        assert!(temp.path().join(".mend/config.toml").exists());
        let readme = fs::read_to_string(temp.path().join("README.md")).expect("read");
        assert!(readme.contains("bookworm"));
        assert!(readme.contains("track reading lists"));
    }

    #[test]
    fn existing_files_refused_without_force() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("requirements.txt"), "old\n").expect("seed");
        let spec = ScaffoldGenerator.generate("idea", "name").expect("generate");

        let err = materialize(&spec, temp.path(), false).unwrap_err();
        assert!(err.to_string().contains("--force"));
        assert_eq!(
            fs::read_to_string(temp.path().join("requirements.txt")).expect("read"),
            "old\n"
        );

        materialize(&spec, temp.path(), true).expect("materialize with force");
        assert_ne!(
            fs::read_to_string(temp.path().join("requirements.txt")).expect("read"),
            "old\n"
        );
    }

    #[test]
    fn escaping_paths_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut spec = ScaffoldGenerator.generate("idea", "name").expect("generate");
        spec.files
            .insert("../outside.txt".to_string(), "x".to_string());
        assert!(materialize(&spec, temp.path(), false).is_err());
    }
}
