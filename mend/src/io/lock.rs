//! Advisory lock serializing mutating invocations on one project.

use std::fs::{File, OpenOptions};
use std::path::Path;

use anyhow::{Context, Result, bail};
use fs2::FileExt;
use tracing::debug;

/// Held for the lifetime of a `fix` or `pipeline` invocation. Dropping the
/// guard releases the OS lock; the lock file itself is left in place.
#[derive(Debug)]
pub struct ProjectLock {
    _file: File,
}

impl ProjectLock {
    /// Acquire the lock, failing immediately when another invocation holds it.
    pub fn acquire(lock_path: &Path) -> Result<Self> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(lock_path)
            .with_context(|| format!("open lock file {}", lock_path.display()))?;
        if file.try_lock_exclusive().is_err() {
            bail!(
                "another mend invocation is already running against this project ({})",
                lock_path.display()
            );
        }
        debug!(path = %lock_path.display(), "project lock acquired");
        Ok(Self { _file: file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_held() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lock_path = temp.path().join(".mend/lock");

        let held = ProjectLock::acquire(&lock_path).expect("first acquire");
        let err = ProjectLock::acquire(&lock_path).unwrap_err();
        assert!(err.to_string().contains("already running"));

        drop(held);
        ProjectLock::acquire(&lock_path).expect("acquire after release");
    }
}
