//! Stable exit codes for mend CLI commands.

/// Command succeeded; for `run`/`fix`/`pipeline`, verification passed.
pub const OK: i32 = 0;
/// Verification failed, or the pipeline ended PARTIAL/FAILED/NO_CHANGE.
pub const VERIFY_FAILED: i32 = 1;
/// Invalid arguments, project path, or configuration.
pub const CONFIG: i32 = 2;
/// Required external toolchain missing or other environment failure.
pub const ENVIRONMENT: i32 = 3;
