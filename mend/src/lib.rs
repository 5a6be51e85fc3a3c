//! Validation loop for generated full-stack projects.
//!
//! `mend` drives a bounded run → diagnose → fix → run cycle over a generated
//! project until its test suite passes or no further progress is possible.
//! The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (diagnosis, fix planning).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (process execution, artifacts,
//!   patching, locking). Isolated to enable scripting in tests.
//!
//! Orchestration modules ([`run`], [`fix`], [`pipeline`]) coordinate core
//! logic with I/O to implement CLI commands.

pub mod core;
pub mod exit_codes;
pub mod fix;
pub mod io;
pub mod logging;
pub mod pipeline;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
