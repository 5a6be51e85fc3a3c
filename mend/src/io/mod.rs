//! Side-effecting modules: process execution, filesystem artifacts, patching,
//! locking, configuration. Everything deterministic lives in `core` instead.

pub mod advisor;
pub mod artifacts;
pub mod config;
pub mod executor;
pub mod generator;
pub mod lock;
pub mod patcher;
pub mod process;
