//! Deterministic, pure logic shared by the mend core.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod diagnose;
pub mod plan;
pub mod types;
