//! Shared plumbing for the binaries: CLI/env parsing and runtime wiring.

pub mod cli;
pub mod runner;
