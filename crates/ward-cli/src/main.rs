//! # ward CLI
//!
//! Command-line interface for ward: preflight checks, guarded runs and
//! quick-fixes, the host write gate, and per-file knowledge.
//!
//! Run `ward --help` for usage information.

mod cli;
pub mod ui;

use std::process::ExitCode;

fn main() -> ExitCode {
    cli::run()
}
