//! Script execution for Gantry jobs.

pub mod artifacts;
pub mod runner;
pub mod shell;

pub use artifacts::{ArtifactScan, collect_reports, verify_paths};
pub use runner::{ExecutorConfig, OutputLine, OutputStream};
pub use shell::ShellExecutor;
