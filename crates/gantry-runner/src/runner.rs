//! Executor configuration and output types.

use gantry_core::ids::InstanceKey;
use std::path::PathBuf;

/// Output line from a job's scripts.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub key: InstanceKey,
    pub stream: OutputStream,
    pub content: String,
    pub line_number: u32,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Output stream type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Configuration for script execution.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Directory scripts run in; artifact paths are relative to it.
    pub workspace: PathBuf,
    /// Shell invoked as `<shell> -c <line>`.
    pub shell: String,
    /// Pass the parent process environment through to scripts.
    pub inherit_env: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("."),
            shell: "sh".to_string(),
            inherit_env: true,
        }
    }
}

impl ExecutorConfig {
    pub fn in_workspace(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            ..Self::default()
        }
    }
}
