//! Job instance and pipeline status types.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Eligible,
    ManualPending,
    Dispatched,
    Running,
    Succeeded,
    Failed,
    Canceled,
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled | JobStatus::Skipped
        )
    }

    /// Dispatched or running: a worker holds the instance.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Dispatched | JobStatus::Running)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Pending, Eligible | Skipped | Canceled) => true,
            (Eligible, Dispatched | ManualPending | Failed | Canceled | Skipped) => true,
            (ManualPending, Eligible | Canceled | Skipped) => true,
            (Dispatched, Running | Succeeded | Failed | Canceled | Eligible) => true,
            (Running, Succeeded | Failed | Canceled | Eligible) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Eligible => "eligible",
            JobStatus::ManualPending => "manual",
            JobStatus::Dispatched => "dispatched",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
            JobStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Why an instance failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    ExitCode { code: i32 },
    Timeout { seconds: u64 },
    ArtifactsMissing { paths: Vec<String> },
    NoMatchingRunner { tags: Vec<String> },
    ExecutorError { message: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ExitCode { code } => write!(f, "exit code {}", code),
            FailureReason::Timeout { seconds } => write!(f, "timed out after {}s", seconds),
            FailureReason::ArtifactsMissing { paths } => {
                write!(f, "artifacts missing: {}", paths.join(", "))
            }
            FailureReason::NoMatchingRunner { tags } => {
                write!(f, "no runner matches tags [{}]", tags.join(", "))
            }
            FailureReason::ExecutorError { message } => write!(f, "executor error: {}", message),
        }
    }
}

/// Why an instance was canceled or skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CancelReason {
    /// A required upstream instance failed.
    UpstreamFailed { upstream: String },
    /// Superseded by a newer run on the same concurrency group.
    Superseded,
    /// Canceled by an external request.
    Requested,
    /// Run finalized while a manual gate upstream was never approved.
    BlockedByManual { gate: String },
    /// `on_failure` job whose upstream all succeeded.
    NoUpstreamFailure,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::UpstreamFailed { upstream } => {
                write!(f, "upstream {} failed", upstream)
            }
            CancelReason::Superseded => f.write_str("superseded by a newer pipeline"),
            CancelReason::Requested => f.write_str("canceled by request"),
            CancelReason::BlockedByManual { gate } => {
                write!(f, "blocked by manual job {}", gate)
            }
            CancelReason::NoUpstreamFailure => f.write_str("no upstream failure"),
        }
    }
}

/// Aggregate status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl PipelineStatus {
    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineStatus::Succeeded => 0,
            PipelineStatus::Failed => 1,
            PipelineStatus::Canceled => 2,
            PipelineStatus::Running => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PipelineStatus::Running)
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineStatus::Running => "running",
            PipelineStatus::Succeeded => "succeeded",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Canceled => "canceled",
        };
        f.write_str(s)
    }
}
