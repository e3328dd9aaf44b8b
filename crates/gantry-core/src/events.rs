//! Events emitted by the scheduler on every state change.

use crate::ids::{InstanceKey, RunId};
use crate::run::{CancelReason, FailureReason, JobStatus, PipelineStatus};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Run lifecycle
    RunStarted(RunStartedPayload),
    RunCompleted(RunCompletedPayload),
    RunSuperseded(RunSupersededPayload),

    // Job lifecycle
    JobStatusChanged(JobStatusChangedPayload),
    JobRetrying(JobRetryingPayload),

    // Manual gates
    ApprovalRequested(ApprovalPayload),
    ApprovalGranted(ApprovalPayload),
}

impl Event {
    pub fn run_id(&self) -> RunId {
        match self {
            Event::RunStarted(p) => p.run_id,
            Event::RunCompleted(p) => p.run_id,
            Event::RunSuperseded(p) => p.run_id,
            Event::JobStatusChanged(p) => p.run_id,
            Event::JobRetrying(p) => p.run_id,
            Event::ApprovalRequested(p) | Event::ApprovalGranted(p) => p.run_id,
        }
    }

    /// Dotted event name, e.g. `job.status_changed`.
    pub fn name(&self) -> &'static str {
        match self {
            Event::RunStarted(_) => "run.started",
            Event::RunCompleted(_) => "run.completed",
            Event::RunSuperseded(_) => "run.superseded",
            Event::JobStatusChanged(_) => "job.status_changed",
            Event::JobRetrying(_) => "job.retrying",
            Event::ApprovalRequested(_) => "approval.requested",
            Event::ApprovalGranted(_) => "approval.granted",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunStartedPayload {
    pub run_id: RunId,
    pub ref_name: String,
    pub instances: usize,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunCompletedPayload {
    pub run_id: RunId,
    pub status: PipelineStatus,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunSupersededPayload {
    pub run_id: RunId,
    pub superseded_by: RunId,
    pub ref_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobStatusChangedPayload {
    pub run_id: RunId,
    pub key: InstanceKey,
    pub from: JobStatus,
    pub to: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<CancelReason>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobRetryingPayload {
    pub run_id: RunId,
    pub key: InstanceKey,
    pub next_attempt: u32,
    pub failure: FailureReason,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ApprovalPayload {
    pub run_id: RunId,
    pub key: InstanceKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
}
