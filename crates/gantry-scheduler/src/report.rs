//! Execution report: terminal state of every instance and the pipeline verdict.

use chrono::{DateTime, Utc};
use gantry_core::Result;
use gantry_core::ids::{InstanceKey, RunId};
use gantry_core::pipeline::WhenPolicy;
use gantry_core::run::{CancelReason, FailureReason, JobStatus, PipelineStatus};
use gantry_core::trigger::EventSource;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub key: InstanceKey,
    pub name: String,
    #[serde(default)]
    pub stage: Option<String>,
    pub status: JobStatus,
    pub when: WhenPolicy,
    pub allow_failure: bool,
    pub attempts: u32,
    #[serde(default)]
    pub failure: Option<FailureReason>,
    #[serde(default)]
    pub cancel_reason: Option<CancelReason>,
    #[serde(default)]
    pub worker: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Test and other report files, keyed by report type.
    #[serde(default)]
    pub reports: IndexMap<String, Vec<String>>,
}

impl JobReport {
    pub fn new(
        key: InstanceKey,
        name: &str,
        stage: Option<String>,
        when: WhenPolicy,
        allow_failure: bool,
    ) -> Self {
        Self {
            key,
            name: name.to_string(),
            stage,
            status: JobStatus::Pending,
            when,
            allow_failure,
            attempts: 0,
            failure: None,
            cancel_reason: None,
            worker: None,
            started_at: None,
            finished_at: None,
            duration_ms: None,
            artifacts: Vec::new(),
            reports: IndexMap::new(),
        }
    }

    /// Failed and not allowed to fail.
    pub fn is_required_failure(&self) -> bool {
        self.status == JobStatus::Failed && !self.allow_failure
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub run_id: RunId,
    pub status: PipelineStatus,
    pub source: EventSource,
    pub ref_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Jobs in topological order.
    pub jobs: Vec<JobReport>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub succeeded: usize,
    pub failed: usize,
    pub canceled: usize,
    pub skipped: usize,
    pub manual: usize,
}

impl ExecutionReport {
    /// Failed if any required job failed, otherwise Canceled if the run was
    /// canceled, otherwise Succeeded. Pending manual jobs do not fail a run.
    pub fn aggregate_status(jobs: &[JobReport], canceled: bool) -> PipelineStatus {
        if jobs.iter().any(JobReport::is_required_failure) {
            PipelineStatus::Failed
        } else if canceled {
            PipelineStatus::Canceled
        } else {
            PipelineStatus::Succeeded
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }

    pub fn job(&self, key: &str) -> Option<&JobReport> {
        self.jobs.iter().find(|j| j.key.as_str() == key)
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for job in &self.jobs {
            match job.status {
                JobStatus::Succeeded => counts.succeeded += 1,
                JobStatus::Failed => counts.failed += 1,
                JobStatus::Canceled => counts.canceled += 1,
                JobStatus::Skipped => counts.skipped += 1,
                JobStatus::ManualPending => counts.manual += 1,
                _ => {}
            }
        }
        counts
    }

    /// Every test report path, across jobs.
    pub fn test_reports(&self) -> Vec<&str> {
        self.jobs
            .iter()
            .flat_map(|j| j.reports.values().flatten().map(String::as_str))
            .collect()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
