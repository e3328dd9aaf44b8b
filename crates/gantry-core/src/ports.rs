//! Port traits (hexagonal architecture).
//!
//! The scheduler depends only on these traits; adapters such as the shell
//! executor in `gantry-runner` implement them.

use crate::Result;
use crate::ids::{InstanceKey, RunId};
use crate::pipeline::ArtifactConfig;
use async_trait::async_trait;
use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;

/// Cooperative cancellation signal. Flips to `true` once when the job must stop.
pub type CancelSignal = watch::Receiver<bool>;

/// Everything an executor needs to run one attempt of a job instance.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobRequest {
    pub run_id: RunId,
    pub key: InstanceKey,
    pub job_name: String,
    #[serde(default)]
    pub stage: Option<String>,
    /// 1-based attempt number.
    pub attempt: u32,
    pub variables: IndexMap<String, String>,
    #[serde(default)]
    pub before_script: Vec<String>,
    pub script: Vec<String>,
    #[serde(default)]
    pub after_script: Vec<String>,
    #[serde(default)]
    pub artifacts: ArtifactConfig,
    /// Artifacts published by the instances this one needs.
    #[serde(default)]
    pub upstream_artifacts: Vec<ArtifactRecord>,
    #[serde(default)]
    pub timeout: Option<Duration>,
}

/// Artifact locations published by one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactRecord {
    pub instance: InstanceKey,
    pub paths: Vec<String>,
}

/// Result of one attempt that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JobOutcome {
    pub exit_code: i32,
    /// Declared artifact paths that exist.
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Declared artifact paths that were not produced.
    #[serde(default)]
    pub missing_artifacts: Vec<String>,
    /// Report files found, keyed by report type.
    #[serde(default)]
    pub reports: IndexMap<String, Vec<String>>,
}

impl JobOutcome {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: code,
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs a job's scripts. Implementations must observe `cancel` and return
/// promptly once it flips.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Execute one attempt. `Err` means the executor itself failed, not the job.
    async fn execute(&self, request: JobRequest, cancel: CancelSignal) -> Result<JobOutcome>;

    /// Executor name for logs.
    fn name(&self) -> &str;
}
